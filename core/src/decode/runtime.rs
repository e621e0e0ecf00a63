//! The decoder runtime: the `wait`/`put` scanner every concrete decoder
//! drives, plus the shared annotation and option types.

use std::collections::HashMap;

/// Edge condition a `wait` clause evaluates against one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Low,
    High,
    Rising,
    Falling,
    Edge,
    Stable,
    Skip,
}

/// One `wait` call's conditions: either a single mapping (all clauses
/// must hold) or several (first satisfied wins).
pub type WaitConditions = Vec<HashMap<usize, EdgeKind>>;

/// Build a single all-must-match condition set.
pub fn all_of(clauses: impl IntoIterator<Item = (usize, EdgeKind)>) -> WaitConditions {
    vec![clauses.into_iter().collect()]
}

/// Build a first-match-wins condition set from several mappings.
pub fn any_of(mappings: impl IntoIterator<Item = HashMap<usize, EdgeKind>>) -> WaitConditions {
    mappings.into_iter().collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecoderError {
    #[error("end of samples")]
    EndOfSamples,
    #[error("missing required channel: {0}")]
    MissingRequiredChannel(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("decoder not found: {0}")]
    DecoderNotFound(String),
}

pub type DecoderResult<T> = Result<T, DecoderError>;

/// What matched on a successful `wait`.
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub sample_index: usize,
    pub pins: Vec<u8>,
    pub matched_index: usize,
}

/// A decoded annotation: a labeled span over `[start_sample, end_sample)`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Annotation {
    pub start_sample: usize,
    pub end_sample: usize,
    pub annotation_type_index: usize,
    pub values: Vec<String>,
    pub raw_data: Option<f64>,
}

/// The mutable scanner owning `(sample_index, last_pins, current_pins,
/// results)`. Each concrete decoder drives one of these through its
/// `decode()` entry point.
pub struct Scanner<'a> {
    channels: &'a [&'a [u8]],
    sample_index: isize,
    last_pins: Vec<u8>,
    current_pins: Vec<u8>,
    results: Vec<Annotation>,
}

impl<'a> Scanner<'a> {
    pub fn new(channels: &'a [&'a [u8]]) -> Self {
        let width = channels.len();
        Self {
            channels,
            sample_index: -1,
            last_pins: vec![0; width],
            current_pins: vec![0; width],
            results: Vec::new(),
        }
    }

    fn sample_len(&self) -> usize {
        self.channels.iter().map(|c| c.len()).max().unwrap_or(0)
    }

    fn pins_at(&self, index: usize) -> Vec<u8> {
        self.channels
            .iter()
            .map(|c| c.get(index).copied().unwrap_or(0))
            .collect()
    }

    fn clause_matches(&self, channel_index: usize, edge: EdgeKind) -> bool {
        let last = self.last_pins.get(channel_index).copied().unwrap_or(0);
        let current = self.current_pins.get(channel_index).copied().unwrap_or(0);
        match edge {
            EdgeKind::Low => current == 0,
            EdgeKind::High => current == 1,
            EdgeKind::Rising => last == 0 && current == 1,
            EdgeKind::Falling => last == 1 && current == 0,
            EdgeKind::Edge => last != current,
            EdgeKind::Stable => last == current,
            EdgeKind::Skip => true,
        }
    }

    fn mapping_matches(&self, mapping: &HashMap<usize, EdgeKind>) -> bool {
        mapping.iter().all(|(&ch, &edge)| self.clause_matches(ch, edge))
    }

    /// Advance and test `conditions`. A lone `{0: Skip}` is a fast path
    /// returning the current state without advancing.
    pub fn wait(&mut self, conditions: &WaitConditions) -> DecoderResult<WaitOutcome> {
        if conditions.len() == 1 && conditions[0].len() == 1 {
            if let Some((&ch, &EdgeKind::Skip)) = conditions[0].iter().next() {
                let _ = ch;
                if self.sample_index < 0 {
                    self.advance()?;
                }
                return Ok(WaitOutcome {
                    sample_index: self.sample_index as usize,
                    pins: self.current_pins.clone(),
                    matched_index: 0,
                });
            }
        }

        loop {
            self.advance()?;
            for (idx, mapping) in conditions.iter().enumerate() {
                if self.mapping_matches(mapping) {
                    return Ok(WaitOutcome {
                        sample_index: self.sample_index as usize,
                        pins: self.current_pins.clone(),
                        matched_index: idx,
                    });
                }
            }
        }
    }

    fn advance(&mut self) -> DecoderResult<()> {
        let next = self.sample_index + 1;
        if next as usize >= self.sample_len() {
            return Err(DecoderError::EndOfSamples);
        }
        self.last_pins = std::mem::replace(&mut self.current_pins, self.pins_at(next as usize));
        self.sample_index = next;
        Ok(())
    }

    pub fn sample_index(&self) -> usize {
        self.sample_index.max(0) as usize
    }

    pub fn current_pins(&self) -> &[u8] {
        &self.current_pins
    }

    /// Read the pin levels at sample 0 without advancing the scanner. For
    /// decoders that need to know the pre-existing state of a line (e.g. CS)
    /// before the first `wait()`, since `current_pins()` is all-zero until
    /// `advance()` has run at least once.
    pub fn peek_initial_pins(&self) -> Vec<u8> {
        self.pins_at(0)
    }

    /// Append a result. Implementers must supply starts in monotonic
    /// non-decreasing order; the runtime enforces it.
    pub fn put(&mut self, start: usize, end: usize, annotation_type_index: usize, values: Vec<String>, raw_data: Option<f64>) {
        assert!(start <= end, "annotation start must be <= end");
        if let Some(last) = self.results.last() {
            assert!(
                last.start_sample <= start,
                "annotations must be emitted in monotonic non-decreasing start order"
            );
        }
        self.results.push(Annotation {
            start_sample: start,
            end_sample: end,
            annotation_type_index,
            values,
            raw_data,
        });
    }

    pub fn into_results(self) -> Vec<Annotation> {
        self.results
    }

    pub fn results(&self) -> &[Annotation] {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_fast_path_does_not_advance_from_start() {
        let scl: Vec<u8> = vec![1, 1, 0, 0];
        let channels: Vec<&[u8]> = vec![&scl];
        let mut scanner = Scanner::new(&channels);
        let out = scanner.wait(&all_of([(0, EdgeKind::Skip)])).unwrap();
        assert_eq!(out.sample_index, 0);
    }

    #[test]
    fn rising_edge_detection() {
        let line: Vec<u8> = vec![0, 0, 1, 1];
        let channels: Vec<&[u8]> = vec![&line];
        let mut scanner = Scanner::new(&channels);
        let out = scanner.wait(&all_of([(0, EdgeKind::Rising)])).unwrap();
        assert_eq!(out.sample_index, 2);
    }

    #[test]
    fn end_of_samples_when_no_match() {
        let line: Vec<u8> = vec![0, 0, 0];
        let channels: Vec<&[u8]> = vec![&line];
        let mut scanner = Scanner::new(&channels);
        let err = scanner.wait(&all_of([(0, EdgeKind::Rising)])).unwrap_err();
        assert_eq!(err, DecoderError::EndOfSamples);
    }

    #[test]
    fn first_matching_mapping_wins() {
        let a: Vec<u8> = vec![0, 1, 0];
        let b: Vec<u8> = vec![0, 0, 1];
        let channels: Vec<&[u8]> = vec![&a, &b];
        let mut scanner = Scanner::new(&channels);
        let conditions = any_of([
            HashMap::from([(0usize, EdgeKind::Rising)]),
            HashMap::from([(1usize, EdgeKind::Rising)]),
        ]);
        let out = scanner.wait(&conditions).unwrap();
        assert_eq!(out.matched_index, 0);
        assert_eq!(out.sample_index, 1);
    }
}
