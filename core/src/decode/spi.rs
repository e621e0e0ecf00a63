//! SPI decoder: CPOL/CPHA sampling-edge selection, CS framing, and word
//! assembly with configurable bit order and word size.

use std::collections::HashMap;

use super::runtime::{Annotation, DecoderError, DecoderResult, EdgeKind, Scanner};

pub const CLK: usize = 0;
pub const MISO: usize = 1;
pub const MOSI: usize = 2;
pub const CS: usize = 3;

pub const ANN_MISO_DATA: usize = 0;
pub const ANN_MOSI_DATA: usize = 1;
pub const ANN_MISO_BIT: usize = 2;
pub const ANN_MOSI_BIT: usize = 3;
pub const ANN_MISO_TRANSFER: usize = 4;
pub const ANN_MOSI_TRANSFER: usize = 5;
pub const ANN_CS_CHANGE: usize = 6;
pub const ANN_WARNING: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

impl BitOrder {
    pub fn from_option(value: &str) -> DecoderResult<Self> {
        match value {
            "msb-first" => Ok(Self::MsbFirst),
            "lsb-first" => Ok(Self::LsbFirst),
            other => Err(DecoderError::InvalidOption(format!("bitorder: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpiOptions {
    pub cpol: u8,
    pub cpha: u8,
    pub word_size: u8,
    pub bit_order: BitOrder,
    pub cs_active_low: bool,
}

impl Default for SpiOptions {
    fn default() -> Self {
        Self {
            cpol: 0,
            cpha: 0,
            word_size: 8,
            bit_order: BitOrder::MsbFirst,
            cs_active_low: true,
        }
    }
}

impl SpiOptions {
    /// Which clock transition samples data, per the standard CPOL/CPHA table.
    fn sample_edge(&self) -> EdgeKind {
        match (self.cpol, self.cpha) {
            (0, 0) => EdgeKind::Rising,
            (0, 1) => EdgeKind::Falling,
            (1, 0) => EdgeKind::Falling,
            (1, 1) => EdgeKind::Rising,
            _ => EdgeKind::Rising,
        }
    }

    fn cs_asserted(&self, level: u8) -> bool {
        if self.cs_active_low {
            level == 0
        } else {
            level == 1
        }
    }
}

#[derive(Default)]
struct Line {
    bits: Vec<u8>,
    bit_starts: Vec<usize>,
    bit_ann: usize,
    word_ann: usize,
    transfer_ann: usize,
    transfer_bytes: Vec<String>,
    transfer_start: Option<usize>,
}

impl Line {
    fn new(bit_ann: usize, word_ann: usize, transfer_ann: usize) -> Self {
        Self { bit_ann, word_ann, transfer_ann, ..Default::default() }
    }

    fn reset_word(&mut self) {
        self.bits.clear();
        self.bit_starts.clear();
    }

    fn reset_transfer(&mut self) {
        self.transfer_bytes.clear();
        self.transfer_start = None;
    }
}

/// Decode SPI traffic from `channels = [CLK, MISO, MOSI, CS]`. MISO/MOSI/CS
/// may be absent: pass a zero-length slice. At least one of MISO/MOSI must
/// be present.
pub fn decode(channels: &[&[u8]], opts: SpiOptions) -> DecoderResult<Vec<Annotation>> {
    if channels.is_empty() || channels[CLK].is_empty() {
        return Err(DecoderError::MissingRequiredChannel("CLK".to_string()));
    }
    let has_miso = channels.len() > MISO && !channels[MISO].is_empty();
    let has_mosi = channels.len() > MOSI && !channels[MOSI].is_empty();
    if !has_miso && !has_mosi {
        return Err(DecoderError::InvalidOption("MISO or MOSI required".to_string()));
    }
    let has_cs = channels.len() > CS && !channels[CS].is_empty();

    let mut scanner = Scanner::new(channels);
    let sample_edge = opts.sample_edge();

    let mut miso = Line::new(ANN_MISO_BIT, ANN_MISO_DATA, ANN_MISO_TRANSFER);
    let mut mosi = Line::new(ANN_MOSI_BIT, ANN_MOSI_DATA, ANN_MOSI_TRANSFER);

    let mut transfer_active;
    if has_cs {
        let cs_level = scanner.peek_initial_pins().get(CS).copied().unwrap_or(0);
        transfer_active = opts.cs_asserted(cs_level);
        if transfer_active {
            scanner.put(0, 0, ANN_CS_CHANGE, vec!["asserted".to_string()], None);
        }
    } else {
        transfer_active = true;
        // No CS line: emit a synthetic CS-change at the start so downstream
        // consumers still see framing.
        scanner.put(0, 0, ANN_CS_CHANGE, vec!["asserted".to_string()], None);
    }

    // CLK is listed before CS so that when a CS deassertion lands on the
    // same sample as the word's final clock edge, the bit is sampled and
    // the word/transfer are flushed before the CS transition is handled --
    // otherwise the coincident CS edge would win the wait() race and the
    // final bit would never reach the line.
    let conditions: Vec<HashMap<usize, EdgeKind>> = if has_cs {
        vec![HashMap::from([(CLK, sample_edge)]), HashMap::from([(CS, EdgeKind::Edge)])]
    } else {
        vec![HashMap::from([(CLK, sample_edge)])]
    };
    let clk_branch = 0usize;
    let cs_branch = if has_cs { 1usize } else { usize::MAX };

    loop {
        let outcome = match scanner.wait(&conditions) {
            Ok(o) => o,
            Err(DecoderError::EndOfSamples) => break,
            Err(e) => return Err(e),
        };

        if outcome.matched_index == clk_branch {
            if transfer_active {
                if has_mosi {
                    mosi.bits.push(outcome.pins[MOSI]);
                    mosi.bit_starts.push(outcome.sample_index);
                }
                if has_miso {
                    miso.bits.push(outcome.pins[MISO]);
                    miso.bit_starts.push(outcome.sample_index);
                }

                let mosi_done = has_mosi && mosi.bits.len() == opts.word_size as usize;
                let miso_done = has_miso && miso.bits.len() == opts.word_size as usize;
                if mosi_done || miso_done {
                    flush_words(&mut scanner, &mut mosi, &mut miso, mosi_done, miso_done, outcome.sample_index, opts);
                }
            }
            if has_cs {
                let now_active = opts.cs_asserted(outcome.pins[CS]);
                if now_active != transfer_active {
                    handle_cs_transition(&mut scanner, now_active, outcome.sample_index, &mut transfer_active, &mut miso, &mut mosi);
                }
            }
            continue;
        }

        if outcome.matched_index == cs_branch {
            let now_active = opts.cs_asserted(outcome.pins[CS]);
            if now_active != transfer_active {
                handle_cs_transition(&mut scanner, now_active, outcome.sample_index, &mut transfer_active, &mut miso, &mut mosi);
            }
            continue;
        }
    }

    // Unterminated trailing transfer (no CS, or CS never deasserted).
    emit_transfer(&mut scanner, &mut miso);
    emit_transfer(&mut scanner, &mut mosi);

    Ok(scanner.into_results())
}

/// Emit the completed word(s) and their per-bit annotations, interleaved
/// bit-by-bit across lines so the put() sequence stays chronological even
/// when MOSI and MISO both complete a word on the same clock edge.
fn flush_words(
    scanner: &mut Scanner<'_>,
    mosi: &mut Line,
    miso: &mut Line,
    mosi_done: bool,
    miso_done: bool,
    sample_index: usize,
    opts: SpiOptions,
) {
    if mosi_done {
        let word = assemble(&mosi.bits, opts.bit_order);
        scanner.put(mosi.bit_starts[0], sample_index, mosi.word_ann, vec![format!("0x{word:02X}")], None);
    }
    if miso_done {
        let word = assemble(&miso.bits, opts.bit_order);
        scanner.put(miso.bit_starts[0], sample_index, miso.word_ann, vec![format!("0x{word:02X}")], None);
    }

    let word_size = if mosi_done { mosi.bits.len() } else { miso.bits.len() };
    for i in 0..word_size {
        if mosi_done {
            let end = if i + 1 < mosi.bit_starts.len() { mosi.bit_starts[i + 1] } else { sample_index };
            scanner.put(mosi.bit_starts[i], end, mosi.bit_ann, vec![mosi.bits[i].to_string()], None);
        }
        if miso_done {
            let end = if i + 1 < miso.bit_starts.len() { miso.bit_starts[i + 1] } else { sample_index };
            scanner.put(miso.bit_starts[i], end, miso.bit_ann, vec![miso.bits[i].to_string()], None);
        }
    }

    if mosi_done {
        let word = assemble(&mosi.bits, opts.bit_order);
        mosi.transfer_start.get_or_insert(mosi.bit_starts[0]);
        mosi.transfer_bytes.push(format!("{word:02X}"));
        mosi.reset_word();
    }
    if miso_done {
        let word = assemble(&miso.bits, opts.bit_order);
        miso.transfer_start.get_or_insert(miso.bit_starts[0]);
        miso.transfer_bytes.push(format!("{word:02X}"));
        miso.reset_word();
    }
}

/// Handle a CS assert/deassert at `sample_index`. On deassert, any
/// completed words must be flushed as a transfer annotation *before* the
/// mid-word warning is pushed: `emit_transfer`'s start is the first word of
/// the transfer, while a mid-word warning's start is the (later) incomplete
/// trailing word's start, so emitting in that order keeps `put()` calls
/// chronological.
fn handle_cs_transition(
    scanner: &mut Scanner<'_>,
    now_active: bool,
    sample_index: usize,
    transfer_active: &mut bool,
    miso: &mut Line,
    mosi: &mut Line,
) {
    if now_active {
        scanner.put(sample_index, sample_index, ANN_CS_CHANGE, vec!["asserted".to_string()], None);
        *transfer_active = true;
        miso.reset_word();
        mosi.reset_word();
        miso.reset_transfer();
        mosi.reset_transfer();
    } else {
        emit_transfer(scanner, miso);
        emit_transfer(scanner, mosi);
        warn_if_mid_word(scanner, miso);
        warn_if_mid_word(scanner, mosi);
        scanner.put(sample_index, sample_index, ANN_CS_CHANGE, vec!["deasserted".to_string()], None);
        *transfer_active = false;
        miso.reset_word();
        mosi.reset_word();
    }
}

fn warn_if_mid_word(scanner: &mut Scanner<'_>, line: &Line) {
    if !line.bits.is_empty() {
        let start = line.bit_starts[0];
        let end = *line.bit_starts.last().unwrap();
        scanner.put(start, end, ANN_WARNING, vec!["CS# was deasserted during this data word!".to_string()], None);
    }
}

fn emit_transfer(scanner: &mut Scanner<'_>, line: &mut Line) {
    if !line.transfer_bytes.is_empty() {
        let label = line.transfer_bytes.join(" ");
        let start = line.transfer_start.unwrap_or(0);
        let end = scanner.sample_index();
        scanner.put(start.min(end), end, line.transfer_ann, vec![label], None);
        line.reset_transfer();
    }
}

fn assemble(bits: &[u8], order: BitOrder) -> u32 {
    match order {
        BitOrder::MsbFirst => bits.iter().fold(0u32, |acc, &b| (acc << 1) | b as u32),
        BitOrder::LsbFirst => bits.iter().rev().fold(0u32, |acc, &b| (acc << 1) | b as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One clock period per bit: CLK low, then high (rising-edge sample
    /// for mode 0), MOSI/MISO held constant across the period.
    fn mode0_byte(mosi: u8, miso: u8) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let mut clk = Vec::new();
        let mut mosi_line = Vec::new();
        let mut miso_line = Vec::new();
        for i in (0..8).rev() {
            let mbit = (mosi >> i) & 1;
            let sbit = (miso >> i) & 1;
            clk.extend([0, 1]);
            mosi_line.extend([mbit, mbit]);
            miso_line.extend([sbit, sbit]);
        }
        (clk, mosi_line, miso_line)
    }

    #[test]
    fn mode0_single_byte_transfer() {
        // CPOL=0 CPHA=0 MSB-first wordsize=8, CS asserted low throughout,
        // MISO=0xA5 MOSI=0x3C clocked by eight rising edges: per spec §8
        // scenario 4, expect one miso-data 0xA5, one mosi-data 0x3C, eight
        // MISO + eight MOSI bit annotations, and on CS deassert a
        // miso-transfer "A5" and mosi-transfer "3C".
        let (clk, mosi, miso) = mode0_byte(0x3C, 0xA5);
        let mut cs = vec![0u8; clk.len()];
        cs[clk.len() - 1] = 1; // deassert at the very end
        let channels: Vec<&[u8]> = vec![&clk, &miso, &mosi, &cs];

        let annotations = decode(&channels, SpiOptions::default()).unwrap();

        let miso_word = annotations.iter().find(|a| a.annotation_type_index == ANN_MISO_DATA).unwrap();
        assert_eq!(miso_word.values[0], "0xA5");
        let mosi_word = annotations.iter().find(|a| a.annotation_type_index == ANN_MOSI_DATA).unwrap();
        assert_eq!(mosi_word.values[0], "0x3C");

        assert_eq!(annotations.iter().filter(|a| a.annotation_type_index == ANN_MISO_BIT).count(), 8);
        assert_eq!(annotations.iter().filter(|a| a.annotation_type_index == ANN_MOSI_BIT).count(), 8);

        let miso_transfer = annotations.iter().find(|a| a.annotation_type_index == ANN_MISO_TRANSFER).unwrap();
        assert_eq!(miso_transfer.values[0], "A5");
        let mosi_transfer = annotations.iter().find(|a| a.annotation_type_index == ANN_MOSI_TRANSFER).unwrap();
        assert_eq!(mosi_transfer.values[0], "3C");
    }

    #[test]
    fn cs_deassert_mid_word_warns() {
        let (clk, mosi, miso) = mode0_byte(0xFF, 0x00);
        let mut cs = vec![0u8; clk.len()];
        // deassert partway through the word (after 3 bits = 6 samples)
        for v in cs.iter_mut().skip(6) {
            *v = 1;
        }
        let channels: Vec<&[u8]> = vec![&clk, &miso, &mosi, &cs];
        let annotations = decode(&channels, SpiOptions::default()).unwrap();
        assert!(annotations.iter().any(|a| a.annotation_type_index == ANN_WARNING));
    }

    #[test]
    fn lsb_first_bit_order() {
        // transmitted MSB-first as 0x82; read back LSB-first it reassembles as 0x41.
        let (clk, mosi, miso) = mode0_byte(0b1000_0010, 0);
        let cs = vec![0u8; clk.len()];
        let channels: Vec<&[u8]> = vec![&clk, &miso, &mosi, &cs];
        let opts = SpiOptions { bit_order: BitOrder::LsbFirst, ..Default::default() };
        let annotations = decode(&channels, opts).unwrap();
        let mosi_ann = annotations.iter().find(|a| a.annotation_type_index == ANN_MOSI_DATA).unwrap();
        assert_eq!(mosi_ann.values[0], "0x41");
    }

    #[test]
    fn missing_both_data_lines_errors() {
        let clk: Vec<u8> = vec![0, 1, 0, 1];
        let channels: Vec<&[u8]> = vec![&clk];
        assert!(matches!(
            decode(&channels, SpiOptions::default()).unwrap_err(),
            DecoderError::InvalidOption(_)
        ));
    }

    #[test]
    fn miso_only_decodes() {
        let (clk, _mosi, miso) = mode0_byte(0, 0x77);
        let channels: Vec<&[u8]> = vec![&clk, &miso];
        let annotations = decode(&channels, SpiOptions::default()).unwrap();
        let miso_word = annotations.iter().find(|a| a.annotation_type_index == ANN_MISO_DATA).unwrap();
        assert_eq!(miso_word.values[0], "0x77");
    }

    #[test]
    fn no_cs_emits_synthetic_change() {
        let (clk, mosi, _miso) = mode0_byte(0xAA, 0);
        let channels: Vec<&[u8]> = vec![&clk, &[], &mosi];
        let annotations = decode(&channels, SpiOptions::default()).unwrap();
        assert!(annotations.iter().any(|a| a.annotation_type_index == ANN_CS_CHANGE));
    }

    #[test]
    fn cs_deasserted_at_sample_zero_is_not_treated_as_active() {
        // CS idle-high (deasserted, active-low default) for the whole
        // capture: no CS-asserted change should be emitted and no word
        // should assemble, even though a full byte's worth of clock edges
        // goes by.
        let (clk, mosi, miso) = mode0_byte(0xFF, 0xFF);
        let cs = vec![1u8; clk.len()];
        let channels: Vec<&[u8]> = vec![&clk, &miso, &mosi, &cs];
        let annotations = decode(&channels, SpiOptions::default()).unwrap();
        assert!(!annotations.iter().any(|a| a.annotation_type_index == ANN_MOSI_DATA));
        assert!(!annotations
            .iter()
            .any(|a| a.annotation_type_index == ANN_CS_CHANGE && a.values == vec!["asserted".to_string()]));
    }
}
