//! UART decoder: independent RX/TX line state machines sampling at the
//! configured baud rate, with start/stop/parity framing.

use super::runtime::{all_of, Annotation, DecoderError, DecoderResult, EdgeKind, Scanner};

pub const RX: usize = 0;
pub const TX: usize = 1;

pub const ANN_RX_DATA: usize = 0;
pub const ANN_TX_DATA: usize = 1;
pub const ANN_FRAME_ERROR: usize = 2;
pub const ANN_PARITY_ERROR: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub fn from_option(value: &str) -> DecoderResult<Self> {
        match value {
            "none" => Ok(Self::None),
            "odd" => Ok(Self::Odd),
            "even" => Ok(Self::Even),
            "mark" => Ok(Self::Mark),
            "space" => Ok(Self::Space),
            other => Err(DecoderError::InvalidOption(format!("parity: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    LsbFirst,
    MsbFirst,
}

impl BitOrder {
    pub fn from_option(value: &str) -> DecoderResult<Self> {
        match value {
            "lsb-first" => Ok(Self::LsbFirst),
            "msb-first" => Ok(Self::MsbFirst),
            other => Err(DecoderError::InvalidOption(format!("bit_order: {other}"))),
        }
    }
}

/// Output numeric format for a decoded data word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Hex,
    Dec,
    Oct,
    Bin,
    Ascii,
}

impl Format {
    pub fn from_option(value: &str) -> DecoderResult<Self> {
        match value {
            "hex" => Ok(Self::Hex),
            "dec" => Ok(Self::Dec),
            "oct" => Ok(Self::Oct),
            "bin" => Ok(Self::Bin),
            "ascii" => Ok(Self::Ascii),
            other => Err(DecoderError::InvalidOption(format!("format: {other}"))),
        }
    }

    fn render(self, value: u16) -> String {
        match self {
            Format::Hex => format!("0x{value:02X}"),
            Format::Dec => value.to_string(),
            Format::Oct => format!("0o{value:o}"),
            Format::Bin => format!("0b{value:b}"),
            Format::Ascii => {
                let byte = (value & 0xFF) as u8;
                if byte.is_ascii_graphic() || byte == b' ' {
                    format!("'{}'", byte as char)
                } else {
                    format!("0x{value:02X}")
                }
            }
        }
    }
}

/// `stop_bits` is `ℤ × 2`: 1 => 2, 1.5 => 3, 2 => 4, so the type stays
/// integral while still representing the half-bit case exactly.
#[derive(Debug, Clone, Copy)]
pub struct UartOptions {
    pub baud_rate: u32,
    pub sample_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bit_halves: u8,
    pub bit_order: BitOrder,
    pub format: Format,
    pub invert_rx: bool,
    pub invert_tx: bool,
    pub sample_point_percent: u8,
}

impl Default for UartOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            sample_rate: 1_000_000,
            data_bits: 8,
            parity: Parity::None,
            stop_bit_halves: 2,
            bit_order: BitOrder::LsbFirst,
            format: Format::Hex,
            invert_rx: false,
            invert_tx: false,
            sample_point_percent: 50,
        }
    }
}

impl UartOptions {
    fn samples_per_bit(&self) -> f64 {
        self.sample_rate as f64 / self.baud_rate as f64
    }

    fn offset_for(&self, bit_index_from_start: f64) -> usize {
        let spb = self.samples_per_bit();
        (spb * (bit_index_from_start + self.sample_point_percent as f64 / 100.0)).round() as usize
    }

    fn stop_bit_count(&self) -> f64 {
        self.stop_bit_halves as f64 / 2.0
    }
}

/// Step forward one sample at a time to `target`. `Stable`/`Edge` are
/// complementary for a binary channel, so their union always matches the
/// very next sample -- this is how the line decoder walks to fixed
/// bit-center offsets instead of waiting on a transition.
fn advance_to(scanner: &mut Scanner<'_>, target: usize) -> DecoderResult<()> {
    let step = super::runtime::any_of([
        std::collections::HashMap::from([(0usize, EdgeKind::Stable)]),
        std::collections::HashMap::from([(0usize, EdgeKind::Edge)]),
    ]);
    while scanner.sample_index() < target {
        scanner.wait(&step)?;
    }
    Ok(())
}

/// Decode a single UART line into data-byte annotations. Call once per
/// line (RX, then TX) with the appropriate annotation type indices.
fn decode_line(line: &[u8], opts: UartOptions, invert: bool, data_kind: usize) -> DecoderResult<Vec<Annotation>> {
    let channels: Vec<&[u8]> = vec![line];
    let mut scanner = Scanner::new(&channels);
    let idle_level: u8 = if invert { 0 } else { 1 };
    let start_level = 1 - idle_level;
    let mark = |bit: u8| -> u8 { if invert { 1 - bit } else { bit } };

    loop {
        let outcome = if idle_level == 1 {
            scanner.wait(&all_of([(0, EdgeKind::Falling)]))
        } else {
            scanner.wait(&all_of([(0, EdgeKind::Rising)]))
        };
        let start_edge = match outcome {
            Ok(o) => o,
            Err(DecoderError::EndOfSamples) => break,
            Err(e) => return Err(e),
        };

        let frame_start = start_edge.sample_index;
        let start_sample_index = frame_start + opts.offset_for(0.0);
        if advance_to(&mut scanner, start_sample_index).is_err() {
            break;
        }
        if scanner.current_pins()[0] != start_level {
            continue; // glitch, not a real start bit
        }

        let mut bits = Vec::with_capacity(opts.data_bits as usize);
        let mut frame_error = false;
        for n in 1..=opts.data_bits as usize {
            let idx = frame_start + opts.offset_for(n as f64);
            if advance_to(&mut scanner, idx).is_err() {
                frame_error = true;
                break;
            }
            bits.push(mark(scanner.current_pins()[0]));
        }
        if frame_error {
            break;
        }

        let has_parity = opts.parity != Parity::None;
        let parity_sample = if has_parity {
            let idx = frame_start + opts.offset_for(opts.data_bits as f64 + 1.0);
            if advance_to(&mut scanner, idx).is_err() {
                break;
            }
            Some(mark(scanner.current_pins()[0]))
        } else {
            None
        };
        let parity_slot = if has_parity { 1.0 } else { 0.0 };

        let stop_bit_offset = opts.data_bits as f64 + 1.0 + parity_slot;
        let stop_idx = frame_start + opts.offset_for(stop_bit_offset + opts.stop_bit_count() - 1.0);
        let stop_ok = advance_to(&mut scanner, stop_idx).is_ok() && scanner.current_pins()[0] == idle_level;

        let byte = match opts.bit_order {
            BitOrder::LsbFirst => bits.iter().rev().fold(0u16, |acc, &b| (acc << 1) | b as u16),
            BitOrder::MsbFirst => bits.iter().fold(0u16, |acc, &b| (acc << 1) | b as u16),
        };

        let frame_end = stop_idx.min(scanner.sample_index());
        if !stop_ok {
            scanner.put(frame_start, frame_end, ANN_FRAME_ERROR, vec!["missing stop bit".to_string()], None);
        }
        if let Some(parity_value) = parity_sample {
            let data_ones = bits.iter().filter(|&&b| b == 1).count();
            let ok = match opts.parity {
                Parity::Even => (data_ones + parity_value as usize) % 2 == 0,
                Parity::Odd => (data_ones + parity_value as usize) % 2 == 1,
                Parity::Mark => parity_value == 1,
                Parity::Space => parity_value == 0,
                Parity::None => true,
            };
            if !ok {
                scanner.put(frame_start, frame_end, ANN_PARITY_ERROR, vec![], None);
            }
        }

        scanner.put(frame_start, frame_end, data_kind, vec![opts.format.render(byte)], None);
    }

    Ok(scanner.into_results())
}

#[derive(Debug, Default)]
pub struct UartDecode {
    pub rx: Vec<Annotation>,
    pub tx: Vec<Annotation>,
}

pub fn decode(channels: &[&[u8]], opts: UartOptions) -> DecoderResult<UartDecode> {
    if channels.is_empty() {
        return Err(DecoderError::MissingRequiredChannel("RX or TX".to_string()));
    }
    let rx = if channels.len() > RX && !channels[RX].is_empty() {
        decode_line(channels[RX], opts, opts.invert_rx, ANN_RX_DATA)?
    } else {
        Vec::new()
    };
    let tx = if channels.len() > TX && !channels[TX].is_empty() {
        decode_line(channels[TX], opts, opts.invert_tx, ANN_TX_DATA)?
    } else {
        Vec::new()
    };
    Ok(UartDecode { rx, tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a UART line for one byte at `samples_per_bit` resolution:
    /// idle, start(0), data bits LSB-first, stop(1), idle.
    fn build_frame(byte: u8, data_bits: u8, spb: usize, idle_samples: usize) -> Vec<u8> {
        let mut out = vec![1u8; idle_samples];
        out.extend(std::iter::repeat(0u8).take(spb)); // start bit
        for i in 0..data_bits {
            let bit = (byte >> i) & 1;
            out.extend(std::iter::repeat(bit).take(spb));
        }
        out.extend(std::iter::repeat(1u8).take(spb)); // stop bit
        out.extend(std::iter::repeat(1u8).take(idle_samples));
        out
    }

    #[test]
    fn decodes_8n1_byte() {
        let spb = 8;
        let line = build_frame(0x55, 8, spb, spb * 2);
        let channels: Vec<&[u8]> = vec![&line, &[]];
        let opts = UartOptions { baud_rate: 1, sample_rate: spb as u32, data_bits: 8, ..Default::default() };
        let result = decode(&channels, opts).unwrap();
        assert_eq!(result.rx.len(), 1);
        assert_eq!(result.rx[0].values[0], "0x55");
        assert_eq!(result.rx[0].annotation_type_index, ANN_RX_DATA);
    }

    #[test]
    fn scenario_115200_baud_lsb_first_hex() {
        // spec §8 scenario 5: sample_rate=2,304,000 Hz (20 samples/bit), RX
        // delivers the wire sequence 0,1,0,1,0,0,0,0 (i.e. "0b01010000"
        // read left-to-right in time order) LSB-first between a start bit
        // (low) and stop bit (high); expect one data annotation "0x0A",
        // no frame error.
        let spb = 20;
        let wire_bits = [0u8, 1, 0, 1, 0, 0, 0, 0];
        let mut line = vec![1u8; spb * 2];
        line.extend(std::iter::repeat(0u8).take(spb)); // start bit
        for &bit in &wire_bits {
            line.extend(std::iter::repeat(bit).take(spb));
        }
        line.extend(std::iter::repeat(1u8).take(spb)); // stop bit
        line.extend(std::iter::repeat(1u8).take(spb * 2));

        let channels: Vec<&[u8]> = vec![&line, &[]];
        let opts = UartOptions { baud_rate: 115_200, sample_rate: spb as u32 * 115_200, data_bits: 8, ..Default::default() };
        let result = decode(&channels, opts).unwrap();
        assert_eq!(result.rx.len(), 1);
        assert_eq!(result.rx[0].values[0], "0x0A");
        assert!(!result.rx.iter().any(|a| a.annotation_type_index == ANN_FRAME_ERROR));
    }

    #[test]
    fn frame_error_on_missing_stop_bit() {
        let spb = 8;
        let mut line = vec![1u8; spb * 2];
        line.extend(std::iter::repeat(0u8).take(spb)); // start
        line.extend(std::iter::repeat(1u8).take(spb * 8)); // data = all 1s
        line.extend(std::iter::repeat(0u8).take(spb)); // stop held low: frame error
        let channels: Vec<&[u8]> = vec![&line, &[]];
        let opts = UartOptions { baud_rate: 1, sample_rate: spb as u32, data_bits: 8, ..Default::default() };
        let result = decode(&channels, opts).unwrap();
        assert!(result.rx.iter().any(|a| a.annotation_type_index == ANN_FRAME_ERROR));
    }

    #[test]
    fn even_parity_mismatch_reports_error() {
        let spb = 8;
        let mut line = vec![1u8; spb * 2];
        line.extend(std::iter::repeat(0u8).take(spb)); // start
        // 0xFF has 8 ones (even); force parity bit to 1, making total odd.
        for _ in 0..8 {
            line.extend(std::iter::repeat(1u8).take(spb));
        }
        line.extend(std::iter::repeat(1u8).take(spb)); // parity bit = 1 (wrong for even)
        line.extend(std::iter::repeat(1u8).take(spb)); // stop
        let channels: Vec<&[u8]> = vec![&line, &[]];
        let opts = UartOptions { baud_rate: 1, sample_rate: spb as u32, data_bits: 8, parity: Parity::Even, ..Default::default() };
        let result = decode(&channels, opts).unwrap();
        assert!(result.rx.iter().any(|a| a.annotation_type_index == ANN_PARITY_ERROR));
    }

    #[test]
    fn ascii_format_renders_printable_byte() {
        let spb = 8;
        let line = build_frame(b'A', 8, spb, spb * 2);
        let channels: Vec<&[u8]> = vec![&line, &[]];
        let opts = UartOptions { baud_rate: 1, sample_rate: spb as u32, data_bits: 8, format: Format::Ascii, ..Default::default() };
        let result = decode(&channels, opts).unwrap();
        assert_eq!(result.rx[0].values[0], "'A'");
    }

    #[test]
    fn empty_channels_error() {
        let channels: Vec<&[u8]> = vec![];
        assert!(matches!(decode(&channels, UartOptions::default()).unwrap_err(), DecoderError::MissingRequiredChannel(_)));
    }
}
