//! Decoder manager: registration, introspection, execution, and chunked
//! streaming execution with a per-invocation performance monitor.

use std::collections::HashMap;
use std::time::Duration;

use tracing::instrument;

use super::i2c::{self, AddressFormat};
use super::runtime::{Annotation, DecoderError, DecoderResult};
use super::spi::{self, SpiOptions};
use super::uart::{self, UartOptions};

pub const DEFAULT_CHUNK_SAMPLES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    I2c,
    Spi,
    Uart,
}

/// One option a decoder accepts, e.g. `address_format` for I2C or
/// `baudrate` for UART. `values` enumerates accepted strings for an
/// enum-like option and is empty for a free-form numeric one.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub id: &'static str,
    pub description: &'static str,
    pub default: &'static str,
    pub values: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct DecoderInfo {
    pub id: String,
    pub name: String,
    pub long_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub kind: DecoderKind,
    pub channel_names: Vec<&'static str>,
    pub options: Vec<OptionSpec>,
    /// Annotation type names, indexed the same way as each decoder's
    /// `ANN_*` constants and an `Annotation::annotation_type_index`.
    pub annotations: Vec<&'static str>,
    /// Optional grouping of annotation type indices into named rows, the
    /// way a sigrok-style decoder groups e.g. MISO/MOSI bits separately
    /// from the combined-transfer row.
    pub annotation_rows: Vec<(&'static str, Vec<usize>)>,
}

/// The decoded result of one invocation plus its performance numbers.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub annotations: Vec<Annotation>,
    pub duration: Duration,
    pub samples_processed: usize,
    pub throughput_samples_per_sec: f64,
}

pub struct DecoderManager {
    decoders: HashMap<String, DecoderInfo>,
}

impl Default for DecoderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderManager {
    pub fn new() -> Self {
        let mut decoders = HashMap::new();
        for info in built_in_decoders() {
            decoders.insert(info.id.clone(), info);
        }
        Self { decoders }
    }

    pub fn get_available_decoders(&self) -> Vec<DecoderInfo> {
        let mut list: Vec<DecoderInfo> = self.decoders.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn get_decoder_info(&self, id: &str) -> DecoderResult<DecoderInfo> {
        self.decoders.get(id).cloned().ok_or_else(|| DecoderError::DecoderNotFound(id.to_string()))
    }

    /// Substring search over id/name/long_name/description/tags.
    pub fn search(&self, query: &str) -> Vec<DecoderInfo> {
        let needle = query.to_lowercase();
        let mut hits: Vec<DecoderInfo> = self
            .decoders
            .values()
            .filter(|d| {
                d.id.to_lowercase().contains(&needle)
                    || d.name.to_lowercase().contains(&needle)
                    || d.long_name.to_lowercase().contains(&needle)
                    || d.description.to_lowercase().contains(&needle)
                    || d.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    pub fn create_decoder(&self, id: &str) -> DecoderResult<DecoderKind> {
        self.decoders.get(id).map(|d| d.kind).ok_or_else(|| DecoderError::DecoderNotFound(id.to_string()))
    }

    #[instrument(skip(self, channels, options))]
    pub fn execute_decoder(
        &self,
        id: &str,
        sample_rate: u32,
        channels: &HashMap<String, &[u8]>,
        options: &serde_json::Value,
    ) -> DecoderResult<ExecutionResult> {
        let started = std::time::Instant::now();
        let longest = channels.values().map(|c| c.len()).max().unwrap_or(0);
        let annotations = self.decode_annotations(id, sample_rate, channels, options)?;

        let duration = started.elapsed();
        let throughput = if duration.as_secs_f64() > 0.0 { longest as f64 / duration.as_secs_f64() } else { 0.0 };
        Ok(ExecutionResult { annotations, duration, samples_processed: longest, throughput_samples_per_sec: throughput })
    }

    /// The actual per-invocation decode, shared by [`Self::execute_decoder`]
    /// and [`Self::execute_streaming_decoder`] (the latter calls this once
    /// per chunk against a progressively longer channel slice).
    fn decode_annotations(
        &self,
        id: &str,
        sample_rate: u32,
        channels: &HashMap<String, &[u8]>,
        options: &serde_json::Value,
    ) -> DecoderResult<Vec<Annotation>> {
        let info = self.get_decoder_info(id)?;
        let annotations = match info.kind {
            DecoderKind::I2c => {
                let scl = resolve(channels, "SCL")?;
                let sda = resolve(channels, "SDA")?;
                let format = opt_str(options, "address_format")
                    .map(AddressFormat::from_option)
                    .transpose()?
                    .unwrap_or(AddressFormat::Shifted);
                i2c::decode(sample_rate, &[scl, sda], format)?
            }
            DecoderKind::Spi => {
                let clk = resolve(channels, "CLK")?;
                let miso = channels.get("MISO").copied().unwrap_or(&[]);
                let mosi = channels.get("MOSI").copied().unwrap_or(&[]);
                let cs = channels.get("CS").copied().unwrap_or(&[]);
                let opts = SpiOptions {
                    cpol: opt_u64(options, "cpol").unwrap_or(0) as u8,
                    cpha: opt_u64(options, "cpha").unwrap_or(0) as u8,
                    word_size: opt_u64(options, "wordsize").unwrap_or(8) as u8,
                    bit_order: opt_str(options, "bitorder")
                        .map(spi::BitOrder::from_option)
                        .transpose()?
                        .unwrap_or(spi::BitOrder::MsbFirst),
                    cs_active_low: opt_str(options, "cs_polarity").map(|v| v != "active-high").unwrap_or(true),
                };
                spi::decode(&[clk, miso, mosi, cs], opts)?
            }
            DecoderKind::Uart => {
                let rx = channels.get("RX").copied().unwrap_or(&[]);
                let tx = channels.get("TX").copied().unwrap_or(&[]);
                let stop_bit_halves = match opt_f64(options, "stop_bits") {
                    Some(v) if v >= 1.9 => 4,
                    Some(v) if v >= 1.4 => 3,
                    _ => 2,
                };
                let opts = UartOptions {
                    baud_rate: opt_u64(options, "baudrate").unwrap_or(115_200) as u32,
                    sample_rate,
                    data_bits: opt_u64(options, "data_bits").unwrap_or(8) as u8,
                    parity: opt_str(options, "parity")
                        .map(uart::Parity::from_option)
                        .transpose()?
                        .unwrap_or(uart::Parity::None),
                    stop_bit_halves,
                    bit_order: opt_str(options, "bit_order")
                        .map(uart::BitOrder::from_option)
                        .transpose()?
                        .unwrap_or(uart::BitOrder::LsbFirst),
                    format: opt_str(options, "format")
                        .map(uart::Format::from_option)
                        .transpose()?
                        .unwrap_or(uart::Format::Hex),
                    invert_rx: opt_bool(options, "invert_rx").unwrap_or(false),
                    invert_tx: opt_bool(options, "invert_tx").unwrap_or(false),
                    sample_point_percent: opt_u64(options, "sample_point").unwrap_or(50) as u8,
                };
                let result = uart::decode(&[rx, tx], opts)?;
                let mut combined = result.rx;
                combined.extend(result.tx);
                combined.sort_by_key(|a| a.start_sample);
                combined
            }
        };
        Ok(annotations)
    }

    /// Runs the decode incrementally: each chunk re-decodes only the
    /// samples seen so far (`channels` truncated to the chunk boundary),
    /// so the decode genuinely stops at that boundary rather than slicing
    /// a result computed from the whole buffer up front. `on_progress`
    /// returning `false` cancels before the next chunk is decoded, and the
    /// result returned reflects only the samples processed before
    /// cancellation. Decoders never revise annotations already committed
    /// as more samples arrive, so each chunk's newly decoded annotations
    /// extend (never replace) the previous chunk's; batch output remains
    /// ground truth for a run that reaches the end of the buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_streaming_decoder(
        &self,
        id: &str,
        sample_rate: u32,
        channels: &HashMap<String, &[u8]>,
        options: &serde_json::Value,
        chunk_samples: usize,
        mut on_progress: impl FnMut(usize, usize) -> bool,
        mut on_partial: impl FnMut(&[Annotation]),
    ) -> DecoderResult<ExecutionResult> {
        let chunk_samples = chunk_samples.max(1);
        let total = channels.values().map(|c| c.len()).max().unwrap_or(0);
        let started = std::time::Instant::now();

        let mut boundary = chunk_samples.min(total.max(1));
        let mut emitted: Vec<Annotation> = Vec::new();
        let mut processed = 0usize;

        loop {
            let truncated = truncate_channels(channels, boundary);
            let decoded_so_far = self.decode_annotations(id, sample_rate, &truncated, options)?;

            let fresh = &decoded_so_far[emitted.len().min(decoded_so_far.len())..];
            if !fresh.is_empty() {
                on_partial(fresh);
            }
            emitted = decoded_so_far;
            processed = boundary.min(total);

            let keep_going = on_progress(processed, total);
            if !keep_going || boundary >= total {
                break;
            }
            boundary = (boundary + chunk_samples).min(total);
        }

        let duration = started.elapsed();
        let throughput = if duration.as_secs_f64() > 0.0 { processed as f64 / duration.as_secs_f64() } else { 0.0 };
        Ok(ExecutionResult {
            annotations: emitted,
            duration,
            samples_processed: processed,
            throughput_samples_per_sec: throughput,
        })
    }
}

/// Slice every channel down to its first `boundary` samples (or fewer, if
/// it is already shorter), for a streaming decode's per-chunk re-decode.
fn truncate_channels<'a>(channels: &HashMap<String, &'a [u8]>, boundary: usize) -> HashMap<String, &'a [u8]> {
    channels.iter().map(|(name, samples)| (name.clone(), &samples[..samples.len().min(boundary)])).collect()
}

fn resolve<'a>(channels: &'a HashMap<String, &'a [u8]>, name: &str) -> DecoderResult<&'a [u8]> {
    channels.get(name).copied().ok_or_else(|| DecoderError::MissingRequiredChannel(name.to_string()))
}

/// Option values arrive either as native JSON (programmatic callers) or as
/// strings (the CLI's `KEY=VALUE` surface); these helpers accept both.
fn opt_u64(options: &serde_json::Value, key: &str) -> Option<u64> {
    let v = options.get(key)?;
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn opt_f64(options: &serde_json::Value, key: &str) -> Option<f64> {
    let v = options.get(key)?;
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn opt_bool(options: &serde_json::Value, key: &str) -> Option<bool> {
    let v = options.get(key)?;
    v.as_bool().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn opt_str<'a>(options: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    options.get(key).and_then(|v| v.as_str())
}

fn built_in_decoders() -> Vec<DecoderInfo> {
    vec![
        DecoderInfo {
            id: "i2c".to_string(),
            name: "I2C".to_string(),
            long_name: "Inter-Integrated Circuit".to_string(),
            description: "Decodes I2C start/stop/address/data/ack traffic".to_string(),
            tags: vec!["embedded".to_string(), "serial".to_string()],
            kind: DecoderKind::I2c,
            channel_names: vec!["SCL", "SDA"],
            options: vec![OptionSpec {
                id: "address_format",
                description: "7-bit address annotation formatting",
                default: "shifted",
                values: &["shifted", "unshifted"],
            }],
            annotations: vec![
                "start",
                "repeat-start",
                "stop",
                "ack",
                "nak",
                "bit",
                "address-read",
                "address-write",
                "data-read",
                "data-write",
                "warning",
            ],
            annotation_rows: vec![
                ("i2c", vec![
                    i2c::ANN_START,
                    i2c::ANN_REPEAT_START,
                    i2c::ANN_STOP,
                    i2c::ANN_ACK,
                    i2c::ANN_NAK,
                    i2c::ANN_ADDRESS_READ,
                    i2c::ANN_ADDRESS_WRITE,
                    i2c::ANN_DATA_READ,
                    i2c::ANN_DATA_WRITE,
                    i2c::ANN_WARNING,
                ]),
                ("bits", vec![i2c::ANN_BIT]),
            ],
        },
        DecoderInfo {
            id: "spi".to_string(),
            name: "SPI".to_string(),
            long_name: "Serial Peripheral Interface".to_string(),
            description: "Decodes SPI clock/data words framed by chip select".to_string(),
            tags: vec!["embedded".to_string(), "serial".to_string()],
            kind: DecoderKind::Spi,
            channel_names: vec!["CLK", "MISO", "MOSI", "CS"],
            options: vec![
                OptionSpec { id: "cpol", description: "clock polarity", default: "0", values: &["0", "1"] },
                OptionSpec { id: "cpha", description: "clock phase", default: "0", values: &["0", "1"] },
                OptionSpec {
                    id: "bitorder",
                    description: "bit order within a word",
                    default: "msb-first",
                    values: &["msb-first", "lsb-first"],
                },
                OptionSpec { id: "wordsize", description: "bits per word", default: "8", values: &[] },
                OptionSpec {
                    id: "cs_polarity",
                    description: "chip-select active level",
                    default: "active-low",
                    values: &["active-low", "active-high"],
                },
            ],
            annotations: vec![
                "miso-data",
                "mosi-data",
                "miso-bit",
                "mosi-bit",
                "miso-transfer",
                "mosi-transfer",
                "cs-change",
                "warning",
            ],
            annotation_rows: vec![
                ("miso", vec![spi::ANN_MISO_BIT, spi::ANN_MISO_DATA, spi::ANN_MISO_TRANSFER]),
                ("mosi", vec![spi::ANN_MOSI_BIT, spi::ANN_MOSI_DATA, spi::ANN_MOSI_TRANSFER]),
                ("control", vec![spi::ANN_CS_CHANGE, spi::ANN_WARNING]),
            ],
        },
        DecoderInfo {
            id: "uart".to_string(),
            name: "UART".to_string(),
            long_name: "Universal Asynchronous Receiver/Transmitter".to_string(),
            description: "Decodes async serial framing with configurable parity and stop bits".to_string(),
            tags: vec!["embedded".to_string(), "serial".to_string(), "streaming".to_string()],
            kind: DecoderKind::Uart,
            channel_names: vec!["RX", "TX"],
            options: vec![
                OptionSpec { id: "baudrate", description: "bits per second", default: "115200", values: &[] },
                OptionSpec { id: "data_bits", description: "data bits per frame", default: "8", values: &[] },
                OptionSpec {
                    id: "parity",
                    description: "parity checking mode",
                    default: "none",
                    values: &["none", "odd", "even", "mark", "space"],
                },
                OptionSpec {
                    id: "stop_bits",
                    description: "stop bit count",
                    default: "1",
                    values: &["1", "1.5", "2"],
                },
                OptionSpec {
                    id: "bit_order",
                    description: "bit order within a frame",
                    default: "lsb-first",
                    values: &["lsb-first", "msb-first"],
                },
                OptionSpec {
                    id: "format",
                    description: "data value display format",
                    default: "hex",
                    values: &["hex", "dec", "oct", "bin", "ascii"],
                },
                OptionSpec { id: "invert_rx", description: "invert RX polarity", default: "false", values: &["true", "false"] },
                OptionSpec { id: "invert_tx", description: "invert TX polarity", default: "false", values: &["true", "false"] },
                OptionSpec {
                    id: "sample_point",
                    description: "percent into a bit cell to sample",
                    default: "50",
                    values: &[],
                },
            ],
            annotations: vec!["rx-data", "tx-data", "frame-error", "parity-error"],
            annotation_rows: vec![
                ("rx", vec![uart::ANN_RX_DATA]),
                ("tx", vec![uart::ANN_TX_DATA]),
                ("errors", vec![uart::ANN_FRAME_ERROR, uart::ANN_PARITY_ERROR]),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i2c_write_lines() -> (Vec<u8>, Vec<u8>) {
        let mut scl = vec![1, 1, 1];
        let mut sda = vec![1, 1, 0];
        let cell = |bit: u8| (vec![0u8, 0, 1, 1], vec![bit, bit, bit, bit]);
        for i in (0..8).rev() {
            let (c, d) = cell((0xA0u8 >> i) & 1);
            scl.extend(c);
            sda.extend(d);
        }
        let (c, d) = cell(0);
        scl.extend(c);
        sda.extend(d);
        scl.push(1);
        sda.push(1);
        (scl, sda)
    }

    #[test]
    fn lists_built_in_decoders_sorted() {
        let mgr = DecoderManager::new();
        let ids: Vec<String> = mgr.get_available_decoders().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["i2c", "spi", "uart"]);
    }

    #[test]
    fn search_matches_tag() {
        let mgr = DecoderManager::new();
        let hits = mgr.search("streaming");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "uart");
    }

    #[test]
    fn decoder_info_exposes_options_and_annotations() {
        let mgr = DecoderManager::new();
        let info = mgr.get_decoder_info("i2c").unwrap();
        assert_eq!(info.annotations.len(), 11);
        assert!(info.options.iter().any(|o| o.id == "address_format"));
        assert!(info.annotation_rows.iter().any(|(name, _)| *name == "bits"));

        let spi_info = mgr.get_decoder_info("spi").unwrap();
        assert_eq!(spi_info.annotations.len(), 8);
        assert!(spi_info.options.iter().any(|o| o.id == "cpol"));

        let uart_info = mgr.get_decoder_info("uart").unwrap();
        assert_eq!(uart_info.annotations.len(), 4);
        assert!(uart_info.options.iter().any(|o| o.id == "baudrate"));
    }

    #[test]
    fn unknown_decoder_errors() {
        let mgr = DecoderManager::new();
        assert!(matches!(mgr.get_decoder_info("nope"), Err(DecoderError::DecoderNotFound(_))));
    }

    #[test]
    fn execute_decoder_runs_i2c() {
        let mgr = DecoderManager::new();
        let (scl, sda) = i2c_write_lines();
        let mut channels = HashMap::new();
        channels.insert("SCL".to_string(), scl.as_slice());
        channels.insert("SDA".to_string(), sda.as_slice());
        let result = mgr.execute_decoder("i2c", 1_000_000, &channels, &serde_json::json!({})).unwrap();
        assert!(!result.annotations.is_empty());
        assert_eq!(result.samples_processed, scl.len());
    }

    #[test]
    fn streaming_matches_batch_across_chunk_sizes() {
        let mgr = DecoderManager::new();
        let (scl, sda) = i2c_write_lines();
        let mut channels = HashMap::new();
        channels.insert("SCL".to_string(), scl.as_slice());
        channels.insert("SDA".to_string(), sda.as_slice());
        let batch = mgr.execute_decoder("i2c", 1_000_000, &channels, &serde_json::json!({})).unwrap();

        for chunk_size in [1usize, 7, DEFAULT_CHUNK_SAMPLES, scl.len()] {
            let mut collected = Vec::new();
            let streamed = mgr
                .execute_streaming_decoder(
                    "i2c",
                    1_000_000,
                    &channels,
                    &serde_json::json!({}),
                    chunk_size,
                    |_done, _total| true,
                    |partial| collected.extend_from_slice(partial),
                )
                .unwrap();
            assert_eq!(streamed.annotations, batch.annotations);
            assert_eq!(collected, batch.annotations);
        }
    }

    #[test]
    fn streaming_cancels_early_and_keeps_only_decoded_prefix() {
        let mgr = DecoderManager::new();
        let (scl, sda) = i2c_write_lines();
        let mut channels = HashMap::new();
        channels.insert("SCL".to_string(), scl.as_slice());
        channels.insert("SDA".to_string(), sda.as_slice());
        let batch = mgr.execute_decoder("i2c", 1_000_000, &channels, &serde_json::json!({})).unwrap();

        let mut chunks_seen = 0;
        let streamed = mgr
            .execute_streaming_decoder(
                "i2c",
                1_000_000,
                &channels,
                &serde_json::json!({}),
                4,
                |_done, _total| {
                    chunks_seen += 1;
                    chunks_seen < 3
                },
                |_partial| {},
            )
            .unwrap();

        assert!(streamed.samples_processed < batch.samples_processed);
        assert!(streamed.annotations.len() <= batch.annotations.len());
        assert_eq!(streamed.annotations, batch.annotations[..streamed.annotations.len()]);
    }
}
