//! The native capture driver: serial (default 115200 8-N-1) or TCP
//! transport, text handshake, and the binary capture-receive state
//! machine.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, instrument, warn};

use super::driver::{CaptureCompletion, ConnectOutcome, DeviceInfo, Driver};
use super::error::{CaptureError, CaptureResult};
use super::session::{CaptureMode, CaptureSession};
use super::wire::{decode_frame, encode_frame, CaptureRequest, CAPTURE_REQUEST_LEN};

const DEFAULT_BAUD: u32 = 115_200;
const VOLTAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the native driver talks: a serial port path or `host:port`.
#[derive(Debug, Clone)]
pub enum NativeTarget {
    Serial(String),
    Tcp(String),
}

enum Transport {
    Serial(BufReader<tokio_serial::SerialStream>),
    Tcp(BufReader<TcpStream>),
}

impl Transport {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Serial(s) => s.get_mut().write_all(buf).await,
            Transport::Tcp(s) => s.get_mut().write_all(buf).await,
        }
    }

    async fn read_line(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        match self {
            Transport::Serial(s) => s.read_line(&mut line).await?,
            Transport::Tcp(s) => s.read_line(&mut line).await?,
        };
        Ok(line.trim_end().to_string())
    }

    async fn read_exact_bytes(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Transport::Serial(s) => s.read_exact(buf).await.map(|_| ()),
            Transport::Tcp(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }
}

/// Capture receive state machine, driven while a capture is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Idle,
    Armed,
    Streaming,
    Done,
    Error,
}

/// The primary device driver: serial/TCP line transport, handshake, and
/// capture lifecycle, grounded on the teacher's USB bulk-transfer
/// `send_command`/device-handle pattern generalized to a line+binary
/// transport.
pub struct NativeDriver {
    target: NativeTarget,
    transport: Option<Transport>,
    device_info: Option<DeviceInfo>,
    state: CaptureState,
}

impl NativeDriver {
    pub fn new(target: NativeTarget) -> Self {
        Self {
            target,
            transport: None,
            device_info: None,
            state: CaptureState::Idle,
        }
    }

    async fn open_transport(&self) -> CaptureResult<Transport> {
        match &self.target {
            NativeTarget::Serial(path) => {
                let port = tokio_serial::new(path, DEFAULT_BAUD)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .open_native_async()
                    .map_err(|e| CaptureError::HardwareError(e.to_string()))?;
                Ok(Transport::Serial(BufReader::new(port)))
            }
            NativeTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|e| {
                    warn!(error = %e, "tcp connect failed");
                    CaptureError::ConnectionRefused
                })?;
                Ok(Transport::Tcp(BufReader::new(stream)))
            }
        }
    }

    async fn send_line(&mut self, line: &str) -> CaptureResult<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(CaptureError::Disconnected)?;
        transport
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| CaptureError::HardwareError(e.to_string()))
    }

    async fn read_line(&mut self) -> CaptureResult<String> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(CaptureError::Disconnected)?;
        transport
            .read_line()
            .await
            .map_err(|e| CaptureError::HardwareError(e.to_string()))
    }

    async fn handshake(&mut self) -> CaptureResult<DeviceInfo> {
        let version = self.read_line().await?;
        if !version_regex_matches(&version) {
            return Err(CaptureError::InvalidVersion(version));
        }

        let freq_line = self.read_line().await?;
        let max_frequency = parse_prefixed_u32(&freq_line, "FREQ:")
            .ok_or_else(|| CaptureError::InvalidFrequency(freq_line.clone()))?;
        if max_frequency == 0 {
            return Err(CaptureError::InvalidFrequency(freq_line));
        }

        let blast_line = self.read_line().await?;
        let blast_frequency = parse_prefixed_u32(&blast_line, "BLASTFREQ:")
            .ok_or_else(|| CaptureError::InvalidFrequency(blast_line.clone()))?;
        if blast_frequency == 0 {
            return Err(CaptureError::InvalidFrequency(blast_line));
        }

        let buffer_line = self.read_line().await?;
        let buffer_size = parse_prefixed_u32(&buffer_line, "BUFFER:")
            .ok_or_else(|| CaptureError::InvalidBufferSize(buffer_line.clone()))?;
        if buffer_size == 0 {
            return Err(CaptureError::InvalidBufferSize(buffer_line));
        }

        let channels_line = self.read_line().await?;
        let channel_count = parse_prefixed_u32(&channels_line, "CHANNELS:")
            .ok_or_else(|| CaptureError::InvalidChannelCount(channels_line.clone()))?;
        if channel_count == 0 || channel_count > 24 {
            return Err(CaptureError::InvalidChannelCount(channels_line));
        }

        Ok(DeviceInfo {
            name: version.clone(),
            version,
            max_frequency,
            blast_frequency,
            buffer_size,
            channel_count: channel_count as u8,
        })
    }

    fn is_serial(&self) -> bool {
        matches!(self.target, NativeTarget::Serial(_))
    }

    /// Demultiplex the raw, bit-packed sample stream into one byte (0/1)
    /// per channel per sample, per the active capture mode's packing.
    fn demux_samples(raw: &[u8], mode: CaptureMode, channel_count: usize) -> Vec<Vec<u8>> {
        let mut channels: Vec<Vec<u8>> = vec![Vec::with_capacity(raw.len()); channel_count];
        let bytes_per_sample = mode.divisor() as usize;
        for sample_bytes in raw.chunks(bytes_per_sample) {
            let mut word: u32 = 0;
            for (i, b) in sample_bytes.iter().enumerate() {
                word |= (*b as u32) << (8 * i);
            }
            for (ch, bucket) in channels.iter_mut().enumerate().take(channel_count) {
                bucket.push(((word >> ch) & 1) as u8);
            }
        }
        channels
    }
}

fn version_regex_matches(s: &str) -> bool {
    // ^[A-Za-z _./]+v\d+\.\d+$
    let Some(idx) = s.rfind('v') else { return false };
    let (prefix, rest) = s.split_at(idx);
    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|c| c.is_ascii_alphabetic() || matches!(c, ' ' | '_' | '.' | '/'))
    {
        return false;
    }
    let version_part = &rest[1..];
    let mut parts = version_part.splitn(2, '.');
    let (Some(major), Some(minor)) = (parts.next(), parts.next()) else {
        return false;
    };
    !major.is_empty()
        && !minor.is_empty()
        && major.chars().all(|c| c.is_ascii_digit())
        && minor.chars().all(|c| c.is_ascii_digit())
}

fn parse_prefixed_u32(line: &str, prefix: &str) -> Option<u32> {
    line.strip_prefix(prefix)?.trim().parse().ok()
}

#[async_trait]
impl Driver for NativeDriver {
    fn kind(&self) -> &'static str {
        "native"
    }

    #[instrument(skip(self))]
    async fn connect(&mut self) -> CaptureResult<ConnectOutcome> {
        let transport = self.open_transport().await?;
        self.transport = Some(transport);
        match self.handshake().await {
            Ok(info) => {
                info!(device = %info.name, "native driver connected");
                self.device_info = Some(info.clone());
                self.state = CaptureState::Idle;
                Ok(ConnectOutcome {
                    success: true,
                    device_info: Some(info),
                })
            }
            Err(e) => {
                self.transport = None;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> CaptureResult<()> {
        self.transport = None;
        self.device_info = None;
        self.state = CaptureState::Idle;
        Ok(())
    }

    #[instrument(skip(self, session, on_complete))]
    async fn start_capture(
        &mut self,
        session: CaptureSession,
        on_complete: tokio::sync::oneshot::Sender<CaptureCompletion>,
    ) -> CaptureResult<()> {
        if self.state != CaptureState::Idle {
            return Err(CaptureError::Busy);
        }
        let Some(info) = self.device_info.clone() else {
            return Err(CaptureError::HardwareError("not connected".into()));
        };
        session
            .validate(info.buffer_size)
            .map_err(|_| CaptureError::BadParams("session failed validation".into()))?;

        let mut channels = [0u8; 24];
        for ch in &session.channels {
            if (ch.channel_number as usize) < 24 {
                channels[ch.channel_number as usize] = 1;
            }
        }
        let mode = CaptureMode::for_channel_count(session.channels.len());
        let request = CaptureRequest {
            trigger_type: session.trigger_type as u8,
            trigger: session.trigger_channel,
            inverted_or_count: session.trigger_bit_count,
            trigger_value: session.trigger_pattern,
            channels,
            channel_count: session.channels.len() as u8,
            frequency: session.frequency,
            pre_samples: session.pre_trigger_samples,
            post_samples: session.post_trigger_samples,
            loop_count: session.loop_count,
            measure: session.measure_bursts as u8,
            capture_mode: match mode {
                CaptureMode::Channels8 => 0,
                CaptureMode::Channels16 => 1,
                CaptureMode::Channels24 => 2,
            },
        };
        debug_assert_eq!(request.to_bytes().len(), CAPTURE_REQUEST_LEN);

        let framed = encode_frame(&request.to_bytes());
        self.state = CaptureState::Armed;
        let transport = self.transport.as_mut().ok_or(CaptureError::Disconnected)?;
        transport
            .write_all(&framed)
            .await
            .map_err(|e| CaptureError::HardwareError(e.to_string()))?;

        self.state = CaptureState::Streaming;
        let total_samples = session.total_samples() as usize;
        let channel_count = session.channels.len();
        let bytes_to_read = total_samples * mode.divisor() as usize;

        let mut raw = vec![0u8; bytes_to_read];
        let transport = self.transport.as_mut().ok_or(CaptureError::Disconnected)?;
        let read_result = transport.read_exact_bytes(&mut raw).await;

        let mut result_session = session;
        match read_result {
            Ok(()) => {
                let demuxed = Self::demux_samples(&raw, mode, channel_count);
                for (channel, samples) in result_session.channels.iter_mut().zip(demuxed) {
                    channel.samples = samples;
                }
                self.state = CaptureState::Done;
                let _ = on_complete.send(CaptureCompletion {
                    success: true,
                    session: result_session,
                });
            }
            Err(e) => {
                warn!(error = %e, "capture stream ended with error");
                self.state = CaptureState::Error;
                let _ = on_complete.send(CaptureCompletion {
                    success: false,
                    session: result_session,
                });
            }
        }
        self.state = CaptureState::Idle;
        Ok(())
    }

    async fn stop_capture(&mut self) -> CaptureResult<bool> {
        let _ = self.send_line("STOP").await;
        // Devices do not resume cleanly after a stop; force a re-handshake.
        let reopened = self.open_transport().await;
        match reopened {
            Ok(transport) => {
                self.transport = Some(transport);
                let ok = self.handshake().await.is_ok();
                self.state = CaptureState::Idle;
                Ok(ok)
            }
            Err(_) => {
                self.state = CaptureState::Idle;
                Ok(false)
            }
        }
    }

    async fn enter_bootloader(&mut self) -> CaptureResult<bool> {
        self.send_line("BOOTLOADER").await?;
        let response = self.read_line().await?;
        if response == "RESTARTING_BOOTLOADER" {
            Ok(true)
        } else {
            Err(CaptureError::BootloaderFailed)
        }
    }

    async fn get_voltage_status(&mut self) -> CaptureResult<String> {
        if self.is_serial() {
            return Ok("3.3V".to_string());
        }
        self.send_line("VOLTAGE").await?;
        match timeout(VOLTAGE_TIMEOUT, self.read_line()).await {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(_)) => Ok("ERROR".to_string()),
            Err(_) => Ok("TIMEOUT".to_string()),
        }
    }

    async fn send_network_config(
        &mut self,
        ssid: &str,
        password: &str,
        ipv4: &str,
        port: u16,
    ) -> CaptureResult<bool> {
        if !self.is_serial() {
            return Err(CaptureError::BadParams(
                "network config is only valid for serial (USB) devices".into(),
            ));
        }
        let mut blob = [0u8; 33 + 64 + 16 + 2];
        let ssid_bytes = ssid.as_bytes();
        let len = ssid_bytes.len().min(33);
        blob[0..len].copy_from_slice(&ssid_bytes[..len]);

        let pass_bytes = password.as_bytes();
        let len = pass_bytes.len().min(64);
        blob[33..33 + len].copy_from_slice(&pass_bytes[..len]);

        let ip_bytes = ipv4.as_bytes();
        let len = ip_bytes.len().min(16);
        blob[97..97 + len].copy_from_slice(&ip_bytes[..len]);

        blob[113..115].copy_from_slice(&port.to_le_bytes());

        let transport = self.transport.as_mut().ok_or(CaptureError::Disconnected)?;
        transport
            .write_all(&blob)
            .await
            .map_err(|e| CaptureError::HardwareError(e.to_string()))?;

        let response = self.read_line().await?;
        Ok(response == "SETTINGS_SAVED")
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn is_capturing(&self) -> bool {
        matches!(self.state, CaptureState::Armed | CaptureState::Streaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_regex_accepts_expected_shapes() {
        assert!(version_regex_matches("OpenBench Logic Sniffer v1.14"));
        assert!(version_regex_matches("logicbench_native/v2.0"));
        assert!(!version_regex_matches("garbage"));
        assert!(!version_regex_matches("Name v1"));
    }

    #[test]
    fn parses_device_info_lines() {
        assert_eq!(parse_prefixed_u32("FREQ:100000000", "FREQ:"), Some(100_000_000));
        assert_eq!(parse_prefixed_u32("CHANNELS:24", "CHANNELS:"), Some(24));
        assert_eq!(parse_prefixed_u32("BUFFER:abc", "BUFFER:"), None);
    }

    #[test]
    fn demuxes_8_channel_mode() {
        // Two samples: byte 0 = 0b0000_0101 (CH0, CH2 high), byte 1 = 0b0000_0010 (CH1 high)
        let raw = [0b0000_0101u8, 0b0000_0010u8];
        let channels = NativeDriver::demux_samples(&raw, CaptureMode::Channels8, 3);
        assert_eq!(channels[0], vec![1, 0]);
        assert_eq!(channels[1], vec![0, 1]);
        assert_eq!(channels[2], vec![1, 0]);
    }
}
