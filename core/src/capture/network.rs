//! Network driver: TCP- or UDP-reachable remote analyzers speaking a JSON
//! command envelope, with pluggable capture-data payload formats.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tracing::{info, instrument, warn};

use super::driver::{CaptureCompletion, ConnectOutcome, DeviceInfo, Driver};
use super::error::{CaptureError, CaptureResult};
use super::session::{CaptureSession, DataFormat};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const CAPTURE_HARD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// A UDP datagram is one JSON command/response; this bounds a single
/// `recv` buffer generously above any handshake/status payload size.
const UDP_DATAGRAM_LIMIT: usize = 64 * 1024;

/// Which byte pipe `NetworkDriver` speaks the JSON command envelope over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransport {
    Tcp,
    Udp,
}

enum Connection {
    Tcp(BufReader<TcpStream>),
    Udp(UdpSocket),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Handshake {
    version: String,
    client_type: String,
    auth_token: String,
    timestamp: u64,
}

/// Remote analyzer reachable over TCP or UDP, speaking the same JSON
/// command envelope either way: over TCP the envelope is newline-delimited
/// on a byte stream, over UDP each command/response is exactly one
/// datagram. (HTTP/WebSocket transports would share the same command
/// surface; only TCP and UDP are wired up as concrete, testable byte
/// pipes.)
pub struct NetworkDriver {
    addr: String,
    auth_token: String,
    transport: NetworkTransport,
    conn: Option<Connection>,
    device_info: Option<DeviceInfo>,
    capturing: bool,
}

impl NetworkDriver {
    /// TCP-reachable analyzer.
    pub fn new(addr: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::with_transport(addr, auth_token, NetworkTransport::Tcp)
    }

    /// UDP-reachable analyzer.
    pub fn new_udp(addr: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::with_transport(addr, auth_token, NetworkTransport::Udp)
    }

    pub fn with_transport(addr: impl Into<String>, auth_token: impl Into<String>, transport: NetworkTransport) -> Self {
        Self {
            addr: addr.into(),
            auth_token: auth_token.into(),
            transport,
            conn: None,
            device_info: None,
            capturing: false,
        }
    }

    async fn send_command(&mut self, mut body: Value) -> CaptureResult<Value> {
        if let Value::Object(map) = &mut body {
            map.insert("timestamp".to_string(), json!(0));
        }
        let line = serde_json::to_string(&body).map_err(|e| CaptureError::UnexpectedError(e.to_string()))?;

        match self.conn.as_mut().ok_or(CaptureError::Disconnected)? {
            Connection::Tcp(stream) => {
                let mut framed = line;
                framed.push('\n');
                let write = stream.get_mut().write_all(framed.as_bytes());
                timeout(COMMAND_TIMEOUT, write)
                    .await
                    .map_err(|_| CaptureError::NetworkTimeout)?
                    .map_err(|e| CaptureError::HardwareError(e.to_string()))?;

                let mut response = String::new();
                let read = stream.read_line(&mut response);
                timeout(COMMAND_TIMEOUT, read)
                    .await
                    .map_err(|_| CaptureError::NetworkTimeout)?
                    .map_err(|e| CaptureError::HardwareError(e.to_string()))?;

                serde_json::from_str(response.trim_end()).map_err(|e| CaptureError::UnexpectedError(e.to_string()))
            }
            Connection::Udp(socket) => {
                let send = socket.send(line.as_bytes());
                timeout(COMMAND_TIMEOUT, send)
                    .await
                    .map_err(|_| CaptureError::NetworkTimeout)?
                    .map_err(|e| CaptureError::HardwareError(e.to_string()))?;

                let mut buf = vec![0u8; UDP_DATAGRAM_LIMIT];
                let recv = socket.recv(&mut buf);
                let n = timeout(COMMAND_TIMEOUT, recv)
                    .await
                    .map_err(|_| CaptureError::NetworkTimeout)?
                    .map_err(|e| CaptureError::HardwareError(e.to_string()))?;

                serde_json::from_slice(&buf[..n]).map_err(|e| CaptureError::UnexpectedError(e.to_string()))
            }
        }
    }

    fn require_success(response: &Value) -> CaptureResult<()> {
        if response.get("success").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            let err = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("remote reported failure")
                .to_string();
            Err(CaptureError::HardwareError(err))
        }
    }

    /// Parse a `GET_CAPTURE_DATA` payload per `data_format`. See
    /// module docs: the CSV branch splits on real newlines, a deliberate
    /// correction of the behavior observed in the original implementation
    /// (which split on a literal backslash-n sequence).
    fn parse_capture_data(
        format: DataFormat,
        payload: &Value,
        session: &mut CaptureSession,
    ) -> CaptureResult<()> {
        match format {
            DataFormat::Binary => {
                let encoded = payload
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CaptureError::UnexpectedError("missing binary data field".into()))?;
                let raw = base64_decode(encoded)
                    .map_err(|e| CaptureError::UnexpectedError(format!("bad base64: {e}")))?;
                let channel_count = session.channels.len();
                if channel_count == 0 {
                    return Ok(());
                }
                for (i, channel) in session.channels.iter_mut().enumerate() {
                    channel.samples = raw
                        .iter()
                        .skip(i)
                        .step_by(channel_count)
                        .copied()
                        .collect();
                }
            }
            DataFormat::Json => {
                let channels = payload
                    .get("channels")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CaptureError::UnexpectedError("missing channels array".into()))?;
                for entry in channels {
                    let number = entry.get("number").and_then(Value::as_u64).unwrap_or(u64::MAX) as u8;
                    let samples: Vec<u8> = entry
                        .get("samples")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|v| v as u8).collect())
                        .unwrap_or_default();
                    if let Some(ch) = session.channels.iter_mut().find(|c| c.channel_number == number) {
                        ch.samples = samples;
                    }
                }
            }
            DataFormat::Csv => {
                let text = payload
                    .get("csv")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CaptureError::UnexpectedError("missing csv field".into()))?;
                let mut lines = text.split('\n');
                let header = lines.next().ok_or_else(|| CaptureError::UnexpectedError("empty csv".into()))?;
                let columns: Vec<&str> = header.split(',').collect();
                // columns[0] is "Time"; the rest name channels e.g. "CH0".
                let channel_cols: Vec<(usize, u8)> = columns
                    .iter()
                    .enumerate()
                    .skip(1)
                    .filter_map(|(idx, name)| name.strip_prefix("CH")?.parse().ok().map(|n| (idx, n)))
                    .collect();
                for line in lines {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let fields: Vec<&str> = line.split(',').collect();
                    for &(idx, channel_number) in &channel_cols {
                        let Some(value) = fields.get(idx).and_then(|v| v.trim().parse::<u8>().ok()) else {
                            continue;
                        };
                        if let Some(ch) = session.channels.iter_mut().find(|c| c.channel_number == channel_number) {
                            ch.samples.push(value);
                        }
                    }
                }
            }
            DataFormat::Raw => {
                let outer = payload
                    .get("channels")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CaptureError::UnexpectedError("missing raw channel arrays".into()))?;
                for (channel, values) in session.channels.iter_mut().zip(outer) {
                    channel.samples = values
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|v| v as u8).collect())
                        .unwrap_or_default();
                }
            }
        }
        Ok(())
    }
}

fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.decode(s)
}

#[async_trait]
impl Driver for NetworkDriver {
    fn kind(&self) -> &'static str {
        "network"
    }

    #[instrument(skip(self))]
    async fn connect(&mut self) -> CaptureResult<ConnectOutcome> {
        self.conn = Some(match self.transport {
            NetworkTransport::Tcp => {
                let stream = TcpStream::connect(&self.addr).await.map_err(|_| CaptureError::ConnectionRefused)?;
                Connection::Tcp(BufReader::new(stream))
            }
            NetworkTransport::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| CaptureError::HardwareError(e.to_string()))?;
                socket.connect(&self.addr).await.map_err(|_| CaptureError::ConnectionRefused)?;
                Connection::Udp(socket)
            }
        });

        let handshake = Handshake {
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_type: "logicbench".to_string(),
            auth_token: self.auth_token.clone(),
            timestamp: 0,
        };
        let response = self
            .send_command(json!({"command": "HANDSHAKE", "payload": handshake}))
            .await?;
        Self::require_success(&response)?;

        let info_response = self.send_command(json!({"command": "GET_DEVICE_INFO"})).await?;
        let device_info = DeviceInfo {
            name: info_response
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("network device")
                .to_string(),
            version: handshake.version,
            max_frequency: info_response.get("max_frequency").and_then(Value::as_u64).unwrap_or(0) as u32,
            blast_frequency: info_response.get("blast_frequency").and_then(Value::as_u64).unwrap_or(0) as u32,
            buffer_size: info_response.get("buffer_size").and_then(Value::as_u64).unwrap_or(0) as u32,
            channel_count: info_response.get("channel_count").and_then(Value::as_u64).unwrap_or(0) as u8,
        };
        info!(device = %device_info.name, "network driver connected");
        self.device_info = Some(device_info.clone());

        Ok(ConnectOutcome {
            success: true,
            device_info: Some(device_info),
        })
    }

    async fn disconnect(&mut self) -> CaptureResult<()> {
        self.conn = None;
        self.device_info = None;
        self.capturing = false;
        Ok(())
    }

    #[instrument(skip(self, session, on_complete))]
    async fn start_capture(
        &mut self,
        session: CaptureSession,
        on_complete: tokio::sync::oneshot::Sender<CaptureCompletion>,
    ) -> CaptureResult<()> {
        if self.capturing {
            return Err(CaptureError::Busy);
        }
        if self.conn.is_none() {
            return Err(CaptureError::Disconnected);
        }

        let format = session.data_format;
        let command = json!({
            "command": "START_CAPTURE",
            "session": &session,
        });
        let response = self.send_command(command).await?;
        if let Err(e) = Self::require_success(&response) {
            let _ = on_complete.send(CaptureCompletion { success: false, session });
            return Err(e);
        }
        self.capturing = true;

        let deadline = tokio::time::Instant::now() + CAPTURE_HARD_TIMEOUT;
        let mut result_session = session;
        let outcome = loop {
            if tokio::time::Instant::now() >= deadline {
                break Err(CaptureError::NetworkTimeout);
            }
            let status = self.send_command(json!({"command": "GET_CAPTURE_STATUS"})).await?;
            match status.get("status").and_then(Value::as_str) {
                Some("COMPLETED") => break Ok(()),
                Some("ERROR") => {
                    break Err(CaptureError::HardwareError(
                        status.get("error").and_then(Value::as_str).unwrap_or("capture failed").to_string(),
                    ))
                }
                _ => sleep(POLL_INTERVAL).await,
            }
        };
        self.capturing = false;

        match outcome {
            Ok(()) => {
                let data = self.send_command(json!({"command": "GET_CAPTURE_DATA"})).await?;
                match Self::parse_capture_data(format, &data, &mut result_session) {
                    Ok(()) => {
                        let _ = on_complete.send(CaptureCompletion { success: true, session: result_session });
                        Ok(())
                    }
                    Err(e) => {
                        let _ = on_complete.send(CaptureCompletion { success: false, session: result_session });
                        Err(e)
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "network capture failed");
                let _ = on_complete.send(CaptureCompletion { success: false, session: result_session });
                Err(e)
            }
        }
    }

    async fn stop_capture(&mut self) -> CaptureResult<bool> {
        let response = self.send_command(json!({"command": "STOP_CAPTURE"})).await?;
        self.capturing = false;
        Ok(Self::require_success(&response).is_ok())
    }

    async fn enter_bootloader(&mut self) -> CaptureResult<bool> {
        let response = self.send_command(json!({"command": "ENTER_BOOTLOADER"})).await?;
        Ok(Self::require_success(&response).is_ok())
    }

    async fn get_voltage_status(&mut self) -> CaptureResult<String> {
        if self.conn.is_none() {
            return Ok("DISCONNECTED".to_string());
        }
        match self.send_command(json!({"command": "GET_VOLTAGE"})).await {
            Ok(response) => Ok(response
                .get("voltage")
                .and_then(Value::as_str)
                .unwrap_or("ERROR")
                .to_string()),
            Err(CaptureError::NetworkTimeout) => Ok("TIMEOUT".to_string()),
            Err(_) => Ok("ERROR".to_string()),
        }
    }

    async fn send_network_config(
        &mut self,
        ssid: &str,
        password: &str,
        ipv4: &str,
        port: u16,
    ) -> CaptureResult<bool> {
        let response = self
            .send_command(json!({
                "command": "SET_NETWORK_CONFIG",
                "ssid": ssid,
                "password": password,
                "ipv4": ipv4,
                "port": port,
            }))
            .await?;
        Ok(Self::require_success(&response).is_ok())
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }
}
