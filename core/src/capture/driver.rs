//! The `Driver` capability trait: every concrete driver (native, network,
//! multi-device) implements this instead of sitting in a class hierarchy.

use async_trait::async_trait;

use super::error::CaptureResult;
use super::session::CaptureSession;

/// Static facts about a connected device, populated during `connect`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub version: String,
    pub max_frequency: u32,
    pub blast_frequency: u32,
    pub buffer_size: u32,
    pub channel_count: u8,
}

/// Outcome of `Driver::connect`.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub success: bool,
    pub device_info: Option<DeviceInfo>,
}

/// Outcome delivered to a capture's completion callback.
#[derive(Debug, Clone)]
pub struct CaptureCompletion {
    pub success: bool,
    pub session: CaptureSession,
}

/// The single capability every capture driver implements: connect,
/// disconnect, run a capture, and the auxiliary device commands. Async so
/// transports can suspend on I/O without blocking the caller's thread.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Human-readable driver kind, e.g. "native", "network", "multi".
    fn kind(&self) -> &'static str;

    async fn connect(&mut self) -> CaptureResult<ConnectOutcome>;

    async fn disconnect(&mut self) -> CaptureResult<()>;

    /// Begin a capture. `on_complete` fires exactly once, with success or
    /// failure, when the capture FSM reaches `Done` or `Error`.
    async fn start_capture(
        &mut self,
        session: CaptureSession,
        on_complete: tokio::sync::oneshot::Sender<CaptureCompletion>,
    ) -> CaptureResult<()>;

    async fn stop_capture(&mut self) -> CaptureResult<bool>;

    async fn enter_bootloader(&mut self) -> CaptureResult<bool>;

    async fn get_voltage_status(&mut self) -> CaptureResult<String>;

    async fn send_network_config(
        &mut self,
        ssid: &str,
        password: &str,
        ipv4: &str,
        port: u16,
    ) -> CaptureResult<bool>;

    fn device_info(&self) -> Option<&DeviceInfo>;

    fn is_connected(&self) -> bool;

    fn is_capturing(&self) -> bool;
}
