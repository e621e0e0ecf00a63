//! Capture plane: hardware driver abstraction, wire framing, transport
//! adapters, and device discovery/matching.

pub mod detect;
pub mod driver;
pub mod error;
pub mod manager;
pub mod multi;
pub mod native;
pub mod network;
pub mod session;
pub mod wire;

pub use driver::{CaptureCompletion, ConnectOutcome, DeviceInfo, Driver};
pub use error::{CaptureError, CaptureResult};
pub use manager::{ConnectParams, ConnectTarget, DriverManager, DriverRegistration, ManagerEvent};
pub use network::NetworkTransport;
pub use session::{CaptureChannel, CaptureMode, CaptureSession, DataFormat};
pub use wire::{decode_frame, encode_frame, CaptureRequest, TriggerType, CAPTURE_REQUEST_LEN};
