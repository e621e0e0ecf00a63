//! The driver manager: registry of driver kinds, hardware detection,
//! matching, autoconnect, and the currently-connected driver slot.
//!
//! Grounded on the teacher's `DeviceManager` (gui/src-tauri/src/device.rs)
//! "current device" ownership pattern, generalized from one USB driver
//! kind to a priority-ordered registry of several.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tracing::instrument;

use super::detect::{dedup_and_rank, run_all, DetectedDevice, Detector, DeviceKind};
use super::driver::{DeviceInfo, Driver};
use super::error::{CaptureError, CaptureResult};
use super::multi::MultiDriver;
use super::native::{NativeDriver, NativeTarget};
use super::network::NetworkDriver;

const DETECTION_CACHE_TTL: Duration = Duration::from_secs(30);

/// A registered driver kind: how to recognize devices for it and how to
/// build an instance.
pub struct DriverRegistration {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub supported_device_tags: Vec<String>,
    pub priority: u8,
    pub factory: Arc<dyn Fn(&str) -> CaptureResult<Box<dyn Driver>> + Send + Sync>,
}

/// Events the manager emits for collaborators to subscribe to.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    DriverRegistered(String),
    DriverUnregistered(String),
    DevicesDetected(usize),
    DriverCreated(String),
    MultiDriverCreated(usize),
    DeviceConnected(String),
    DeviceDisconnected(String),
}

struct DetectionCache {
    devices: Vec<DetectedDevice>,
    fetched_at: Instant,
}

/// What `connect_to_device` should resolve to.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// Detect and connect to the highest-confidence device.
    AutoDetect,
    /// Connect to a previously detected device by its `DetectedDevice::id`.
    DeviceId(String),
    /// Connect over the network using a `host[:port]` connection string,
    /// subject to `ConnectParams::port` overriding the parsed port.
    Network(String),
    /// Connect straight to a caller-constructed device, bypassing
    /// detection entirely (e.g. an explicit `--port` a detector never
    /// reported, such as a serial path or a COM port).
    Direct(DetectedDevice),
}

/// Caller-supplied overrides for `connect_to_device`. Per the spec's network
/// port precedence question: an explicit `port` here wins over any port
/// parsed out of a `ConnectTarget::Network` connection string.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub port: Option<u16>,
}

pub struct DriverManager {
    registrations: Vec<DriverRegistration>,
    detectors: Vec<Box<dyn Detector>>,
    cache: Mutex<Option<DetectionCache>>,
    current: Mutex<Option<Box<dyn Driver>>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl DriverManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let mut manager = Self {
            registrations: Vec::new(),
            detectors: default_detectors(),
            cache: Mutex::new(None),
            current: Mutex::new(None),
            events,
        };
        for reg in built_in_registrations() {
            manager.registrations.push(reg);
        }
        manager.registrations.sort_by(|a, b| b.priority.cmp(&a.priority));
        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    pub fn register(&mut self, registration: DriverRegistration) {
        let id = registration.id.clone();
        self.registrations.push(registration);
        self.registrations.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.emit(ManagerEvent::DriverRegistered(id));
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        let removed = self.registrations.len() != before;
        if removed {
            self.emit(ManagerEvent::DriverUnregistered(id.to_string()));
        }
        removed
    }

    pub fn registered_drivers(&self) -> &[DriverRegistration] {
        &self.registrations
    }

    #[instrument(skip(self))]
    pub async fn detect_hardware(&self, use_cache: bool) -> Vec<DetectedDevice> {
        if use_cache {
            let cache = self.cache.lock().await;
            if let Some(c) = cache.as_ref() {
                if c.fetched_at.elapsed() < DETECTION_CACHE_TTL {
                    return c.devices.clone();
                }
            }
        }

        let raw = run_all(&self.detectors).await;
        let ranked = dedup_and_rank(raw);

        let mut cache = self.cache.lock().await;
        *cache = Some(DetectionCache {
            devices: ranked.clone(),
            fetched_at: Instant::now(),
        });
        drop(cache);

        self.emit(ManagerEvent::DevicesDetected(ranked.len()));
        ranked
    }

    /// Exact match: any supported tag is a case-insensitive substring of
    /// the device's id or name. Falls back to a generic match by
    /// transport type.
    pub fn match_driver(&self, device: &DetectedDevice) -> Option<&DriverRegistration> {
        let haystack = format!("{} {}", device.id, device.name).to_lowercase();
        if let Some(exact) = self.registrations.iter().find(|reg| {
            reg.supported_device_tags
                .iter()
                .any(|tag| haystack.contains(&tag.to_lowercase()))
        }) {
            return Some(exact);
        }

        let generic_ids: &[&str] = match device.kind {
            DeviceKind::Serial => &["native", "sigrok"],
            DeviceKind::Network => &["saleae", "rigol_siglent", "network"],
            DeviceKind::Usb => &["sigrok"],
        };
        generic_ids
            .iter()
            .find_map(|id| self.registrations.iter().find(|r| r.id == *id))
    }

    pub fn create_driver(&self, device: &DetectedDevice) -> CaptureResult<Box<dyn Driver>> {
        let reg = self
            .match_driver(device)
            .ok_or_else(|| CaptureError::HardwareError(format!("no driver matches device {}", device.id)))?;
        let driver = (reg.factory)(&device.connection_string)?;
        self.emit(ManagerEvent::DriverCreated(reg.id.clone()));
        Ok(driver)
    }

    pub fn create_multi_driver(&self, devices: &[DetectedDevice]) -> CaptureResult<MultiDriver> {
        let drivers = devices
            .iter()
            .map(|d| self.create_driver(d))
            .collect::<CaptureResult<Vec<_>>>()?;
        let count = drivers.len();
        let multi = MultiDriver::new(drivers)?;
        self.emit(ManagerEvent::MultiDriverCreated(count));
        Ok(multi)
    }

    /// Detect, try the highest-confidence device, and on failure try up
    /// to two more.
    #[instrument(skip(self))]
    pub async fn auto_connect(&self) -> CaptureResult<Box<dyn Driver>> {
        let devices = self.detect_hardware(true).await;
        let mut last_err = CaptureError::HardwareError("no devices detected".into());

        for device in devices.iter().take(3) {
            let mut driver = match self.create_driver(device) {
                Ok(d) => d,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            match driver.connect().await {
                Ok(outcome) if outcome.success => {
                    self.emit(ManagerEvent::DeviceConnected(device.id.clone()));
                    let mut current = self.current.lock().await;
                    if let Some(mut previous) = current.take() {
                        let _ = previous.disconnect().await;
                    }
                    drop(current);
                    return Ok(driver);
                }
                Ok(_) => continue,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            }
        }
        Err(last_err)
    }

    /// Resolve `target` to a device, connect, and store the live driver in
    /// the manager's "current device" slot, replacing (and disconnecting)
    /// whatever was connected before.
    #[instrument(skip(self, params))]
    pub async fn connect_to_device(&self, target: ConnectTarget, params: ConnectParams) -> CaptureResult<()> {
        let device = match target {
            ConnectTarget::AutoDetect => {
                let devices = self.detect_hardware(true).await;
                devices
                    .into_iter()
                    .next()
                    .ok_or_else(|| CaptureError::HardwareError("no devices detected".into()))?
            }
            ConnectTarget::DeviceId(id) => {
                let devices = self.detect_hardware(true).await;
                devices
                    .into_iter()
                    .find(|d| d.id == id)
                    .ok_or_else(|| CaptureError::HardwareError(format!("no detected device with id {id}")))?
            }
            ConnectTarget::Network(connection) => {
                let (host, parsed_port) = parse_network_connection_string(&connection);
                let port = params.port.unwrap_or(parsed_port);
                let connection_string = format!("{host}:{port}");
                DetectedDevice {
                    id: connection_string.clone(),
                    name: format!("network device @ {connection_string}"),
                    kind: DeviceKind::Network,
                    connection_string,
                    driver_type: "network".to_string(),
                    confidence: 100,
                    capabilities: None,
                }
            }
            ConnectTarget::Direct(device) => device,
        };

        let mut driver = self.create_driver(&device)?;
        let outcome = driver.connect().await?;
        if !outcome.success {
            return Err(CaptureError::HardwareError("connect reported failure".into()));
        }

        let mut current = self.current.lock().await;
        if let Some(mut previous) = current.take() {
            let _ = previous.disconnect().await;
        }
        *current = Some(driver);
        drop(current);

        self.emit(ManagerEvent::DeviceConnected(device.id.clone()));
        Ok(())
    }

    pub async fn disconnect_current_device(&self) -> CaptureResult<()> {
        let mut current = self.current.lock().await;
        if let Some(mut driver) = current.take() {
            driver.disconnect().await?;
            self.emit(ManagerEvent::DeviceDisconnected(driver.kind().to_string()));
        }
        Ok(())
    }

    pub async fn has_current_device(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Static facts about whatever device is in the "current" slot, if any.
    pub async fn get_current_device(&self) -> Option<DeviceInfo> {
        self.current.lock().await.as_ref().and_then(|d| d.device_info().cloned())
    }

    /// Take the current driver out of the manager's slot so a caller can
    /// drive it directly (e.g. to run a capture), without losing the
    /// manager's ownership bookkeeping. Pair with `set_current_driver` to
    /// put it back.
    pub async fn take_current_driver(&self) -> Option<Box<dyn Driver>> {
        self.current.lock().await.take()
    }

    /// Return a driver (or `None`, to leave the slot empty) to the
    /// manager's "current device" slot.
    pub async fn set_current_driver(&self, driver: Option<Box<dyn Driver>>) {
        *self.current.lock().await = driver;
    }
}

impl Default for DriverManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `host:port` with a default port of 24000 (the network driver's
/// documented default).
pub fn parse_network_connection_string(s: &str) -> (String, u16) {
    match s.split_once(':') {
        Some((host, port)) => (
            if host.is_empty() { "localhost".to_string() } else { host.to_string() },
            port.parse().unwrap_or(24_000),
        ),
        None => (s.to_string(), 24_000),
    }
}

fn built_in_registrations() -> Vec<DriverRegistration> {
    vec![
        DriverRegistration {
            id: "native".to_string(),
            name: "Native".to_string(),
            description: "Native serial/TCP capture device".to_string(),
            version: "1.0.0".to_string(),
            supported_device_tags: vec!["native".to_string(), "logicbench".to_string()],
            priority: 100,
            factory: Arc::new(|conn| {
                let target = if conn.contains(':') && !conn.starts_with('/') && !conn.starts_with("COM") {
                    NativeTarget::Tcp(conn.to_string())
                } else {
                    NativeTarget::Serial(conn.to_string())
                };
                Ok(Box::new(NativeDriver::new(target)) as Box<dyn Driver>)
            }),
        },
        DriverRegistration {
            id: "saleae".to_string(),
            name: "Saleae".to_string(),
            description: "Saleae Logic software bridge".to_string(),
            version: "1.0.0".to_string(),
            supported_device_tags: vec!["saleae".to_string()],
            priority: 80,
            factory: Arc::new(|conn| {
                let (host, port) = parse_network_connection_string(conn);
                Ok(Box::new(NetworkDriver::new(format!("{host}:{port}"), "")) as Box<dyn Driver>)
            }),
        },
        DriverRegistration {
            id: "rigol_siglent".to_string(),
            name: "Rigol/Siglent".to_string(),
            description: "Rigol/Siglent SCPI-over-LAN bridge".to_string(),
            version: "1.0.0".to_string(),
            supported_device_tags: vec!["rigol".to_string(), "siglent".to_string()],
            priority: 70,
            factory: Arc::new(|conn| {
                let (host, port) = parse_network_connection_string(conn);
                Ok(Box::new(NetworkDriver::new(format!("{host}:{port}"), "")) as Box<dyn Driver>)
            }),
        },
        DriverRegistration {
            id: "sigrok".to_string(),
            name: "Sigrok".to_string(),
            description: "sigrok-cli subprocess bridge".to_string(),
            version: "1.0.0".to_string(),
            supported_device_tags: vec!["sigrok".to_string()],
            priority: 60,
            factory: Arc::new(|conn| {
                let target = conn.strip_prefix("driver:").unwrap_or(conn);
                Ok(Box::new(NativeDriver::new(NativeTarget::Serial(target.to_string()))) as Box<dyn Driver>)
            }),
        },
        DriverRegistration {
            id: "network".to_string(),
            name: "Network".to_string(),
            description: "Generic JSON-over-TCP remote analyzer".to_string(),
            version: "1.0.0".to_string(),
            supported_device_tags: vec!["network".to_string()],
            priority: 50,
            factory: Arc::new(|conn| {
                let (host, port) = parse_network_connection_string(conn);
                Ok(Box::new(NetworkDriver::new(format!("{host}:{port}"), "")) as Box<dyn Driver>)
            }),
        },
        DriverRegistration {
            id: "network_udp".to_string(),
            name: "Network (UDP)".to_string(),
            description: "Generic JSON-over-UDP remote analyzer".to_string(),
            version: "1.0.0".to_string(),
            supported_device_tags: vec!["udp".to_string()],
            priority: 45,
            factory: Arc::new(|conn| {
                let (host, port) = parse_network_connection_string(conn);
                Ok(Box::new(NetworkDriver::new_udp(format!("{host}:{port}"), "")) as Box<dyn Driver>)
            }),
        },
    ]
}

fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(super::detect::SerialDetector),
        Box::new(super::detect::NetworkDetector { candidates: vec![("localhost".to_string(), 24_000)] }),
        Box::new(super::detect::SaleaeDetector { api_addr: "localhost:10429".to_string() }),
        Box::new(super::detect::SigrokDetector),
        Box::new(super::detect::RigolSiglentDetector { candidates: vec![] }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::session::CaptureSession;

    fn noop_factory() -> Arc<dyn Fn(&str) -> CaptureResult<Box<dyn Driver>> + Send + Sync> {
        Arc::new(|conn| Ok(Box::new(NativeDriver::new(NativeTarget::Serial(conn.to_string()))) as Box<dyn Driver>))
    }

    fn dev(id: &str, kind: DeviceKind, confidence: u8) -> DetectedDevice {
        DetectedDevice {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            connection_string: id.to_string(),
            driver_type: "test".to_string(),
            confidence,
            capabilities: None,
        }
    }

    #[test]
    fn priority_orders_registry() {
        let mut manager = DriverManager::new();
        manager.registrations.clear();
        manager.register(DriverRegistration {
            id: "a".to_string(),
            name: "A".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            supported_device_tags: vec![],
            priority: 90,
            factory: noop_factory(),
        });
        manager.register(DriverRegistration {
            id: "b".to_string(),
            name: "B".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            supported_device_tags: vec![],
            priority: 100,
            factory: noop_factory(),
        });
        assert_eq!(manager.registered_drivers()[0].id, "b");
    }

    #[test]
    fn matcher_falls_back_to_native_over_sigrok_for_serial() {
        let manager = DriverManager::new();
        let device = dev("unknown-123", DeviceKind::Serial, 50);
        let matched = manager.match_driver(&device).unwrap();
        assert_eq!(matched.id, "native");
    }

    #[test]
    fn network_connection_string_defaults_port() {
        assert_eq!(parse_network_connection_string("example.com"), ("example.com".to_string(), 24_000));
        assert_eq!(parse_network_connection_string("example.com:9000"), ("example.com".to_string(), 9000));
    }

    /// A `Driver` whose `connect` outcome is scripted per device id, for
    /// exercising the manager's retry/skip/emit-once logic without real
    /// hardware.
    struct ScriptedDriver {
        should_succeed: bool,
    }

    #[async_trait::async_trait]
    impl Driver for ScriptedDriver {
        fn kind(&self) -> &'static str {
            "scripted"
        }
        async fn connect(&mut self) -> CaptureResult<super::super::driver::ConnectOutcome> {
            Ok(super::super::driver::ConnectOutcome {
                success: self.should_succeed,
                device_info: None,
            })
        }
        async fn disconnect(&mut self) -> CaptureResult<()> {
            Ok(())
        }
        async fn start_capture(
            &mut self,
            _session: CaptureSession,
            _on_complete: tokio::sync::oneshot::Sender<super::super::driver::CaptureCompletion>,
        ) -> CaptureResult<()> {
            unimplemented!()
        }
        async fn stop_capture(&mut self) -> CaptureResult<bool> {
            Ok(true)
        }
        async fn enter_bootloader(&mut self) -> CaptureResult<bool> {
            Ok(true)
        }
        async fn get_voltage_status(&mut self) -> CaptureResult<String> {
            Ok("3.3V".to_string())
        }
        async fn send_network_config(&mut self, _: &str, _: &str, _: &str, _: u16) -> CaptureResult<bool> {
            Ok(true)
        }
        fn device_info(&self) -> Option<&super::super::driver::DeviceInfo> {
            None
        }
        fn is_connected(&self) -> bool {
            self.should_succeed
        }
        fn is_capturing(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn connect_to_device_network_caller_port_wins_over_connection_string() {
        let mut manager = DriverManager::new();
        manager.registrations.clear();
        manager.register(DriverRegistration {
            id: "network".to_string(),
            name: "Network".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            supported_device_tags: vec!["network".to_string()],
            priority: 100,
            factory: Arc::new(|_conn| Ok(Box::new(ScriptedDriver { should_succeed: true }) as Box<dyn Driver>)),
        });

        let mut events = manager.subscribe();
        manager
            .connect_to_device(ConnectTarget::Network("example.com:1111".to_string()), ConnectParams { port: Some(2222) })
            .await
            .expect("connect should succeed");

        assert!(manager.has_current_device().await);

        let mut connected_id = None;
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::DeviceConnected(id) = event {
                connected_id = Some(id);
            }
        }
        assert_eq!(connected_id.as_deref(), Some("example.com:2222"));
    }

    #[tokio::test]
    async fn connect_to_device_falls_back_to_connection_string_port() {
        let mut manager = DriverManager::new();
        manager.registrations.clear();
        manager.register(DriverRegistration {
            id: "network".to_string(),
            name: "Network".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            supported_device_tags: vec!["network".to_string()],
            priority: 100,
            factory: Arc::new(|_conn| Ok(Box::new(ScriptedDriver { should_succeed: true }) as Box<dyn Driver>)),
        });

        manager
            .connect_to_device(ConnectTarget::Network("example.com:1111".to_string()), ConnectParams::default())
            .await
            .expect("connect should succeed");

        assert_eq!(manager.get_current_device().await, None);
        manager.disconnect_current_device().await.expect("disconnect should succeed");
        assert!(!manager.has_current_device().await);
    }

    #[tokio::test]
    async fn auto_connect_skips_failing_device_and_emits_once() {
        let mut manager = DriverManager::new();
        manager.registrations.clear();
        manager.register(DriverRegistration {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            supported_device_tags: vec!["scripted".to_string()],
            priority: 100,
            factory: Arc::new(|conn| {
                let should_succeed = conn == "good";
                Ok(Box::new(ScriptedDriver { should_succeed }) as Box<dyn Driver>)
            }),
        });

        let mut events = manager.subscribe();

        let devices = vec![
            {
                let mut d = dev("scripted-fails-first", DeviceKind::Serial, 90);
                d.connection_string = "bad".to_string();
                d
            },
            {
                let mut d = dev("scripted-succeeds-second", DeviceKind::Serial, 70);
                d.connection_string = "good".to_string();
                d
            },
        ];
        {
            let mut cache = manager.cache.lock().await;
            *cache = Some(DetectionCache { devices, fetched_at: Instant::now() });
        }

        let driver = manager.auto_connect().await.expect("auto_connect should succeed via second device");
        assert!(driver.is_connected());

        let mut connected_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ManagerEvent::DeviceConnected(_)) {
                connected_events += 1;
            }
        }
        assert_eq!(connected_events, 1);
    }

    /// A `Driver` that records whether `disconnect` was called, for
    /// asserting the manager doesn't leak a stale `current` driver.
    struct TrackingDriver {
        disconnected: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Driver for TrackingDriver {
        fn kind(&self) -> &'static str {
            "tracking"
        }
        async fn connect(&mut self) -> CaptureResult<super::super::driver::ConnectOutcome> {
            Ok(super::super::driver::ConnectOutcome { success: true, device_info: None })
        }
        async fn disconnect(&mut self) -> CaptureResult<()> {
            self.disconnected.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn start_capture(
            &mut self,
            _session: CaptureSession,
            _on_complete: tokio::sync::oneshot::Sender<super::super::driver::CaptureCompletion>,
        ) -> CaptureResult<()> {
            unimplemented!()
        }
        async fn stop_capture(&mut self) -> CaptureResult<bool> {
            Ok(true)
        }
        async fn enter_bootloader(&mut self) -> CaptureResult<bool> {
            Ok(true)
        }
        async fn get_voltage_status(&mut self) -> CaptureResult<String> {
            Ok("3.3V".to_string())
        }
        async fn send_network_config(&mut self, _: &str, _: &str, _: &str, _: u16) -> CaptureResult<bool> {
            Ok(true)
        }
        fn device_info(&self) -> Option<&super::super::driver::DeviceInfo> {
            None
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn is_capturing(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn auto_connect_disconnects_stale_current_driver_instead_of_leaking_it() {
        let mut manager = DriverManager::new();
        manager.registrations.clear();
        manager.register(DriverRegistration {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            supported_device_tags: vec!["scripted".to_string()],
            priority: 100,
            factory: Arc::new(|_conn| Ok(Box::new(ScriptedDriver { should_succeed: true }) as Box<dyn Driver>)),
        });

        let disconnected = Arc::new(std::sync::atomic::AtomicBool::new(false));
        manager.set_current_driver(Some(Box::new(TrackingDriver { disconnected: disconnected.clone() }))).await;

        {
            let mut cache = manager.cache.lock().await;
            *cache = Some(DetectionCache { devices: vec![dev("scripted-1", DeviceKind::Serial, 90)], fetched_at: Instant::now() });
        }

        manager.auto_connect().await.expect("auto_connect should succeed via the scripted driver");

        assert!(disconnected.load(std::sync::atomic::Ordering::SeqCst), "stale current driver must be disconnected, not dropped silently");
        assert!(!manager.has_current_device().await);
    }
}
