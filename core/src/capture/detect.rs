//! Device discovery: detectors produce `DetectedDevice`s which the
//! manager deduplicates, ranks, and matches to a registered driver.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

/// Transport family a detected device was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Serial,
    Network,
    Usb,
}

/// A candidate device surfaced by a detector; discarded once a driver is
/// created for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedDevice {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub connection_string: String,
    pub driver_type: String,
    /// 0..=100
    pub confidence: u8,
    pub capabilities: Option<Vec<String>>,
}

/// A single hardware-probing strategy, bounded by its own timeout.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn timeout(&self) -> Duration;
    async fn detect(&self) -> Vec<DetectedDevice>;
}

async fn run_bounded(detector: &dyn Detector) -> Vec<DetectedDevice> {
    match timeout(detector.timeout(), detector.detect()).await {
        Ok(devices) => devices,
        Err(_) => Vec::new(),
    }
}

pub async fn run_all(detectors: &[Box<dyn Detector>]) -> Vec<DetectedDevice> {
    let futures = detectors.iter().map(|d| run_bounded(d.as_ref()));
    let results = futures::future::join_all(futures).await;
    results.into_iter().flatten().collect()
}

/// Serial port enumeration, bounded to 1s (§5).
pub struct SerialDetector;

#[async_trait]
impl Detector for SerialDetector {
    fn name(&self) -> &'static str {
        "serial"
    }
    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }
    async fn detect(&self) -> Vec<DetectedDevice> {
        let ports = tokio_serial::available_ports().unwrap_or_default();
        ports
            .into_iter()
            .map(|p| DetectedDevice {
                id: p.port_name.clone(),
                name: p.port_name.clone(),
                kind: DeviceKind::Serial,
                connection_string: p.port_name,
                driver_type: "native".to_string(),
                confidence: 70,
                capabilities: None,
            })
            .collect()
    }
}

/// TCP port probe against well-known analyzer ports, bounded to 1s (§5).
pub struct NetworkDetector {
    pub candidates: Vec<(String, u16)>,
}

#[async_trait]
impl Detector for NetworkDetector {
    fn name(&self) -> &'static str {
        "network"
    }
    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }
    async fn detect(&self) -> Vec<DetectedDevice> {
        let mut found = Vec::new();
        for (host, port) in &self.candidates {
            let addr = format!("{host}:{port}");
            if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                found.push(DetectedDevice {
                    id: addr.clone(),
                    name: format!("network analyzer @ {addr}"),
                    kind: DeviceKind::Network,
                    connection_string: addr,
                    driver_type: "network".to_string(),
                    confidence: 60,
                    capabilities: None,
                });
            }
        }
        found
    }
}

/// Saleae Logic Software HTTP API probe, bounded to 2s (§5).
pub struct SaleaeDetector {
    pub api_addr: String,
}

#[async_trait]
impl Detector for SaleaeDetector {
    fn name(&self) -> &'static str {
        "saleae"
    }
    fn timeout(&self) -> Duration {
        Duration::from_secs(2)
    }
    async fn detect(&self) -> Vec<DetectedDevice> {
        if tokio::net::TcpStream::connect(&self.api_addr).await.is_ok() {
            vec![DetectedDevice {
                id: self.api_addr.clone(),
                name: "Saleae Logic".to_string(),
                kind: DeviceKind::Network,
                connection_string: self.api_addr.clone(),
                driver_type: "saleae".to_string(),
                confidence: 80,
                capabilities: None,
            }]
        } else {
            Vec::new()
        }
    }
}

/// Rigol/Siglent SCPI-over-LAN probe (shares the network transport).
pub struct RigolSiglentDetector {
    pub candidates: Vec<(String, u16)>,
}

#[async_trait]
impl Detector for RigolSiglentDetector {
    fn name(&self) -> &'static str {
        "rigol_siglent"
    }
    fn timeout(&self) -> Duration {
        Duration::from_secs(2)
    }
    async fn detect(&self) -> Vec<DetectedDevice> {
        let mut found = Vec::new();
        for (host, port) in &self.candidates {
            let addr = format!("{host}:{port}");
            if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                found.push(DetectedDevice {
                    id: addr.clone(),
                    name: format!("Rigol/Siglent @ {addr}"),
                    kind: DeviceKind::Network,
                    connection_string: addr,
                    driver_type: "rigol_siglent".to_string(),
                    confidence: 65,
                    capabilities: None,
                });
            }
        }
        found
    }
}

/// `sigrok-cli` subprocess probe, bounded to 3s (§5).
pub struct SigrokDetector;

#[async_trait]
impl Detector for SigrokDetector {
    fn name(&self) -> &'static str {
        "sigrok"
    }
    fn timeout(&self) -> Duration {
        Duration::from_secs(3)
    }
    async fn detect(&self) -> Vec<DetectedDevice> {
        let output = tokio::process::Command::new("sigrok-cli")
            .arg("--scan")
            .output()
            .await;
        let Ok(output) = output else { return Vec::new() };
        if !output.status.success() {
            return Vec::new();
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| DetectedDevice {
                id: line.to_string(),
                name: line.to_string(),
                kind: DeviceKind::Usb,
                connection_string: format!("driver:{line}"),
                driver_type: "sigrok".to_string(),
                confidence: 55,
                capabilities: None,
            })
            .collect()
    }
}

/// Dedup by `connection_string`, keeping the highest-confidence variant,
/// then sort descending by confidence.
pub fn dedup_and_rank(mut devices: Vec<DetectedDevice>) -> Vec<DetectedDevice> {
    let mut best: std::collections::HashMap<String, DetectedDevice> = std::collections::HashMap::new();
    for device in devices.drain(..) {
        best.entry(device.connection_string.clone())
            .and_modify(|existing| {
                if device.confidence > existing.confidence {
                    *existing = device.clone();
                }
            })
            .or_insert(device);
    }
    let mut ranked: Vec<DetectedDevice> = best.into_values().collect();
    ranked.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(conn: &str, confidence: u8) -> DetectedDevice {
        DetectedDevice {
            id: conn.to_string(),
            name: conn.to_string(),
            kind: DeviceKind::Serial,
            connection_string: conn.to_string(),
            driver_type: "native".to_string(),
            confidence,
            capabilities: None,
        }
    }

    #[test]
    fn dedup_keeps_highest_confidence() {
        let devices = vec![dev("/dev/ttyUSB0", 40), dev("/dev/ttyUSB0", 90), dev("/dev/ttyUSB1", 50)];
        let ranked = dedup_and_rank(devices);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].connection_string, "/dev/ttyUSB0");
        assert_eq!(ranked[0].confidence, 90);
    }
}
