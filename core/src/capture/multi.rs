//! Multi-device driver: composes 2-5 underlying drivers into one
//! synchronized capture. The first driver (`M0`) is the master and the
//! only one allowed to supply the trigger.

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::driver::{CaptureCompletion, ConnectOutcome, DeviceInfo, Driver};
use super::error::{CaptureError, CaptureResult};
use super::session::CaptureSession;

pub const MIN_SUB_DRIVERS: usize = 2;
pub const MAX_SUB_DRIVERS: usize = 5;

/// A channel mapping of the form `M_i:channel_j` as used by a composite
/// session to address an underlying driver's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiChannelRef {
    pub driver_index: usize,
    pub channel: u8,
}

impl MultiChannelRef {
    /// Parse `"M_i:channel_j"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (driver_part, channel_part) = s.split_once(':')?;
        let driver_index: usize = driver_part.strip_prefix("M_")?.parse().ok()?;
        let channel: u8 = channel_part.strip_prefix("channel_")?.parse().ok()?;
        Some(Self { driver_index, channel })
    }
}

pub struct MultiDriver {
    drivers: Vec<Box<dyn Driver>>,
    device_info: Option<DeviceInfo>,
}

impl MultiDriver {
    /// Construct from 2..=5 underlying drivers; `drivers[0]` is the
    /// master, `M0`.
    pub fn new(drivers: Vec<Box<dyn Driver>>) -> CaptureResult<Self> {
        if !(MIN_SUB_DRIVERS..=MAX_SUB_DRIVERS).contains(&drivers.len()) {
            return Err(CaptureError::BadParams(format!(
                "multi-device driver requires {MIN_SUB_DRIVERS}..={MAX_SUB_DRIVERS} drivers, got {}",
                drivers.len()
            )));
        }
        Ok(Self { drivers, device_info: None })
    }

    pub fn sub_driver_count(&self) -> usize {
        self.drivers.len()
    }
}

#[async_trait]
impl Driver for MultiDriver {
    fn kind(&self) -> &'static str {
        "multi"
    }

    async fn connect(&mut self) -> CaptureResult<ConnectOutcome> {
        for driver in &mut self.drivers {
            let outcome = driver.connect().await?;
            if !outcome.success {
                return Err(CaptureError::HardwareError(format!(
                    "sub-driver {} failed to connect",
                    driver.kind()
                )));
            }
        }
        self.device_info = self.drivers[0].device_info().cloned();
        Ok(ConnectOutcome {
            success: true,
            device_info: self.device_info.clone(),
        })
    }

    async fn disconnect(&mut self) -> CaptureResult<()> {
        for driver in &mut self.drivers {
            driver.disconnect().await?;
        }
        self.device_info = None;
        Ok(())
    }

    async fn start_capture(
        &mut self,
        session: CaptureSession,
        on_complete: oneshot::Sender<CaptureCompletion>,
    ) -> CaptureResult<()> {
        let mut receivers = Vec::with_capacity(self.drivers.len());
        for driver in &mut self.drivers {
            let (tx, rx) = oneshot::channel();
            driver.start_capture(session.clone(), tx).await?;
            receivers.push(rx);
        }

        let mut all_succeeded = true;
        let mut merged = session;
        for rx in receivers {
            match rx.await {
                Ok(completion) => {
                    if !completion.success {
                        all_succeeded = false;
                    }
                    for channel in completion.session.channels {
                        if let Some(existing) = merged
                            .channels
                            .iter_mut()
                            .find(|c| c.channel_number == channel.channel_number)
                        {
                            if existing.samples.is_empty() {
                                existing.samples = channel.samples;
                            }
                        }
                    }
                }
                Err(_) => all_succeeded = false,
            }
        }

        let _ = on_complete.send(CaptureCompletion {
            success: all_succeeded,
            session: merged,
        });
        Ok(())
    }

    async fn stop_capture(&mut self) -> CaptureResult<bool> {
        let mut all_ok = true;
        for driver in &mut self.drivers {
            if !driver.stop_capture().await? {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    async fn enter_bootloader(&mut self) -> CaptureResult<bool> {
        self.drivers[0].enter_bootloader().await
    }

    async fn get_voltage_status(&mut self) -> CaptureResult<String> {
        self.drivers[0].get_voltage_status().await
    }

    async fn send_network_config(
        &mut self,
        ssid: &str,
        password: &str,
        ipv4: &str,
        port: u16,
    ) -> CaptureResult<bool> {
        self.drivers[0].send_network_config(ssid, password, ipv4, port).await
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    fn is_connected(&self) -> bool {
        self.drivers.iter().all(|d| d.is_connected())
    }

    fn is_capturing(&self) -> bool {
        self.drivers.iter().any(|d| d.is_capturing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_counts() {
        assert!(MultiDriver::new(vec![]).is_err());
    }

    #[test]
    fn parses_channel_refs() {
        let r = MultiChannelRef::parse("M_1:channel_3").unwrap();
        assert_eq!(r.driver_index, 1);
        assert_eq!(r.channel, 3);
        assert!(MultiChannelRef::parse("garbage").is_none());
    }
}
