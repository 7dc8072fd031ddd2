//! Battery plugin: outgoing-only, periodically emits `kdeconnect.battery`
//! while the owning Device is connected and paired (§2.1).
//!
//! Grounded on the teacher's `plugins/battery.rs` for the packet shape
//! (`currentCharge`/`isCharging`/`thresholdEvent`), generalized from a
//! request/reply plugin into one that drives its own emission loop. Reading
//! the local battery is abstracted behind [`BatterySource`] so the emission
//! loop is testable without real hardware; the spawned task is what needs
//! `Arc<Device>` rather than `&Device`, since it must outlive the
//! `update_state` call that starts it.

use super::{Plugin, PluginFactory};
use crate::device::{Device, DeviceStateFlags};
use crate::error::Result;
use crate::packet::Packet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::debug;

pub const PACKET_TYPE_BATTERY: &str = "kdeconnect.battery";
const EMIT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BatteryStatus {
    #[serde(rename = "currentCharge")]
    pub current_charge: i32,
    #[serde(rename = "isCharging")]
    pub is_charging: bool,
    #[serde(rename = "thresholdEvent")]
    pub threshold_event: i32,
}

impl BatteryStatus {
    pub fn no_battery() -> Self {
        Self {
            current_charge: -1,
            is_charging: false,
            threshold_event: 0,
        }
    }

    fn to_packet(self) -> Packet {
        Packet::new(
            PACKET_TYPE_BATTERY,
            json!({
                "currentCharge": self.current_charge,
                "isCharging": self.is_charging,
                "thresholdEvent": self.threshold_event,
            }),
        )
    }
}

/// Reads the local machine's battery state. Swappable so tests don't depend
/// on real hardware being present.
pub trait BatterySource: Send + Sync {
    fn read(&self) -> BatteryStatus;
}

/// Placeholder source for hosts with no battery backend wired up yet.
struct NoBatterySource;

impl BatterySource for NoBatterySource {
    fn read(&self) -> BatteryStatus {
        BatteryStatus::no_battery()
    }
}

pub struct BatteryPlugin {
    source: Arc<dyn BatterySource>,
    emit_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BatteryPlugin {
    pub fn new() -> Self {
        Self {
            source: Arc::new(NoBatterySource),
            emit_task: Mutex::new(None),
        }
    }

    pub fn with_source(source: Arc<dyn BatterySource>) -> Self {
        Self {
            source,
            emit_task: Mutex::new(None),
        }
    }

    async fn start_emitting(&self, device: &Arc<Device>) {
        let mut task = self.emit_task.lock().await;
        if task.is_some() {
            return;
        }
        let device = device.clone();
        let source = self.source.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EMIT_INTERVAL);
            loop {
                ticker.tick().await;
                if !device.is_connected().await || !device.is_paired().await {
                    return;
                }
                let status = source.read();
                debug!("emitting battery status for {}: {:?}", device.id(), status);
                device.queue_packet(status.to_packet()).await;
            }
        }));
    }

    async fn stop_emitting(&self) {
        if let Some(task) = self.emit_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Default for BatteryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for BatteryPlugin {
    fn name(&self) -> &str {
        "battery"
    }

    async fn disable(&self, _device: &Arc<Device>) -> Result<()> {
        self.stop_emitting().await;
        Ok(())
    }

    async fn handle_packet(&self, _packet_type: &str, _packet: &Packet, _device: &Arc<Device>) -> Result<()> {
        Ok(())
    }

    async fn update_state(&self, flags: DeviceStateFlags, device: &Arc<Device>) -> Result<()> {
        let ready = flags.contains(DeviceStateFlags::CONNECTED) && flags.contains(DeviceStateFlags::PAIRED);
        if ready {
            self.start_emitting(device).await;
        } else {
            self.stop_emitting().await;
        }
        Ok(())
    }
}

pub struct BatteryPluginFactory;

impl PluginFactory for BatteryPluginFactory {
    fn name(&self) -> &str {
        "battery"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_BATTERY.to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(BatteryPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_battery_source_reports_minus_one() {
        let status = NoBatterySource.read();
        assert_eq!(status.current_charge, -1);
        assert!(!status.is_charging);
    }

    #[test]
    fn status_serialises_with_kdeconnect_field_names() {
        let status = BatteryStatus {
            current_charge: 42,
            is_charging: true,
            threshold_event: 0,
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["currentCharge"], 42);
        assert_eq!(value["isCharging"], true);
    }

    #[test]
    fn factory_declares_outgoing_only() {
        let factory = BatteryPluginFactory;
        assert!(factory.incoming_capabilities().is_empty());
        assert_eq!(factory.outgoing_capabilities(), vec![PACKET_TYPE_BATTERY]);
    }

    #[tokio::test]
    async fn disable_aborts_emit_task_without_panicking() {
        let plugin = BatteryPlugin::new();
        plugin.stop_emitting().await;
    }
}
