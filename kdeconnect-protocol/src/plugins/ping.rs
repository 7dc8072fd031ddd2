//! Ping plugin: replies to every incoming ping with an outgoing one,
//! demonstrating the minimal handle_packet/send_packet round trip (§2.1).

use super::{Plugin, PluginFactory};
use crate::device::Device;
use crate::error::Result;
use crate::packet::Packet;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

pub struct PingPlugin;

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    async fn handle_packet(&self, packet_type: &str, packet: &Packet, device: &Arc<Device>) -> Result<()> {
        if packet_type != PACKET_TYPE_PING {
            return Ok(());
        }
        debug!("received ping from {}", device.id());

        let mut body = json!({});
        if let Some(message) = packet.get_string("message") {
            body["message"] = json!(message);
        }
        let reply = Packet::new(PACKET_TYPE_PING, body);
        let cancel = CancellationToken::new();
        device.send_packet(reply, &cancel).await
    }
}

pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin)
    }
}
