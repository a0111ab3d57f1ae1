//! Named service handlers for SERVICE_DATA.
//!
//! A service receives the JSON data addressed to it along with a handle on
//! the channel it arrived through, so it can answer with
//! [`WebChannel::send_service`]. The overlay's own join negotiation is one
//! of these.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use netweave_core::PeerId;

use crate::channel::WebChannel;

pub trait ServiceHandler: Send + Sync {
    /// Handle data sent to this service by `from`.
    ///
    /// Called without any engine lock held; long work should be spawned.
    fn on_message(&self, channel: &WebChannel, from: PeerId, data: serde_json::Value) -> Result<()>;
}

/// Maps service names to handlers.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        self.services.insert(name.into(), handler);
    }

    /// Returns false if no service is registered under `name`.
    pub fn dispatch(&self, channel: &WebChannel, name: &str, from: PeerId, data: serde_json::Value) -> bool {
        let Some(service) = self.services.get(name) else {
            return false;
        };
        if let Err(e) = service.on_message(channel, from, data) {
            tracing::warn!(service = name, peer = from, error = %e, "service message handling failed");
        }
        true
    }
}
