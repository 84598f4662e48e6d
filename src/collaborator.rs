//! Interface to the call routing engine that owns subscribers, routes and
//! message delivery.

use crate::pdu::Pdu;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Named request or notification exchanged with the routing engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub params: BTreeMap<String, String>,
    /// Result slot written by a successful dispatch.
    pub ret_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Pdu>,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Non-empty parameter value.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.value(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("true" | "yes" | "on" | "enable" | "1") => true,
            Some("false" | "no" | "off" | "disable" | "0") => false,
            _ => default,
        }
    }

    /// Integer parameter clamped to `min..=max`, `default` when absent or
    /// not a number.
    pub fn get_int(&self, key: &str, default: i64, min: i64, max: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map_or(default, |v| v.clamp(min, max))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.params.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.params.remove(key)
    }

    pub fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn clear_params(&mut self) {
        self.params.clear();
    }
}

pub trait Collaborator: Send + Sync {
    /// Synchronous request. Returns whether it was handled; results are
    /// written back into `event`.
    fn dispatch(&self, event: &mut Event) -> bool;

    /// Fire and forget notification.
    fn enqueue(&self, event: Event);

    /// Encode a MAP component tree into Facility IE text.
    fn map_encode(&self, _component: &Pdu) -> Result<String, String> {
        Err("MAP codec not available".to_string())
    }

    /// Decode Facility IE text into a MAP component tree.
    fn map_decode(&self, _facility: &str) -> Result<Pdu, String> {
        Err("MAP codec not available".to_string())
    }
}

/// Stand-alone collaborator: accepts registrations and routes nothing.
#[derive(Debug, Default)]
pub struct LoggingCollaborator;

impl LoggingCollaborator {
    pub fn new() -> Self {
        Self
    }
}

impl Collaborator for LoggingCollaborator {
    fn dispatch(&self, event: &mut Event) -> bool {
        info!("dispatch {} {:?}", event.name, event.params);
        matches!(event.name.as_str(), "user.register")
    }

    fn enqueue(&self, event: Event) {
        info!("enqueue {} {:?}", event.name, event.params);
    }

    fn map_encode(&self, component: &Pdu) -> Result<String, String> {
        let json = serde_json::to_vec(component).map_err(|e| e.to_string())?;
        Ok(hex::encode(json))
    }

    fn map_decode(&self, facility: &str) -> Result<Pdu, String> {
        let raw = hex::decode(facility).map_err(|e| e.to_string())?;
        let pdu = serde_json::from_slice(&raw).map_err(|e| e.to_string())?;
        debug!("Decoded facility {:?}", pdu);
        Ok(pdu)
    }
}
