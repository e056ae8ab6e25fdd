//! Audit event envelope

use crate::AuditAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Where an audit event was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEnvironment {
    /// Host name, when the platform exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,

    /// OS process id
    pub process_id: u32,

    /// Version of this crate
    pub library_version: String,
}

impl AuditEnvironment {
    /// Describe the current process
    pub fn current() -> Self {
        let machine_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .filter(|name| !name.is_empty());

        Self {
            machine_name,
            process_id: std::process::id(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Audit event structure
///
/// Wraps the [`AuditAction`] of one request with timing and environment
/// information. This is the unit handed to an
/// [`AuditBackend`](crate::AuditBackend).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event ID
    pub id: String,

    /// Event type (e.g. "GET /orders/42")
    pub event_type: String,

    /// When the audit scope was opened
    pub start_date: DateTime<Utc>,

    /// When the audit scope was saved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    /// Milliseconds between start and end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    pub environment: AuditEnvironment,

    /// Additional fields supplied by the application
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_fields: HashMap<String, serde_json::Value>,

    /// The audited request/response pair
    pub action: AuditAction,
}

impl AuditEvent {
    /// Create a new audit event
    ///
    /// # Examples
    ///
    /// ```
    /// use armature_request_audit::*;
    ///
    /// let event = AuditEvent::new("GET /orders", AuditAction::default());
    /// assert_eq!(event.event_type, "GET /orders");
    /// assert!(event.end_date.is_none());
    /// ```
    pub fn new(event_type: impl Into<String>, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            start_date: Utc::now(),
            end_date: None,
            duration_ms: None,
            environment: AuditEnvironment::current(),
            custom_fields: HashMap::new(),
            action,
        }
    }

    /// Add a custom field
    pub fn custom_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.custom_fields.insert(key.into(), value);
        self
    }

    /// Stamp the end date and duration
    pub fn finish(&mut self) {
        let now = Utc::now();
        let elapsed = (now - self.start_date).num_milliseconds().max(0);
        self.end_date = Some(now);
        self.duration_ms = Some(elapsed as u64);
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
