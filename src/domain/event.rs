use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known event type strings (section 6, EXTERNAL INTERFACES).
pub mod event_types {
    pub const INTEGRATION_INPUT: &str = "integration.input";
    pub const INTEGRATION_OUTPUT: &str = "integration.output";
    pub const SCHEDULE_FIRED: &str = "schedule.fired";
    pub const CONTEXT_ASSEMBLED: &str = "context.assembled";
    pub const MEMO_CREATED: &str = "memo.created";
    pub const SIGNAL_PROPOSED: &str = "signal.proposed";
    pub const SIGNAL_APPROVED: &str = "signal.approved";
    pub const SIGNAL_REJECTED: &str = "signal.rejected";
    pub const SIGNAL_DELIVERED: &str = "signal.delivered";
    pub const POSITION_CONFIRMED: &str = "position.confirmed";
    pub const POSITION_SKIPPED: &str = "position.skipped";
    pub const POSITION_UPDATED: &str = "position.updated";
    pub const TASK_CREATED: &str = "task.created";
    pub const MEMORY_CREATED: &str = "memory.created";
    pub const ALERT_TRIGGERED: &str = "alert.triggered";
    pub const SIMULATION_STARTED: &str = "simulation.started";
    pub const SIMULATION_COMPLETED: &str = "simulation.completed";
}

/// An immutable message published on the event bus.
///
/// Never mutated after construction; appended to the day's audit log at
/// publish time and never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub source: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        let correlation_id = format!("cor_{}", Uuid::new_v4().simple());
        Self {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id,
            source: source.into(),
            payload,
            metadata: None,
        }
    }

    /// Construct an event carrying an existing causal chain's correlation id,
    /// as the orchestrator does for every derived event (`context.assembled`,
    /// `signal.approved`, etc.) so the whole chain can be reconstructed.
    pub fn derive(
        event_type: impl Into<String>,
        source: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            source: source.into(),
            payload,
            metadata: None,
        }
    }

    /// UTC date key used to group audit log lines, e.g. `2026-07-26`.
    pub fn audit_date_key(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_has_distinct_correlation_id() {
        let a = Event::new("signal.proposed", "orchestrator", serde_json::json!({}));
        let b = Event::new("signal.proposed", "orchestrator", serde_json::json!({}));
        assert_ne!(a.id, b.id);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn derive_preserves_correlation_id() {
        let trigger = Event::new("integration.input", "telegram", serde_json::json!({}));
        let derived = Event::derive(
            "context.assembled",
            "orchestrator",
            trigger.correlation_id.clone(),
            serde_json::json!({}),
        );
        assert_eq!(derived.correlation_id, trigger.correlation_id);
        assert_ne!(derived.id, trigger.id);
    }

    #[test]
    fn round_trip_identity() {
        let e = Event::new("signal.proposed", "orchestrator", serde_json::json!({"ticker": "NVDA"}));
        let s = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&s).unwrap();
        assert_eq!(e.id, back.id);
        assert_eq!(e.event_type, back.event_type);
        assert_eq!(e.correlation_id, back.correlation_id);
    }
}
