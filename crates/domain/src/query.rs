use serde_json::Value;

use crate::event::AuditEvent;

/// Predicate applied to each event of a topic during a query.
#[derive(Debug, Clone, PartialEq)]
pub enum EventFilter {
    /// Match every event.
    All,
    /// Match events whose `field` equals `value` exactly.
    FieldEquals { field: String, value: Value },
}

impl EventFilter {
    pub fn field_equals(field: &str, value: impl Into<Value>) -> Self {
        Self::FieldEquals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        match self {
            Self::All => true,
            Self::FieldEquals { field, value } => event.field(field) == Some(value),
        }
    }
}

/// Handler verdict after receiving one matching event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFlow {
    /// Deliver further matches.
    Continue,
    /// Stop the scan; remaining rows are not read.
    Stop,
}

/// Totals reported when a query completes or is stopped by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuerySummary {
    /// Number of events delivered to the handler.
    pub matched: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str) -> AuditEvent {
        AuditEvent::from_value(json!({
            "_id": id,
            "timestamp": "t",
            "transactionId": "tx",
            "status": "SUCCESS",
        }))
        .unwrap()
    }

    #[test]
    fn all_matches_everything() {
        assert!(EventFilter::All.matches(&event("_id0")));
    }

    #[test]
    fn field_equals_matches_exact_value() {
        let filter = EventFilter::field_equals("_id", "_id0");
        assert!(filter.matches(&event("_id0")));
        assert!(!filter.matches(&event("_id1")));
    }

    #[test]
    fn field_equals_on_absent_field_never_matches() {
        let filter = EventFilter::field_equals("missing", "x");
        assert!(!filter.matches(&event("_id0")));
    }

    #[test]
    fn field_equals_is_type_sensitive() {
        // "42" (string) must not match 42 (number).
        let filter = EventFilter::field_equals("status", 42);
        assert!(!filter.matches(&event("_id0")));
    }
}
