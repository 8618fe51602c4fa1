use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AuditError;

/// Field holding the event identifier, assigned by the service if absent.
pub const FIELD_ID: &str = "_id";
/// Field holding the ISO-8601 timestamp. Mandatory on ingest.
pub const FIELD_TIMESTAMP: &str = "timestamp";
/// Field holding the transaction identifier. Mandatory on ingest.
pub const FIELD_TRANSACTION_ID: &str = "transactionId";

/// One audit event: a tree of named fields with JSON values.
///
/// Events are immutable once accepted by the service; the only mutation
/// point is [`AuditEvent::set_id`], which the service calls before fan-out
/// when the caller did not supply an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditEvent {
    fields: Map<String, Value>,
}

impl AuditEvent {
    /// Wrap a JSON value as an event. Only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, AuditError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(AuditError::BadRequest(format!(
                "audit event must be a JSON object, got {other}"
            ))),
        }
    }

    /// Assemble an event directly from a field map.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// String value of a field, if present and a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field(FIELD_ID)
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.str_field(FIELD_TIMESTAMP)
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.str_field(FIELD_TRANSACTION_ID)
    }

    /// Assign the event identifier. Called by the service before acceptance.
    pub fn set_id(&mut self, id: &str) {
        self.fields
            .insert(FIELD_ID.to_string(), Value::String(id.to_string()));
    }

    /// Reject events missing the mandatory ingest fields.
    pub fn require_ingest_fields(&self) -> Result<(), AuditError> {
        if self.transaction_id().is_none() || self.timestamp().is_none() {
            return Err(AuditError::BadRequest(
                "the event requires a transactionId and a timestamp".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Fluent builder for audit events.
///
/// Product-specific field groups extend the builder through free-standing
/// extension traits (see [`AccessEventExt`]) rather than subclassing, so a
/// single builder serves every topic.
#[derive(Debug, Default)]
pub struct EventBuilder {
    fields: Map<String, Value>,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an arbitrary field. Later calls overwrite earlier ones.
    #[must_use]
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn event_id(self, id: &str) -> Self {
        self.field(FIELD_ID, id)
    }

    #[must_use]
    pub fn timestamp(self, timestamp: &str) -> Self {
        self.field(FIELD_TIMESTAMP, timestamp)
    }

    #[must_use]
    pub fn transaction_id(self, transaction_id: &str) -> Self {
        self.field(FIELD_TRANSACTION_ID, transaction_id)
    }

    /// Finish the event, enforcing the mandatory ingest fields.
    pub fn build(self) -> Result<AuditEvent, AuditError> {
        let event = AuditEvent { fields: self.fields };
        event.require_ingest_fields()?;
        Ok(event)
    }
}

/// Access-event field helpers layered over the core builder.
pub trait AccessEventExt: Sized {
    /// Record the server endpoint handling the request.
    fn server(self, ip: &str, port: u16) -> Self;
    /// Record the client endpoint issuing the request.
    fn client(self, ip: &str, port: u16) -> Self;
    /// Record the response outcome.
    fn response(self, status: &str, elapsed_ms: u64) -> Self;
}

impl AccessEventExt for EventBuilder {
    fn server(self, ip: &str, port: u16) -> Self {
        self.field("server", endpoint(ip, port))
    }

    fn client(self, ip: &str, port: u16) -> Self {
        self.field("client", endpoint(ip, port))
    }

    fn response(self, status: &str, elapsed_ms: u64) -> Self {
        self.field(
            "response",
            serde_json::json!({ "status": status, "elapsedTime": elapsed_ms }),
        )
    }
}

fn endpoint(ip: &str, port: u16) -> Value {
    serde_json::json!({ "ip": ip, "port": port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_produces_event_with_mandatory_fields() {
        let event = EventBuilder::new()
            .event_id("_id0")
            .timestamp("2015-03-25T14:21:26.239Z")
            .transaction_id("transactionId-X")
            .build()
            .unwrap();

        assert_eq!(event.id(), Some("_id0"));
        assert_eq!(event.timestamp(), Some("2015-03-25T14:21:26.239Z"));
        assert_eq!(event.transaction_id(), Some("transactionId-X"));
    }

    #[test]
    fn builder_rejects_missing_transaction_id() {
        let err = EventBuilder::new()
            .timestamp("timestamp")
            .build()
            .unwrap_err();
        assert!(matches!(err, AuditError::BadRequest(_)));
    }

    #[test]
    fn builder_rejects_missing_timestamp() {
        let err = EventBuilder::new()
            .transaction_id("transactionId-X")
            .build()
            .unwrap_err();
        assert!(matches!(err, AuditError::BadRequest(_)));
    }

    #[test]
    fn from_value_accepts_only_objects() {
        assert!(AuditEvent::from_value(json!({"a": 1})).is_ok());
        assert!(AuditEvent::from_value(json!([1, 2])).is_err());
        assert!(AuditEvent::from_value(json!("scalar")).is_err());
    }

    #[test]
    fn set_id_overwrites_existing_identifier() {
        let mut event = AuditEvent::from_value(json!({"_id": "old"})).unwrap();
        event.set_id("new");
        assert_eq!(event.id(), Some("new"));
    }

    #[test]
    fn access_extensions_nest_structured_fields() {
        let event = EventBuilder::new()
            .timestamp("t")
            .transaction_id("tx")
            .server("10.0.0.1", 8080)
            .client("192.168.0.7", 51034)
            .response("SUCCESS", 12)
            .build()
            .unwrap();

        assert_eq!(event.field("server"), Some(&json!({"ip": "10.0.0.1", "port": 8080})));
        assert_eq!(
            event.field("response"),
            Some(&json!({"status": "SUCCESS", "elapsedTime": 12}))
        );
    }

    #[test]
    fn serde_roundtrip_is_transparent() {
        let event = AuditEvent::from_value(json!({"_id": "1", "nested": {"k": [1, 2]}})).unwrap();
        let text = serde_json::to_string(&event).unwrap();
        let back: AuditEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }
}
