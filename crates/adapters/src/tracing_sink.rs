use domain::error::AuditError;
use domain::event::AuditEvent;
use domain::query::{EventFilter, QuerySummary};
use ports::secondary::event_sink::{EventSink, MatchHandler};

/// Sink that emits every event as a structured JSON log line via `tracing`.
///
/// Each event is logged at INFO level with `event_type = "audit"`, making
/// audit records easy to filter in log aggregation systems. The sink is
/// write-only: it retains nothing, so it must not be designated as the
/// query sink.
pub struct TracingEventSink;

/// Registration name of the tracing sink.
pub const SINK_NAME: &str = "log";

impl EventSink for TracingEventSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    fn publish(&self, topic: &str, event: &AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            event_type = "audit",
            topic = %topic,
            event_id = event.id().unwrap_or(""),
            transaction_id = event.transaction_id().unwrap_or(""),
            timestamp = event.timestamp().unwrap_or(""),
            payload = %serde_json::Value::Object(event.fields().clone()),
            "audit event"
        );
        Ok(())
    }

    fn read(&self, _topic: &str, _id: &str) -> Result<AuditEvent, AuditError> {
        Err(AuditError::NotSupported(
            "the log sink does not retain events".into(),
        ))
    }

    fn query(
        &self,
        _topic: &str,
        _filter: &EventFilter,
        _on_match: &mut MatchHandler<'_>,
    ) -> Result<QuerySummary, AuditError> {
        Err(AuditError::NotSupported(
            "the log sink does not retain events".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::query::QueryFlow;
    use serde_json::json;

    fn event() -> AuditEvent {
        AuditEvent::from_value(json!({
            "_id": "_id0",
            "timestamp": "t",
            "transactionId": "tx",
        }))
        .unwrap()
    }

    #[test]
    fn publish_succeeds() {
        assert!(TracingEventSink.publish("access", &event()).is_ok());
    }

    #[test]
    fn read_and_query_are_not_supported() {
        assert!(matches!(
            TracingEventSink.read("access", "_id0").unwrap_err(),
            AuditError::NotSupported(_)
        ));
        assert!(matches!(
            TracingEventSink
                .query("access", &EventFilter::All, &mut |_| QueryFlow::Continue)
                .unwrap_err(),
            AuditError::NotSupported(_)
        ));
    }
}
