use domain::error::AuditError;
use domain::event::AuditEvent;
use domain::query::{EventFilter, QueryFlow, QuerySummary};

/// Callback receiving each event matched by [`EventSink::query`].
pub type MatchHandler<'a> = dyn FnMut(AuditEvent) -> QueryFlow + 'a;

/// Pluggable destination for published audit events.
///
/// Implementations may write to a tamper-evident CSV log, a structured
/// log stream, a database, or a remote collector. The trait is object-safe
/// for use behind `Arc<dyn EventSink>`; implementations must be internally
/// thread-safe because the audit service fans out from many request
/// threads concurrently.
///
/// Sinks are configured at construction; `startup` acquires runtime
/// resources and `shutdown` releases them. `shutdown` is terminal.
pub trait EventSink: Send + Sync {
    /// Stable sink name used for registration and query designation.
    fn name(&self) -> &str;

    /// Acquire runtime resources. Called once by the service on startup.
    fn startup(&self) -> Result<(), AuditError> {
        Ok(())
    }

    /// Flush and release resources. Called once by the service on shutdown.
    fn shutdown(&self) -> Result<(), AuditError> {
        Ok(())
    }

    /// Deliver one event for the given topic.
    ///
    /// The event already carries its identifier; the service assigns `_id`
    /// before fan-out.
    fn publish(&self, topic: &str, event: &AuditEvent) -> Result<(), AuditError>;

    /// Retrieve the event with the given identifier, or `NotFound`.
    fn read(&self, topic: &str, id: &str) -> Result<AuditEvent, AuditError>;

    /// Stream events matching `filter` to `on_match` until it returns
    /// [`QueryFlow::Stop`] or the topic is exhausted.
    fn query(
        &self,
        topic: &str,
        filter: &EventFilter,
        on_match: &mut MatchHandler<'_>,
    ) -> Result<QuerySummary, AuditError>;
}
