use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use domain::error::AuditError;
use domain::event::AuditEvent;
use domain::query::{EventFilter, QuerySummary};
use domain::topic::TopicRegistry;
use ports::secondary::event_sink::{EventSink, MatchHandler};
use uuid::Uuid;

/// Outcome of fanning one event out to the sinks registered for its topic.
///
/// A sink's failure does not abort delivery to the remaining sinks; each
/// failure is logged and recorded here so the caller sees the full picture
/// instead of only the last sink's verdict.
#[derive(Debug)]
pub struct PublishReport {
    /// Identifier of the accepted event (assigned if the caller omitted it).
    pub event_id: String,
    /// Number of sinks that accepted the event.
    pub delivered: usize,
    /// Per-sink failures, in fan-out order.
    pub failures: Vec<SinkFailure>,
}

#[derive(Debug)]
pub struct SinkFailure {
    pub sink: String,
    pub error: AuditError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Starting,
    Running,
    Shutdown,
}

enum QueryTarget {
    Sink(Arc<dyn EventSink>),
    /// No usable query sink; carries the message returned to callers.
    None(String),
}

/// The audit service: validates incoming events, establishes identity, and
/// fans out to the sinks registered per topic.
///
/// Instances receive their full configuration at construction (via
/// [`AuditServiceBuilder`]) and cannot be reconfigured; hot reconfiguration
/// is an atomic swap of a freshly built service. After construction the
/// service is `Starting`; any call other than `startup`/`shutdown` outside
/// `Running` fails with `Unavailable`. `shutdown` is terminal.
pub struct AuditServiceImpl {
    topics: TopicRegistry,
    sinks_by_name: BTreeMap<String, Arc<dyn EventSink>>,
    sinks_by_topic: BTreeMap<String, Vec<Arc<dyn EventSink>>>,
    query_target: QueryTarget,
    state: RwLock<LifecycleState>,
}

impl std::fmt::Debug for AuditServiceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditServiceImpl").finish()
    }
}

/// Builder assembling the immutable sink and topic maps.
pub struct AuditServiceBuilder {
    topics: TopicRegistry,
    sinks: BTreeMap<String, Arc<dyn EventSink>>,
    routes: Vec<(String, String)>,
    handler_for_queries: Option<String>,
}

impl AuditServiceBuilder {
    pub fn new(topics: TopicRegistry) -> Self {
        Self {
            topics,
            sinks: BTreeMap::new(),
            routes: Vec::new(),
            handler_for_queries: None,
        }
    }

    /// Register a sink under its own name.
    #[must_use]
    pub fn register_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.insert(sink.name().to_string(), sink);
        self
    }

    /// Route events of `topic` to the sink registered as `sink_name`.
    /// Routing order is fan-out order.
    #[must_use]
    pub fn route(mut self, topic: &str, sink_name: &str) -> Self {
        self.routes.push((topic.to_string(), sink_name.to_string()));
        self
    }

    /// Designate the sink answering `read` and `query`.
    #[must_use]
    pub fn handler_for_queries(mut self, sink_name: &str) -> Self {
        self.handler_for_queries = Some(sink_name.to_string());
        self
    }

    pub fn build(self) -> Result<AuditServiceImpl, AuditError> {
        if self.topics.is_empty() {
            return Err(AuditError::BadRequest(
                "audit service requires at least one registered topic".into(),
            ));
        }

        let mut sinks_by_topic: BTreeMap<String, Vec<Arc<dyn EventSink>>> = BTreeMap::new();
        for (topic, sink_name) in &self.routes {
            if !self.topics.contains(topic) {
                return Err(AuditError::BadRequest(format!(
                    "route references unknown topic '{topic}'"
                )));
            }
            let sink = self.sinks.get(sink_name).ok_or_else(|| {
                AuditError::BadRequest(format!(
                    "route for topic '{topic}' references unregistered sink '{sink_name}'"
                ))
            })?;
            sinks_by_topic
                .entry(topic.clone())
                .or_default()
                .push(Arc::clone(sink));
        }

        let query_target = match &self.handler_for_queries {
            Some(name) => match self.sinks.get(name) {
                Some(sink) => QueryTarget::Sink(Arc::clone(sink)),
                None => QueryTarget::None(format!(
                    "the sink designated for queries, '{name}', has not been \
                     registered with the audit service"
                )),
            },
            None => QueryTarget::None("no sink is designated for queries".to_string()),
        };

        Ok(AuditServiceImpl {
            topics: self.topics,
            sinks_by_name: self.sinks,
            sinks_by_topic,
            query_target,
            state: RwLock::new(LifecycleState::Starting),
        })
    }
}

impl AuditServiceImpl {
    /// Start every registered sink and enter `Running`.
    ///
    /// Individual sink startup failures are logged but do not abort
    /// startup. Idempotent while running; fails after shutdown.
    pub fn startup(&self) -> Result<(), AuditError> {
        let mut state = self.state_write()?;
        match *state {
            LifecycleState::Starting => {
                for (name, sink) in &self.sinks_by_name {
                    if let Err(e) = sink.startup() {
                        tracing::warn!(sink = %name, error = %e, "unable to start sink");
                    }
                }
                *state = LifecycleState::Running;
                Ok(())
            }
            LifecycleState::Running => Ok(()),
            LifecycleState::Shutdown => Err(AuditError::Unavailable(
                "audit service cannot be restarted after shutdown".into(),
            )),
        }
    }

    /// Shut down every registered sink. Terminal; repeated calls are no-ops.
    pub fn shutdown(&self) -> Result<(), AuditError> {
        let mut state = self.state_write()?;
        match *state {
            LifecycleState::Running => {
                for (name, sink) in &self.sinks_by_name {
                    if let Err(e) = sink.shutdown() {
                        tracing::warn!(sink = %name, error = %e, "unable to shut down sink");
                    }
                }
                *state = LifecycleState::Shutdown;
            }
            LifecycleState::Starting => *state = LifecycleState::Shutdown,
            LifecycleState::Shutdown => {}
        }
        Ok(())
    }

    /// Validate, identify, and fan out one event.
    pub fn publish(&self, topic: &str, event: AuditEvent) -> Result<PublishReport, AuditError> {
        self.ensure_running()?;
        self.topics.get(topic)?;
        event.require_ingest_fields()?;

        let mut event = event;
        let event_id = match event.id().map(str::to_string) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                event.set_id(&id);
                id
            }
        };

        let Some(sinks) = self.sinks_by_topic.get(topic) else {
            // A known topic with no routed sink is accepted and dropped.
            tracing::debug!(topic, "no sink registered for topic");
            return Ok(PublishReport {
                event_id,
                delivered: 0,
                failures: Vec::new(),
            });
        };

        let mut failures = Vec::new();
        for sink in sinks {
            if let Err(error) = sink.publish(topic, &event) {
                tracing::warn!(sink = %sink.name(), topic, error = %error, "sink publish failed");
                failures.push(SinkFailure {
                    sink: sink.name().to_string(),
                    error,
                });
            }
        }

        Ok(PublishReport {
            event_id,
            delivered: sinks.len() - failures.len(),
            failures,
        })
    }

    /// Read one event by id through the designated query sink.
    pub fn read(&self, topic: &str, id: &str) -> Result<AuditEvent, AuditError> {
        self.ensure_running()?;
        self.topics.get(topic)?;
        match &self.query_target {
            QueryTarget::Sink(sink) => sink.read(topic, id),
            QueryTarget::None(message) => Err(AuditError::NotSupported(message.clone())),
        }
    }

    /// Stream matching events through the designated query sink.
    pub fn query(
        &self,
        topic: &str,
        filter: &EventFilter,
        on_match: &mut MatchHandler<'_>,
    ) -> Result<QuerySummary, AuditError> {
        self.ensure_running()?;
        self.topics.get(topic)?;
        match &self.query_target {
            QueryTarget::Sink(sink) => sink.query(topic, filter, on_match),
            QueryTarget::None(message) => Err(AuditError::NotSupported(message.clone())),
        }
    }

    /// Names of every topic the service accepts.
    pub fn known_topics(&self) -> Result<Vec<String>, AuditError> {
        self.ensure_running()?;
        Ok(self.topics.names().map(str::to_string).collect())
    }

    /// Whether at least one sink is routed for `topic`.
    pub fn is_auditing(&self, topic: &str) -> Result<bool, AuditError> {
        self.ensure_running()?;
        Ok(self
            .sinks_by_topic
            .get(topic)
            .is_some_and(|sinks| !sinks.is_empty()))
    }

    /// Look up a registered sink by name.
    pub fn registered_sink(&self, name: &str) -> Result<Option<Arc<dyn EventSink>>, AuditError> {
        self.ensure_running()?;
        Ok(self.sinks_by_name.get(name).cloned())
    }

    fn ensure_running(&self) -> Result<(), AuditError> {
        let state = self
            .state
            .read()
            .map_err(|_| AuditError::Internal("lifecycle lock poisoned".into()))?;
        if *state != LifecycleState::Running {
            return Err(AuditError::Unavailable("audit service not running".into()));
        }
        Ok(())
    }

    fn state_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, LifecycleState>, AuditError> {
        self.state
            .write()
            .map_err(|_| AuditError::Internal("lifecycle lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::query::QueryFlow;
    use domain::topic::TopicSchema;
    use ports::test_utils::RecordingSink;
    use serde_json::json;

    fn topics() -> TopicRegistry {
        let mut registry = TopicRegistry::new();
        registry
            .register(TopicSchema::with_core_fields("access", Vec::<String>::new()).unwrap())
            .unwrap();
        registry
            .register(TopicSchema::with_core_fields("activity", Vec::<String>::new()).unwrap())
            .unwrap();
        registry
    }

    fn event(id: Option<&str>) -> AuditEvent {
        let mut value = json!({"timestamp": "timestamp", "transactionId": "transactionId-X"});
        if let Some(id) = id {
            value["_id"] = json!(id);
        }
        AuditEvent::from_value(value).unwrap()
    }

    fn running_service(sinks: &[Arc<RecordingSink>]) -> AuditServiceImpl {
        let mut builder = AuditServiceBuilder::new(topics());
        for sink in sinks {
            let name = sink.name().to_string();
            builder = builder
                .register_sink(Arc::clone(sink) as Arc<dyn EventSink>)
                .route("access", &name);
        }
        if let Some(first) = sinks.first() {
            builder = builder.handler_for_queries(first.name());
        }
        let service = builder.build().unwrap();
        service.startup().unwrap();
        service
    }

    #[test]
    fn publish_rejected_before_startup() {
        let service = AuditServiceBuilder::new(topics()).build().unwrap();
        let err = service.publish("access", event(None)).unwrap_err();
        assert!(matches!(err, AuditError::Unavailable(_)));
    }

    #[test]
    fn startup_is_idempotent_and_starts_sinks_once() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[Arc::clone(&sink)]);
        service.startup().unwrap();
        assert_eq!(sink.startup_calls(), 1);
    }

    #[test]
    fn startup_failure_of_one_sink_does_not_abort() {
        let bad = Arc::new(RecordingSink::new("bad"));
        bad.fail_startup(true);
        let good = Arc::new(RecordingSink::new("good"));
        let service = running_service(&[Arc::clone(&bad), Arc::clone(&good)]);

        assert_eq!(good.startup_calls(), 1);
        // Service reached Running despite the failing sink.
        assert!(service.publish("access", event(None)).is_ok());
    }

    #[test]
    fn publish_rejects_unknown_topic() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[sink]);
        let err = service.publish("nonsense", event(None)).unwrap_err();
        assert!(matches!(err, AuditError::NotSupported(_)));
    }

    #[test]
    fn publish_rejects_missing_mandatory_fields() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[sink]);
        let incomplete = AuditEvent::from_value(json!({"timestamp": "t"})).unwrap();
        let err = service.publish("access", incomplete).unwrap_err();
        assert!(matches!(err, AuditError::BadRequest(_)));
    }

    #[test]
    fn publish_assigns_id_when_absent() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[Arc::clone(&sink)]);

        let report = service.publish("access", event(None)).unwrap();
        assert!(!report.event_id.is_empty());
        let delivered = sink.published();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.id(), Some(report.event_id.as_str()));
    }

    #[test]
    fn publish_honors_caller_supplied_id() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[Arc::clone(&sink)]);

        let report = service.publish("access", event(Some("_id7"))).unwrap();
        assert_eq!(report.event_id, "_id7");
    }

    #[test]
    fn publish_fans_out_to_every_routed_sink() {
        let first = Arc::new(RecordingSink::new("first"));
        let second = Arc::new(RecordingSink::new("second"));
        let service = running_service(&[Arc::clone(&first), Arc::clone(&second)]);

        let report = service.publish("access", event(None)).unwrap();
        assert_eq!(report.delivered, 2);
        assert!(report.failures.is_empty());
        assert_eq!(first.published_count(), 1);
        assert_eq!(second.published_count(), 1);
    }

    #[test]
    fn sink_failure_is_reported_but_does_not_abort_fanout() {
        let failing = Arc::new(RecordingSink::new("failing"));
        failing.fail_publish(true);
        let healthy = Arc::new(RecordingSink::new("healthy"));
        let service = running_service(&[Arc::clone(&failing), Arc::clone(&healthy)]);

        let report = service.publish("access", event(None)).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].sink, "failing");
        assert_eq!(healthy.published_count(), 1);
    }

    #[test]
    fn known_topic_without_sinks_is_accepted_and_dropped() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[Arc::clone(&sink)]);

        // "activity" is registered but not routed.
        let report = service.publish("activity", event(None)).unwrap();
        assert_eq!(report.delivered, 0);
        assert!(report.failures.is_empty());
        assert_eq!(sink.published_count(), 0);
    }

    #[test]
    fn read_and_query_delegate_to_designated_sink() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[Arc::clone(&sink)]);
        service.publish("access", event(Some("_id0"))).unwrap();

        assert_eq!(service.read("access", "_id0").unwrap().id(), Some("_id0"));

        let mut seen = 0;
        let summary = service
            .query("access", &EventFilter::field_equals("_id", "_id0"), &mut |_| {
                seen += 1;
                QueryFlow::Continue
            })
            .unwrap();
        assert_eq!(summary.matched, 1);
        assert_eq!(seen, 1);
    }

    #[test]
    fn read_without_query_sink_designation_is_not_supported() {
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new("memory"));
        let service = AuditServiceBuilder::new(topics())
            .register_sink(sink)
            .route("access", "memory")
            .build()
            .unwrap();
        service.startup().unwrap();

        let err = service.read("access", "_id0").unwrap_err();
        assert!(matches!(err, AuditError::NotSupported(_)));
        assert!(err.to_string().contains("no sink is designated"));
    }

    #[test]
    fn read_with_unregistered_query_sink_names_the_designee() {
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new("memory"));
        let service = AuditServiceBuilder::new(topics())
            .register_sink(sink)
            .handler_for_queries("jdbc")
            .build()
            .unwrap();
        service.startup().unwrap();

        let err = service.read("access", "_id0").unwrap_err();
        assert!(err.to_string().contains("'jdbc'"));
    }

    #[test]
    fn build_rejects_route_to_unregistered_sink() {
        let err = AuditServiceBuilder::new(topics())
            .route("access", "ghost")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn build_rejects_route_for_unknown_topic() {
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new("memory"));
        let err = AuditServiceBuilder::new(topics())
            .register_sink(sink)
            .route("nonsense", "memory")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("nonsense"));
    }

    #[test]
    fn shutdown_is_terminal() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[Arc::clone(&sink)]);

        service.shutdown().unwrap();
        assert_eq!(sink.shutdown_calls(), 1);

        // Repeated shutdown is a no-op.
        service.shutdown().unwrap();
        assert_eq!(sink.shutdown_calls(), 1);

        // No restart after shutdown.
        assert!(matches!(
            service.startup().unwrap_err(),
            AuditError::Unavailable(_)
        ));
        assert!(matches!(
            service.publish("access", event(None)).unwrap_err(),
            AuditError::Unavailable(_)
        ));
    }

    #[test]
    fn introspection_reflects_configuration() {
        let sink = Arc::new(RecordingSink::new("memory"));
        let service = running_service(&[Arc::clone(&sink)]);

        assert_eq!(service.known_topics().unwrap(), vec!["access", "activity"]);
        assert!(service.is_auditing("access").unwrap());
        assert!(!service.is_auditing("activity").unwrap());
        assert!(service.registered_sink("memory").unwrap().is_some());
        assert!(service.registered_sink("jdbc").unwrap().is_none());
    }
}
