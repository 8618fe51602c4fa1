use std::collections::BTreeMap;

use crate::error::AuditError;
use crate::event::{FIELD_ID, FIELD_TIMESTAMP, FIELD_TRANSACTION_ID};

/// Field names reserved for the secured log's trailing columns; no topic
/// schema may declare them.
pub const RESERVED_FIELDS: [&str; 2] = ["HMAC", "SIGNATURE"];

/// Schema of one event topic: the field list, in declared order.
///
/// The field order is load-bearing: the CSV sink emits one cell per field
/// in exactly this order, and the offline verifier replays the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSchema {
    name: String,
    fields: Vec<String>,
}

impl TopicSchema {
    /// Create a schema. The field list must include `_id`, `timestamp` and
    /// `transactionId`; order is preserved as given. The names `HMAC` and
    /// `SIGNATURE` are reserved for the secured log's trailing columns and
    /// are rejected as field names.
    pub fn new(
        name: &str,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, AuditError> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if name.is_empty() {
            return Err(AuditError::BadRequest("topic name must not be empty".into()));
        }
        for required in [FIELD_ID, FIELD_TIMESTAMP, FIELD_TRANSACTION_ID] {
            if !fields.iter().any(|f| f == required) {
                return Err(AuditError::BadRequest(format!(
                    "topic '{name}' schema is missing the mandatory field '{required}'"
                )));
            }
        }
        for reserved in RESERVED_FIELDS {
            if fields.iter().any(|f| f == reserved) {
                return Err(AuditError::BadRequest(format!(
                    "topic '{name}' schema uses the reserved field name '{reserved}'"
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    /// Schema holding only the core fields, then `extra` in order.
    pub fn with_core_fields(
        name: &str,
        extra: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, AuditError> {
        let mut fields = vec![
            FIELD_ID.to_string(),
            FIELD_TIMESTAMP.to_string(),
            FIELD_TRANSACTION_ID.to_string(),
        ];
        fields.extend(extra.into_iter().map(Into::into));
        Self::new(name, fields)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Registry of every topic the service accepts. Populated at startup and
/// immutable thereafter; unknown topics are rejected with `NotSupported`.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    topics: BTreeMap<String, TopicSchema>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: TopicSchema) -> Result<(), AuditError> {
        let name = schema.name().to_string();
        if self.topics.contains_key(&name) {
            return Err(AuditError::BadRequest(format!(
                "topic '{name}' is already registered"
            )));
        }
        self.topics.insert(name, schema);
        Ok(())
    }

    pub fn get(&self, topic: &str) -> Result<&TopicSchema, AuditError> {
        self.topics.get(topic).ok_or_else(|| {
            AuditError::NotSupported(format!("unknown event topic '{topic}'"))
        })
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
