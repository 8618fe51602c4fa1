//! Audit service configuration: topic schemas and sink designations.

use domain::topic::{TopicRegistry, TopicSchema};
use serde::{Deserialize, Serialize};

use super::common::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Name of the sink that answers `read` and `query`. When absent or
    /// unregistered, queries fail with an informative error.
    #[serde(default)]
    pub handler_for_queries: Option<String>,

    /// Every topic the service accepts, with its ordered field list.
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub fields: Vec<String>,
}

impl ServiceConfig {
    /// Build the immutable topic registry the service is constructed with.
    pub fn to_registry(&self) -> Result<TopicRegistry, ConfigError> {
        let mut registry = TopicRegistry::new();
        for (idx, topic) in self.topics.iter().enumerate() {
            let schema = TopicSchema::new(&topic.name, topic.fields.clone()).map_err(|e| {
                ConfigError::Validation {
                    field: format!("service.topics[{idx}]"),
                    message: e.to_string(),
                }
            })?;
            registry.register(schema).map_err(|e| ConfigError::Validation {
                field: format!("service.topics[{idx}]"),
                message: e.to_string(),
            })?;
        }
        Ok(registry)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::Validation {
                field: "service.topics".to_string(),
                message: "at least one topic is required".to_string(),
            });
        }
        // Schema-level checks (mandatory fields, duplicates) run here so a
        // bad config fails at load time rather than at service build time.
        self.to_registry().map(|_| ())
    }
}
