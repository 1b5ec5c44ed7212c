use std::sync::Arc;
use std::time::Duration;

use crate::error::ProcessorError;
use crate::executor::{TaskExecutor, TokioExecutor};
use crate::token::GlobalSequenceToken;

/// A function producing the bootstrap token for a brand new segment set.
/// Typically a thin wrapper around `MessageSource::create_tail_token`; kept
/// as a plain closure type (rather than threading the message source itself
/// through configuration) so tests can supply a fixed value.
pub type InitialTokenFn = Arc<dyn Fn() -> GlobalSequenceToken + Send + Sync>;

/// Construction-time settings, validated once by `ConfigurationBuilder`
/// rather than assigned field-by-field after the fact.
#[derive(Clone)]
pub struct Configuration {
    pub name: String,
    pub initial_segment_count: u32,
    pub initial_token: Option<InitialTokenFn>,
    pub claim_extension_threshold: Duration,
    pub batch_size: usize,
    pub inbox_capacity: usize,
    pub coordinator_executor: Arc<dyn TaskExecutor>,
    pub worker_executor: Arc<dyn TaskExecutor>,
}

pub struct ConfigurationBuilder {
    name: Option<String>,
    initial_segment_count: u32,
    initial_token: Option<InitialTokenFn>,
    claim_extension_threshold: Duration,
    batch_size: usize,
    inbox_capacity: usize,
    coordinator_executor: Option<Arc<dyn TaskExecutor>>,
    worker_executor: Option<Arc<dyn TaskExecutor>>,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        ConfigurationBuilder {
            name: None,
            initial_segment_count: 32,
            initial_token: None,
            claim_extension_threshold: Duration::from_secs(5),
            batch_size: 100,
            inbox_capacity: 1024,
            coordinator_executor: None,
            worker_executor: None,
        }
    }
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        ConfigurationBuilder::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn initial_segment_count(mut self, count: u32) -> Self {
        self.initial_segment_count = count;
        self
    }

    /// Overrides the bootstrap token used when a fresh segment has no prior
    /// claim in the token store. Absent an override, the coordinator falls
    /// back to `MessageSource::create_tail_token`.
    pub fn initial_token(mut self, f: InitialTokenFn) -> Self {
        self.initial_token = Some(f);
        self
    }

    pub fn claim_extension_threshold(mut self, threshold: Duration) -> Self {
        self.claim_extension_threshold = threshold;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn coordinator_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.coordinator_executor = Some(executor);
        self
    }

    pub fn worker_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.worker_executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<Configuration, ProcessorError> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ProcessorError::Configuration("name is required".to_string()))?;

        if self.initial_segment_count == 0 {
            return Err(ProcessorError::Configuration(
                "initial_segment_count must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ProcessorError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(ProcessorError::Configuration(
                "inbox_capacity must be positive".to_string(),
            ));
        }

        let shared_executor: Arc<dyn TaskExecutor> = Arc::new(TokioExecutor);
        Ok(Configuration {
            name,
            initial_segment_count: self.initial_segment_count,
            initial_token: self.initial_token,
            claim_extension_threshold: self.claim_extension_threshold,
            batch_size: self.batch_size,
            inbox_capacity: self.inbox_capacity,
            coordinator_executor: self
                .coordinator_executor
                .unwrap_or_else(|| shared_executor.clone()),
            worker_executor: self.worker_executor.unwrap_or(shared_executor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_fails_without_name() {
        let result = ConfigurationBuilder::new().build();
        assert!(matches!(result, Err(ProcessorError::Configuration(_))));
    }

    #[test]
    fn build_succeeds_with_name_and_defaults() {
        let config = ConfigurationBuilder::new().name("orders").build().unwrap();
        assert_eq!(config.name, "orders");
        assert_eq!(config.initial_segment_count, 32);
    }

    #[test]
    fn build_rejects_zero_batch_size() {
        let result = ConfigurationBuilder::new().name("orders").batch_size(0).build();
        assert!(matches!(result, Err(ProcessorError::Configuration(_))));
    }

    #[test]
    fn initial_token_override_is_carried_through() {
        let f: InitialTokenFn = Arc::new(|| GlobalSequenceToken::new(42));
        let config = ConfigurationBuilder::new()
            .name("orders")
            .initial_token(f)
            .build()
            .unwrap();
        let token = (config.initial_token.as_ref().unwrap())();
        assert_eq!(token, GlobalSequenceToken::new(42));
    }
}
