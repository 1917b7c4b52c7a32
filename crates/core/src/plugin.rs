//! Component lifecycle and registry.
//!
//! Every long-running part of the daemon (the CDC pipeline, the notifier,
//! the query API) implements [`Plugin`]. The [`PluginRegistry`] starts them
//! in registration order and stops them in the same order, so producers
//! stop before their consumers drain.
//!
//! ```text
//! Created -> init() -> Initialized -> start() -> Running -> stop() -> Stopped
//! ```

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BinwatchError, PluginError};
use crate::pipeline::{BoxFuture, HealthStatus};

/// Which part of the daemon a plugin is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    /// Replication ingestion (reader, filter, normalizer, store, rules).
    Pipeline,
    Notifier,
    /// Read-only HTTP query surface.
    Api,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pipeline => "pipeline",
            Self::Notifier => "notifier",
            Self::Api => "api",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Unique within a registry, e.g. `"cdc-pipeline"`.
    pub name: String,
    pub version: String,
    pub description: String,
    pub plugin_type: PluginType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Created,
    Initialized,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        })
    }
}

/// One row of [`PluginRegistry::health`].
#[derive(Debug, Clone)]
pub struct PluginHealth {
    pub name: String,
    pub plugin_type: PluginType,
    pub state: PluginState,
    pub status: HealthStatus,
}

/// Lifecycle trait for daemon components.
pub trait Plugin: Send + Sync {
    fn info(&self) -> &PluginInfo;

    fn state(&self) -> PluginState;

    /// Allocate resources. Called once, from `Created`.
    fn init(&mut self) -> impl Future<Output = Result<(), BinwatchError>> + Send;

    /// Spawn background work. Called from `Initialized` or `Stopped`.
    fn start(&mut self) -> impl Future<Output = Result<(), BinwatchError>> + Send;

    /// Graceful shutdown. Must drain in-flight work before returning.
    fn stop(&mut self) -> impl Future<Output = Result<(), BinwatchError>> + Send;

    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// Object-safe mirror of [`Plugin`], implemented for every `Plugin`.
pub trait DynPlugin: Send + Sync {
    fn info(&self) -> &PluginInfo;
    fn state(&self) -> PluginState;
    fn init(&mut self) -> BoxFuture<'_, Result<(), BinwatchError>>;
    fn start(&mut self) -> BoxFuture<'_, Result<(), BinwatchError>>;
    fn stop(&mut self) -> BoxFuture<'_, Result<(), BinwatchError>>;
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Plugin> DynPlugin for T {
    fn info(&self) -> &PluginInfo {
        Plugin::info(self)
    }

    fn state(&self) -> PluginState {
        Plugin::state(self)
    }

    fn init(&mut self) -> BoxFuture<'_, Result<(), BinwatchError>> {
        Box::pin(Plugin::init(self))
    }

    fn start(&mut self) -> BoxFuture<'_, Result<(), BinwatchError>> {
        Box::pin(Plugin::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), BinwatchError>> {
        Box::pin(Plugin::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Plugin::health_check(self))
    }
}

/// Ordered set of plugins.
///
/// Register producers before consumers: `stop_all` walks the same order so
/// the pipeline stops feeding the notifier before the notifier drains.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn DynPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if a plugin with the same name is already registered.
    pub fn register(&mut self, plugin: Box<dyn DynPlugin>) -> Result<(), BinwatchError> {
        let name = &plugin.info().name;
        if self.plugins.iter().any(|p| &p.info().name == name) {
            return Err(PluginError::AlreadyRegistered { name: name.clone() }.into());
        }
        debug!(plugin = %name, kind = %plugin.info().plugin_type, "plugin registered");
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn state_of(&self, name: &str) -> Option<PluginState> {
        self.plugins
            .iter()
            .find(|p| p.info().name == name)
            .map(|p| p.state())
    }

    /// Initialise in order; stops at the first failure.
    pub async fn init_all(&mut self) -> Result<(), BinwatchError> {
        for plugin in &mut self.plugins {
            if plugin.state() == PluginState::Created {
                plugin.init().await?;
            }
        }
        Ok(())
    }

    /// Start in order; stops at the first failure. Caller rolls back with `stop_all`.
    pub async fn start_all(&mut self) -> Result<(), BinwatchError> {
        for plugin in &mut self.plugins {
            plugin.start().await?;
            debug!(plugin = %plugin.info().name, "plugin started");
        }
        Ok(())
    }

    /// Stop every running plugin, collecting errors instead of bailing out.
    pub async fn stop_all(&mut self) -> Result<(), BinwatchError> {
        let mut errors = Vec::new();
        for plugin in &mut self.plugins {
            if plugin.state() != PluginState::Running {
                continue;
            }
            if let Err(e) = plugin.stop().await {
                errors.push(format!("{}: {e}", plugin.info().name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PluginError::StopFailed(errors.join("; ")).into())
        }
    }

    pub fn count(&self) -> usize {
        self.plugins.len()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.info().name.clone()).collect()
    }

    pub async fn health(&self) -> Vec<PluginHealth> {
        let mut report = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            report.push(PluginHealth {
                name: plugin.info().name.clone(),
                plugin_type: plugin.info().plugin_type,
                state: plugin.state(),
                status: plugin.health_check().await,
            });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::PipelineError;

    struct MockPlugin {
        info: PluginInfo,
        state: PluginState,
        fail_on_start: bool,
        fail_on_stop: bool,
        stop_log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl MockPlugin {
        fn new(name: &str, plugin_type: PluginType) -> Self {
            Self {
                info: PluginInfo {
                    name: name.to_owned(),
                    version: "0.1.0".to_owned(),
                    description: format!("mock {name}"),
                    plugin_type,
                },
                state: PluginState::Created,
                fail_on_start: false,
                fail_on_stop: false,
                stop_log: None,
            }
        }

        fn failing_start(mut self) -> Self {
            self.fail_on_start = true;
            self
        }

        fn failing_stop(mut self) -> Self {
            self.fail_on_stop = true;
            self
        }

        fn logging_stops(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
            self.stop_log = Some(log);
            self
        }
    }

    impl Plugin for MockPlugin {
        fn info(&self) -> &PluginInfo {
            &self.info
        }

        fn state(&self) -> PluginState {
            self.state
        }

        async fn init(&mut self) -> Result<(), BinwatchError> {
            self.state = PluginState::Initialized;
            Ok(())
        }

        async fn start(&mut self) -> Result<(), BinwatchError> {
            if self.fail_on_start {
                self.state = PluginState::Failed;
                return Err(PipelineError::InitFailed("mock start failure".to_owned()).into());
            }
            self.state = PluginState::Running;
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), BinwatchError> {
            if let Some(log) = &self.stop_log {
                log.lock().unwrap().push(self.info.name.clone());
            }
            if self.fail_on_stop {
                self.state = PluginState::Failed;
                return Err(PipelineError::InitFailed("mock stop failure".to_owned()).into());
            }
            self.state = PluginState::Stopped;
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            match self.state {
                PluginState::Running => HealthStatus::Healthy,
                PluginState::Failed => HealthStatus::Unhealthy("failed".to_owned()),
                _ => HealthStatus::Degraded("not running".to_owned()),
            }
        }
    }

    #[test]
    fn names_render_lowercase() {
        assert_eq!(PluginType::Pipeline.to_string(), "pipeline");
        assert_eq!(PluginType::Api.to_string(), "api");
        assert_eq!(PluginState::Initialized.to_string(), "initialized");
        assert_eq!(
            serde_json::to_string(&PluginState::Running).unwrap(),
            "\"running\""
        );
    }

    #[test]
    fn register_duplicate_name_fails() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Box::new(MockPlugin::new("cdc-pipeline", PluginType::Pipeline)))
            .unwrap();
        let err = registry
            .register(Box::new(MockPlugin::new("cdc-pipeline", PluginType::Pipeline)))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unknown_plugin_has_no_state() {
        let registry = PluginRegistry::default();
        assert!(registry.state_of("ghost").is_none());
        assert!(registry.names().is_empty());
    }

    #[tokio::test]
    async fn full_lifecycle_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry
            .register(Box::new(
                MockPlugin::new("cdc-pipeline", PluginType::Pipeline).logging_stops(log.clone()),
            ))
            .unwrap();
        registry
            .register(Box::new(
                MockPlugin::new("notifier", PluginType::Notifier).logging_stops(log.clone()),
            ))
            .unwrap();

        registry.init_all().await.unwrap();
        registry.start_all().await.unwrap();
        let health = registry.health().await;
        assert!(health.iter().all(|h| h.status.is_healthy()));
        assert_eq!(health[1].plugin_type, PluginType::Notifier);
        assert_eq!(registry.names(), ["cdc-pipeline", "notifier"]);

        registry.stop_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["cdc-pipeline", "notifier"]);
        assert_eq!(registry.state_of("notifier"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn start_all_fails_fast() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Box::new(
                MockPlugin::new("a", PluginType::Pipeline).failing_start(),
            ))
            .unwrap();
        registry
            .register(Box::new(MockPlugin::new("b", PluginType::Notifier)))
            .unwrap();
        registry.init_all().await.unwrap();
        assert!(registry.start_all().await.is_err());
        assert_eq!(registry.state_of("b"), Some(PluginState::Initialized));
    }

    #[tokio::test]
    async fn stop_all_continues_after_error() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Box::new(
                MockPlugin::new("a", PluginType::Pipeline).failing_stop(),
            ))
            .unwrap();
        registry
            .register(Box::new(MockPlugin::new("b", PluginType::Api)))
            .unwrap();
        registry.init_all().await.unwrap();
        registry.start_all().await.unwrap();

        let err = registry.stop_all().await.unwrap_err();
        assert!(err.to_string().contains("a:"));
        assert_eq!(registry.state_of("b"), Some(PluginState::Stopped));
    }
}
