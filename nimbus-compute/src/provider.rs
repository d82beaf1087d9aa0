//! The function provider.
//!
//! Binds one declared function to its execution strategy, exposing the
//! provider lifecycle to the orchestrator and [`FunctionInvoker`] to
//! gateways, pollers, and dispatchers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use nimbus_core::{
    EmulatorError, FunctionContext, FunctionInvoker, InvocationResult, Provider, ProviderStatus,
};

use crate::strategy::{strategy_for, ExecutionStrategy, FunctionSpec};

/// Provider wrapping one function and its strategy.
pub struct FunctionProvider {
    name: String,
    spec: FunctionSpec,
    strategy: Box<dyn ExecutionStrategy>,
    status: Mutex<ProviderStatus>,
}

impl FunctionProvider {
    /// Compile a function: choose the execution strategy for its runtime.
    pub fn new(
        spec: FunctionSpec,
        sdk_env: HashMap<String, String>,
        shim_dir: &Path,
    ) -> Result<Self, EmulatorError> {
        let strategy = strategy_for(spec.clone(), sdk_env, shim_dir)?;
        Ok(Self {
            name: format!("function:{}", spec.name),
            spec,
            strategy,
            status: Mutex::new(ProviderStatus::Stopped),
        })
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.spec
    }

    /// A context pre-filled with this function's declared limits.
    pub fn default_context(&self) -> FunctionContext {
        FunctionContext::new(&self.spec.name)
            .with_timeout(self.spec.timeout)
            .with_memory(self.spec.memory_mb)
    }

    fn status(&self) -> ProviderStatus {
        *self.status.lock().expect("status lock")
    }

    fn set_status(&self, status: ProviderStatus) {
        *self.status.lock().expect("status lock") = status;
    }
}

#[async_trait]
impl Provider for FunctionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), EmulatorError> {
        if self.status().is_running() {
            return Ok(());
        }
        self.set_status(ProviderStatus::Starting);
        match self.strategy.prepare().await {
            Ok(()) => {
                self.set_status(ProviderStatus::Running);
                Ok(())
            }
            Err(err) => {
                self.set_status(ProviderStatus::Error);
                Err(err)
            }
        }
    }

    async fn stop(&self) -> Result<(), EmulatorError> {
        self.set_status(ProviderStatus::Stopped);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.status().is_running()
    }
}

#[async_trait]
impl FunctionInvoker for FunctionProvider {
    fn function_name(&self) -> &str {
        &self.spec.name
    }

    fn make_context(&self) -> FunctionContext {
        self.default_context()
    }

    async fn invoke(
        &self,
        event: Value,
        context: FunctionContext,
    ) -> Result<InvocationResult, EmulatorError> {
        if !self.status().is_running() {
            return Err(EmulatorError::NotFound(format!(
                "function not running: {}",
                self.spec.name
            )));
        }
        tracing::debug!(function = %self.spec.name, request_id = %context.request_id, "invoking");
        self.strategy.invoke(&event, &context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FakeStrategy {
        fail_prepare: bool,
    }

    #[async_trait]
    impl ExecutionStrategy for FakeStrategy {
        async fn prepare(&self) -> Result<(), EmulatorError> {
            if self.fail_prepare {
                Err(EmulatorError::ProviderStart("missing interpreter".into()))
            } else {
                Ok(())
            }
        }

        async fn invoke(
            &self,
            _event: &Value,
            context: &FunctionContext,
        ) -> Result<InvocationResult, EmulatorError> {
            Ok(InvocationResult::success(
                serde_json::json!("ran"),
                Duration::from_millis(1),
                &context.request_id,
            ))
        }
    }

    fn provider(fail_prepare: bool) -> FunctionProvider {
        FunctionProvider {
            name: "function:test".to_string(),
            spec: FunctionSpec::new("test", "python3.12"),
            strategy: Box::new(FakeStrategy { fail_prepare }),
            status: Mutex::new(ProviderStatus::Stopped),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let p = provider(false);
        p.start().await.unwrap();
        p.start().await.unwrap();
        assert!(p.health_check().await);
    }

    #[tokio::test]
    async fn failed_prepare_leaves_error_status() {
        let p = provider(true);
        assert!(p.start().await.is_err());
        assert!(!p.health_check().await);
    }

    #[tokio::test]
    async fn invoke_requires_running_provider() {
        let p = provider(false);
        let err = p
            .invoke(serde_json::json!({}), FunctionContext::new("test"))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);

        p.start().await.unwrap();
        let result = p
            .invoke(serde_json::json!({}), FunctionContext::new("test"))
            .await
            .unwrap();
        assert!(result.is_success());
    }
}
