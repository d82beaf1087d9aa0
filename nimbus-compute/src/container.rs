//! Container execution.
//!
//! Runs the function inside `docker run -i` against the declared image. The
//! image's entrypoint must speak the same stdin-event / stdout-result
//! protocol as the subprocess shims. Only the function's declared
//! environment, the endpoint overrides, and the fixed keys cross the
//! container boundary; the emulator's own process environment does not.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use nimbus_core::{EmulatorError, FunctionContext, InvocationResult};

use crate::strategy::{find_on_path, ExecutionStrategy, FunctionSpec};
use crate::subprocess::invoke_child;

/// Runs a function in a container via the docker CLI.
pub struct ContainerStrategy {
    spec: FunctionSpec,
    sdk_env: HashMap<String, String>,
}

impl ContainerStrategy {
    pub fn new(spec: FunctionSpec, sdk_env: HashMap<String, String>) -> Self {
        Self { spec, sdk_env }
    }

    fn image(&self) -> &str {
        self.spec.image.as_deref().unwrap_or_default()
    }

    fn container_env(&self, context: &FunctionContext) -> Vec<(String, String)> {
        let mut env: HashMap<String, String> = self.spec.environment.clone();
        env.extend(self.sdk_env.clone());
        env.extend(context.env_overrides.clone());
        env.insert("NIMBUS_HANDLER".to_string(), self.spec.handler.clone());
        env.insert("NIMBUS_REQUEST_ID".to_string(), context.request_id.clone());
        env.insert(
            "NIMBUS_FUNCTION_ARN".to_string(),
            context.function_arn.clone(),
        );
        env.insert(
            "NIMBUS_TIMEOUT".to_string(),
            context.timeout.as_secs().to_string(),
        );
        env.insert(
            "AWS_LAMBDA_FUNCTION_NAME".to_string(),
            self.spec.name.clone(),
        );
        env.insert(
            "AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(),
            context.memory_limit_mb.to_string(),
        );
        let mut pairs: Vec<_> = env.into_iter().collect();
        pairs.sort();
        pairs
    }
}

#[async_trait]
impl ExecutionStrategy for ContainerStrategy {
    async fn prepare(&self) -> Result<(), EmulatorError> {
        if find_on_path("docker").is_none() {
            return Err(EmulatorError::ProviderStart(format!(
                "docker CLI not found on PATH (required by function {})",
                self.spec.name
            )));
        }
        let status = Command::new("docker")
            .args(["image", "inspect", self.image()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|err| EmulatorError::ProviderStart(format!("docker not runnable: {err}")))?;
        if !status.success() {
            return Err(EmulatorError::ProviderStart(format!(
                "container image not available: {}",
                self.image()
            )));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        event: &Value,
        context: &FunctionContext,
    ) -> Result<InvocationResult, EmulatorError> {
        let mut command = Command::new("docker");
        command.args(["run", "--rm", "-i", "--network", "host"]);
        command.args(["--memory", &format!("{}m", context.memory_limit_mb)]);
        for (key, value) in self.container_env(context) {
            command.arg("--env").arg(format!("{key}={value}"));
        }
        command.arg(self.image());
        invoke_child(command, event.to_string(), context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_env_excludes_process_environment() {
        std::env::set_var("NIMBUS_TEST_LEAK_CHECK", "leaky");
        let mut spec = FunctionSpec::new("f", "provided");
        spec.image = Some("local/fn:latest".to_string());
        spec.environment
            .insert("DECLARED".to_string(), "yes".to_string());
        let strategy = ContainerStrategy::new(
            spec,
            HashMap::from([("ENDPOINT".to_string(), "http://localhost:4600".to_string())]),
        );

        let env = strategy.container_env(&FunctionContext::new("f"));
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"DECLARED"));
        assert!(keys.contains(&"ENDPOINT"));
        assert!(keys.contains(&"NIMBUS_HANDLER"));
        assert!(!keys.contains(&"NIMBUS_TEST_LEAK_CHECK"));
        std::env::remove_var("NIMBUS_TEST_LEAK_CHECK");
    }
}
