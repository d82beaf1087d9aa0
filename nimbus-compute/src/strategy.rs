//! Execution strategies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use nimbus_core::{EmulatorError, FunctionContext, InvocationResult};

use crate::container::ContainerStrategy;
use crate::subprocess::SubprocessStrategy;

/// A compiled function definition.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    /// Runtime identifier, e.g. `python3.12`, `nodejs20.x`.
    pub runtime: String,
    /// Handler spec, e.g. `index.handler`.
    pub handler: String,
    pub code_path: PathBuf,
    pub environment: HashMap<String, String>,
    pub timeout: Duration,
    pub memory_mb: u32,
    /// Container image; forces the container strategy when set.
    pub image: Option<String>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runtime: runtime.into(),
            handler: "index.handler".to_string(),
            code_path: PathBuf::from("."),
            environment: HashMap::new(),
            timeout: Duration::from_secs(30),
            memory_mb: 128,
            image: None,
        }
    }
}

/// How one function executes.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Verify prerequisites (interpreter on PATH, image available) and
    /// materialize anything the strategy needs on disk.
    async fn prepare(&self) -> Result<(), EmulatorError>;

    /// Run one invocation to completion or deadline.
    async fn invoke(
        &self,
        event: &Value,
        context: &FunctionContext,
    ) -> Result<InvocationResult, EmulatorError>;
}

/// Choose a strategy for a function at load time.
///
/// `sdk_env` carries the service-endpoint overrides injected into every
/// child; `shim_dir` is where runtime shims are materialized.
pub fn strategy_for(
    spec: FunctionSpec,
    sdk_env: HashMap<String, String>,
    shim_dir: &Path,
) -> Result<Box<dyn ExecutionStrategy>, EmulatorError> {
    if spec.image.is_some() {
        return Ok(Box::new(ContainerStrategy::new(spec, sdk_env)));
    }
    let runtime = spec.runtime.to_ascii_lowercase();
    if runtime.starts_with("python") {
        return Ok(Box::new(SubprocessStrategy::python(spec, sdk_env, shim_dir)));
    }
    if runtime.starts_with("nodejs") || runtime.starts_with("node") {
        return Ok(Box::new(SubprocessStrategy::node(spec, sdk_env, shim_dir)));
    }
    Err(EmulatorError::Configuration(format!(
        "unsupported runtime for function {}: {}",
        spec.name, spec.runtime
    )))
}

/// Resolve an executable on PATH.
pub(crate) fn find_on_path(command: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
