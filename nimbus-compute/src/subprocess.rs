//! Native subprocess execution.
//!
//! Each invocation spawns the language interpreter on the bundled runtime
//! shim, writes the event JSON to stdin, and reads the result document from
//! stdout. The deadline sends SIGTERM, waits one second, then force-kills.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use nimbus_core::{EmulatorError, FunctionContext, InvocationErrorKind, InvocationResult};

use crate::env::build_invocation_env;
use crate::result::parse_child_output;
use crate::strategy::{find_on_path, ExecutionStrategy, FunctionSpec};

const PYTHON_SHIM: &str = include_str!("shims/python_shim.py");
const NODE_SHIM: &str = include_str!("shims/node_shim.js");

/// Runs a function as an interpreter subprocess.
pub struct SubprocessStrategy {
    interpreter: String,
    shim_source: &'static str,
    shim_path: PathBuf,
    spec: FunctionSpec,
    sdk_env: HashMap<String, String>,
}

impl SubprocessStrategy {
    pub fn python(spec: FunctionSpec, sdk_env: HashMap<String, String>, shim_dir: &Path) -> Self {
        Self {
            interpreter: "python3".to_string(),
            shim_source: PYTHON_SHIM,
            shim_path: shim_dir.join("python_shim.py"),
            spec,
            sdk_env,
        }
    }

    pub fn node(spec: FunctionSpec, sdk_env: HashMap<String, String>, shim_dir: &Path) -> Self {
        Self {
            interpreter: "node".to_string(),
            shim_source: NODE_SHIM,
            shim_path: shim_dir.join("node_shim.js"),
            spec,
            sdk_env,
        }
    }
}

#[async_trait]
impl ExecutionStrategy for SubprocessStrategy {
    async fn prepare(&self) -> Result<(), EmulatorError> {
        if find_on_path(&self.interpreter).is_none() {
            return Err(EmulatorError::ProviderStart(format!(
                "{} runtime not found on PATH (required by function {})",
                self.interpreter, self.spec.name
            )));
        }
        if let Some(parent) = self.shim_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.shim_path, self.shim_source).await?;
        Ok(())
    }

    async fn invoke(
        &self,
        event: &Value,
        context: &FunctionContext,
    ) -> Result<InvocationResult, EmulatorError> {
        let env = build_invocation_env(&self.spec, &self.sdk_env, context);
        let mut command = Command::new(&self.interpreter);
        command.arg(&self.shim_path).env_clear().envs(&env);
        invoke_child(command, event.to_string(), context).await
    }
}

/// Spawn a child speaking the stdin-event / stdout-result protocol and
/// enforce the deadline. Shared by the subprocess and container strategies.
pub(crate) async fn invoke_child(
    mut command: Command,
    event_json: String,
    context: &FunctionContext,
) -> Result<InvocationResult, EmulatorError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|err| EmulatorError::Internal(format!("failed to spawn function: {err}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(event_json.as_bytes()).await?;
        // Closing stdin signals end-of-event to the shim.
        drop(stdin);
    }

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    let io = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out, err) = tokio::join!(
            stdout_pipe.read_to_end(&mut stdout),
            stderr_pipe.read_to_end(&mut stderr),
        );
        out?;
        err?;
        Ok::<(Vec<u8>, Vec<u8>), std::io::Error>((stdout, stderr))
    };

    match tokio::time::timeout(context.timeout, io).await {
        Ok(Ok((stdout, stderr))) => {
            let _ = child.wait().await;
            if !stderr.is_empty() {
                tracing::debug!(
                    function = %context.function_name,
                    stderr = %String::from_utf8_lossy(&stderr),
                    "function stderr"
                );
            }
            Ok(parse_child_output(&stdout, start.elapsed(), &context.request_id))
        }
        Ok(Err(err)) => Err(EmulatorError::Internal(format!(
            "function io failed: {err}"
        ))),
        Err(_) => {
            terminate(&mut child).await;
            let timeout_secs = context.timeout.as_secs_f64();
            Ok(InvocationResult::failure(
                InvocationErrorKind::Timeout,
                format!("Task timed out after {timeout_secs:.2} seconds"),
                start.elapsed(),
                &context.request_id,
            ))
        }
    }
}

/// SIGTERM, one second of grace, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(Duration::from_secs(1), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
}
