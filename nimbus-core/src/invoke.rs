//! Function invocation types.
//!
//! An invocation carries an opaque JSON event plus a [`FunctionContext`]
//! describing the target and its limits; the runtime answers with an
//! [`InvocationResult`] holding exactly one of a payload or an error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EmulatorError;
use crate::{LOCAL_ACCOUNT_ID, LOCAL_REGION};

/// Context handed to the function runtime for one invocation.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub function_name: String,
    pub request_id: String,
    pub function_arn: String,
    pub memory_limit_mb: u32,
    /// Hard deadline for the invocation, enforced by the runtime.
    pub timeout: Duration,
    /// Extra environment entries for this invocation only.
    pub env_overrides: HashMap<String, String>,
}

impl FunctionContext {
    /// A context with the default limits (128 MB, 30 s) and a fresh request
    /// identifier.
    pub fn new(function_name: impl Into<String>) -> Self {
        let function_name = function_name.into();
        let function_arn = function_arn(&function_name);
        Self {
            function_name,
            request_id: uuid::Uuid::new_v4().to_string(),
            function_arn,
            memory_limit_mb: 128,
            timeout: Duration::from_secs(30),
            env_overrides: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory(mut self, memory_limit_mb: u32) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }
}

/// The local ARN of a function by name.
pub fn function_arn(function_name: &str) -> String {
    format!("arn:aws:lambda:{LOCAL_REGION}:{LOCAL_ACCOUNT_ID}:function:{function_name}")
}

/// Why an invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationErrorKind {
    /// The handler itself raised or returned an error payload.
    Handler,
    /// The deadline elapsed before the child produced a result.
    Timeout,
    /// The child produced output the runtime could not parse.
    ParseError,
}

impl std::fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvocationErrorKind::Handler => "handler-error",
            InvocationErrorKind::Timeout => "timeout",
            InvocationErrorKind::ParseError => "parse-error",
        };
        f.write_str(s)
    }
}

/// Error descriptor inside a failed invocation.
#[derive(Debug, Clone)]
pub struct InvocationError {
    pub kind: InvocationErrorKind,
    pub message: String,
}

/// Outcome of one invocation: exactly one of payload or error.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    payload: Option<Value>,
    error: Option<InvocationError>,
    pub duration: Duration,
    pub request_id: String,
}

impl InvocationResult {
    pub fn success(payload: Value, duration: Duration, request_id: impl Into<String>) -> Self {
        Self {
            payload: Some(payload),
            error: None,
            duration,
            request_id: request_id.into(),
        }
    }

    pub fn failure(
        kind: InvocationErrorKind,
        message: impl Into<String>,
        duration: Duration,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            payload: None,
            error: Some(InvocationError {
                kind,
                message: message.into(),
            }),
            duration,
            request_id: request_id.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&InvocationError> {
        self.error.as_ref()
    }
}

/// The refined interface event-source wiring and gateways accept: something
/// that can run one function.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// The function this invoker targets.
    fn function_name(&self) -> &str;

    /// A fresh context for one invocation. Implementations override this to
    /// apply the function's declared timeout and memory limits.
    fn make_context(&self) -> FunctionContext {
        FunctionContext::new(self.function_name().to_string())
    }

    async fn invoke(
        &self,
        event: Value,
        context: FunctionContext,
    ) -> Result<InvocationResult, EmulatorError>;
}
