//! Core contracts shared by every Nimbus crate.
//!
//! Defines the provider lifecycle contract, the error taxonomy used across
//! emulator boundaries, the resolved runtime configuration, the process-wide
//! resolved-reference map, and the function invocation types.

pub mod config;
pub mod error;
pub mod invoke;
pub mod provider;
pub mod refs;

pub use config::EmulatorConfig;
pub use error::EmulatorError;
pub use invoke::{
    FunctionContext, FunctionInvoker, InvocationError, InvocationErrorKind, InvocationResult,
};
pub use provider::{Provider, ProviderStatus};
pub use refs::ReferenceMap;

/// The fixed local account identifier every emulated ARN carries.
pub const LOCAL_ACCOUNT_ID: &str = "000000000000";

/// The fixed local region every emulated ARN carries.
pub const LOCAL_REGION: &str = "local";
