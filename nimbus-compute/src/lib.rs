//! Function runtime.
//!
//! Each declared function is bound at load time to an execution strategy:
//! a native subprocess running the bundled runtime shim for its language, or
//! a container. Invocation serializes the event to the child's stdin, reads
//! a JSON result from stdout, and enforces the deadline with a graceful
//! terminate-then-kill.

pub mod container;
pub mod env;
pub mod provider;
pub mod result;
pub mod strategy;
pub mod subprocess;

pub use env::build_invocation_env;
pub use provider::FunctionProvider;
pub use result::parse_child_output;
pub use strategy::{strategy_for, ExecutionStrategy, FunctionSpec};
