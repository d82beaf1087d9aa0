//! Per-service HTTP surfaces.
//!
//! Each app binds a provider's logical operations onto one of the wire
//! dialects: tables, the event bus, and workflows speak JSON-with-target-
//! header; queues speak form-encoded query-action with XML envelopes; the
//! object store speaks hybrid REST.

pub mod bucket;
pub mod bus;
pub mod queue;
pub mod table;
pub mod workflow;

pub use bucket::create_bucket_app;
pub use bus::create_bus_app;
pub use queue::create_queue_app;
pub use table::create_table_app;
pub use workflow::create_workflow_app;
