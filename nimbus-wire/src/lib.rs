//! Wire-protocol dispatch.
//!
//! Every service surface speaks one of four dialects: JSON with an
//! operation header, form-encoded query-action with XML envelopes, plain
//! REST over path templates, or hybrid REST with XML sub-resources. This
//! crate holds the shared plumbing: operation tables, request decoding,
//! error envelopes, path-template compilation, and the proxy-event
//! translation for gateways and function URLs.

pub mod envelope;
pub mod proxy;
pub mod query;
pub mod rest;
pub mod target;
pub mod xml;

pub use envelope::{error_response, ErrorFormat};
pub use proxy::{
    build_v1_event, build_v2_event, is_binary_content_type, transform_handler_response,
    HttpRequestParts, HttpResponseParts, ProxyFormat,
};
pub use query::QueryDispatcher;
pub use rest::{PathTemplate, RouteSet};
pub use target::{OpContext, TargetDispatcher};
