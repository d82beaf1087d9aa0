//! The application graph.
//!
//! Parses a synthesized cloud assembly into typed resource descriptors,
//! builds the dependency graph that drives provider startup order, and
//! resolves intrinsic markers (`Ref`, `Fn::GetAtt`, `Fn::Sub`, ...) in
//! resource properties against the resolved-reference map.

pub mod assembly;
pub mod builder;
pub mod graph;
pub mod intrinsics;
pub mod node;

pub use assembly::{load_assembly, Assembly, CfnResource, FileAsset, ImageAsset};
pub use builder::{build_graph, collect_referenced_ids};
pub use graph::AppGraph;
pub use intrinsics::IntrinsicResolver;
pub use node::{EdgeRelation, ResourceEdge, ResourceKind, ResourceNode};
