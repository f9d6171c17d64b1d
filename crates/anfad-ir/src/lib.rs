pub mod error;
pub mod graph;
pub mod id;
pub mod nesting;
pub mod node;
pub mod primitive;
pub mod print;
pub mod provenance;
pub mod traverse;

// Re-export commonly used types
pub use error::IrError;
pub use graph::{GraphData, Program};
pub use id::{GraphId, NodeId};
pub use nesting::NestingAnalysis;
pub use node::{ConstValue, InputList, NodeData, NodeKind, Use};
pub use primitive::Primitive;
pub use provenance::{GraphProvenance, NodeProvenance, ProvenanceTable, Role};
pub use traverse::{dfs, reachable_graphs, toposort};
