//! Node graph construction: dependencies, inputs, nodes and steps.

mod dependency;
mod extract;
mod input;
pub mod load;
mod node;
mod step;
pub(crate) mod toposort;
mod transform;

pub use dependency::Dependency;
pub use extract::{ExtractNode, ExtractNodeBuilder, Extractor, IterExtract};
pub use input::{Arg, Input, RowNamespace};
pub use load::{
    AttrType, LoadBuffer, LoadEntity, LoadEntityBuilder, LoadNode, LoadNodeBuilder, PreparedLoad,
    PreparedRow, WriteMode, WriteStats,
};
pub use node::{ComputationalNode, NodeSpec, RowError};
pub use step::{is_valid_step_name, EtlStep, EtlStepBuilder, NodeDefinition, StepDefinition, StepNode};
pub use transform::{TransformFn, TransformInputs, TransformNode, TransformNodeBuilder};
