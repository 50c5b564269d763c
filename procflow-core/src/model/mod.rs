mod builder;
mod node;

pub use builder::{ModelBuilder, ModelError, ProcessModel};
pub use node::{DataBinding, MessageTemplate, NodeKind, ProcessNode};
