// ABOUTME: Parser module for YAML task definitions
// ABOUTME: Exports the definition data structures and the file loader

pub mod error;
pub mod node;
pub mod workflow;

pub use error::ParserError;
pub use node::{
    BranchArmDefinition, NodeDefinition, NodeKindDefinition, RetryDefinition, StepDefinition,
    SubGraphDefinition, Targets,
};
pub use workflow::{TaskDefinition, WorkflowParser};
