// ABOUTME: Template module rendering node parameters and conditions
// ABOUTME: Provides the renderer seam and its handlebars implementation

pub mod engine;
pub mod error;
pub mod helpers;
pub mod renderer;

pub use engine::TemplateEngine;
pub use error::{Result, TemplateError};
pub use renderer::{is_truthy, ParameterRenderer};
