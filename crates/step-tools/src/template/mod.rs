//! Template module.
//!
//! Resolves `{{var}}` placeholders in step parameters using minijinja with
//! strict undefined handling, so a missing variable is an error rather than
//! an empty string.

mod engine;

pub use engine::TemplateEngine;
