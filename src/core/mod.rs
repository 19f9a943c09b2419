//! Core engine: values, definitions, assembly, interpretation, compilation.

pub mod collection;
pub mod compiler;
pub mod container;
pub mod extension;
pub mod factory;
pub mod kernel;
pub mod loader;
pub mod node;
pub mod parameters;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod template;
pub mod value;
