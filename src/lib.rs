//! Kiln: declarative service graph assembly.
//!
//! Extensions contribute definitions in two phases; the frozen graph is
//! either interpreted at startup or compiled once to cached Rust source.

pub mod cache;
pub mod cli;
pub mod core;
pub mod extensions;

pub use crate::cache::ArtifactCache;
pub use crate::core::collection::{GroupAttrs, Route};
pub use crate::core::container::{Container, ContainerError, Lookup, ResolutionStack};
pub use crate::core::extension::{Dependency, Extension, ExtensionCatalog, ExtensionError};
pub use crate::core::factory::{Arity, Factories};
pub use crate::core::kernel::{Compiled, Kernel, KernelError};
pub use crate::core::node::{Node, Statement};
pub use crate::core::parameters::Parameters;
pub use crate::core::registry::{Definition, Registry};
pub use crate::core::value::{Service, ServiceRef, Value};
