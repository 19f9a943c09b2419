//! Built-in extensions.
//!
//! - `services`: definitions declared in the application file
//! - `http`: middleware pipeline and route collections

pub mod http;
pub mod services;

use crate::core::extension::{Extension, ExtensionCatalog};
use crate::core::factory::Factories;

/// Aliases of every built-in extension.
pub const BUILTIN: &[&str] = &[services::ALIAS, http::ALIAS];

/// Catalog able to construct every built-in extension on demand.
pub fn catalog() -> ExtensionCatalog {
    let mut catalog = ExtensionCatalog::new();
    catalog.add(services::ALIAS, |_| {
        Ok(Box::new(services::ServicesExtension) as Box<dyn Extension>)
    });
    catalog.add(http::ALIAS, |_| {
        Ok(Box::new(http::HttpExtension::default()) as Box<dyn Extension>)
    });
    catalog
}

/// Built-in extensions needed for the given configuration sections.
/// `services` is always included.
pub fn for_sections<'a>(sections: impl IntoIterator<Item = &'a str>) -> Vec<Box<dyn Extension>> {
    let mut out: Vec<Box<dyn Extension>> = vec![Box::new(services::ServicesExtension)];
    for alias in sections {
        if alias == http::ALIAS && !out.iter().any(|e| e.alias() == http::ALIAS) {
            out.push(Box::new(http::HttpExtension::default()));
        }
    }
    out
}

/// Factories for callables the built-in extensions emit.
pub fn factories() -> Factories {
    let mut factories = Factories::new();
    http::register_factories(&mut factories);
    factories
}
