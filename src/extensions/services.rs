//! KL-018: The `services` extension, definitions declared in YAML.

use crate::core::extension::{Extension, ExtensionError};
use crate::core::loader::service_definitions;
use crate::core::registry::Registry;
use crate::core::value::Value;

pub const ALIAS: &str = "services";

#[derive(Debug, Default)]
pub struct ServicesExtension;

impl Extension for ServicesExtension {
    fn alias(&self) -> &str {
        ALIAS
    }

    fn register(&mut self, registry: &mut Registry, config: &Value) -> Result<(), ExtensionError> {
        let definitions = service_definitions(config)?;
        tracing::debug!(count = definitions.len(), "registering declared services");
        for definition in definitions {
            registry.add(definition)?;
        }
        Ok(())
    }
}
