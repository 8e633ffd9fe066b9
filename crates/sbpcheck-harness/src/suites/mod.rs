//! Registered test suites.

use crate::errors::RegistryError;
use crate::registry::TestRegistry;

pub mod fill;

/// Registers every suite in `registry`.
pub fn register_all(registry: &mut TestRegistry) -> Result<(), RegistryError> {
    fill::register(registry)
}

/// Registry holding every suite.
pub fn default_registry() -> Result<TestRegistry, RegistryError> {
    let mut registry = TestRegistry::new();
    register_all(&mut registry)?;
    Ok(registry)
}
