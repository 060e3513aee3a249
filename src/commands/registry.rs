//! Command registry: name to callable and required permission.

use std::collections::HashMap;
use std::sync::Arc;

use crate::commands::builtin;
use crate::commands::command::{DynCommand, Operation, TypedCommand};
use crate::error::RegistryError;

/// Registry of commands a worker can run.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn DynCommand>>,
}

impl CommandRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in operations.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        builtin::register_all(&mut registry)?;
        Ok(registry)
    }

    /// Register an operation. Names must be unique.
    pub fn register<O: Operation>(&mut self, operation: O) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedCommand::new(operation)))
    }

    pub fn register_dyn(&mut self, command: Arc<dyn DynCommand>) -> Result<(), RegistryError> {
        let name = command.name().to_string();
        if self.commands.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        tracing::debug!("Registered command: {}", name);
        self.commands.insert(name, command);
        Ok(())
    }

    /// Get a command by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DynCommand>> {
        self.commands.get(name).cloned()
    }

    /// List all command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
