//! Registry of test cases.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use super::PluginTestCase;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A test named {0:?} is already registered")]
    DuplicateName(String),

    #[error("Test {name:?} has strictness {level}, expected 1-10")]
    InvalidStrictness { name: String, level: u8 },
}

/// Append-only, name-unique list of test cases in registration order.
///
/// Built once during setup and passed by reference to the engine.
#[derive(Default)]
pub struct TestRegistry {
    cases: Vec<Arc<dyn PluginTestCase>>,
    names: HashSet<String>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in suite.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        super::register_builtin(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, case: Arc<dyn PluginTestCase>) -> Result<(), RegistryError> {
        let name = case.name().to_string();
        let level = case.min_strictness();
        if !(1..=10).contains(&level) {
            return Err(RegistryError::InvalidStrictness { name, level });
        }
        if !self.names.insert(name.clone()) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.cases.push(case);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn PluginTestCase>> {
        self.cases.iter().find(|case| case.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PluginTestCase>> {
        self.cases.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.cases.iter().map(|case| case.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
