//! Benchmark variants and the registry holding them.

use std::fmt;

use crate::engine::BenchmarkEngine;
use crate::error::{Error, Result};
use crate::models::RunState;

/// A named comparison target: one engine configuration plus its run state
pub struct BenchmarkVariant {
    name: String,
    description: Option<String>,
    engine: Box<dyn BenchmarkEngine>,
    /// State of the current or last run
    pub state: RunState,
}

impl BenchmarkVariant {
    /// Create a new variant around an engine adapter
    pub fn new(name: impl Into<String>, engine: Box<dyn BenchmarkEngine>) -> Self {
        Self {
            name: name.into(),
            description: None,
            engine,
            state: RunState::default(),
        }
    }

    /// Attach a human readable description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn engine(&self) -> &dyn BenchmarkEngine {
        self.engine.as_ref()
    }

    /// Borrow the engine and the run state at the same time
    pub fn parts_mut(&mut self) -> (&mut dyn BenchmarkEngine, &mut RunState) {
        (self.engine.as_mut(), &mut self.state)
    }
}

impl fmt::Debug for BenchmarkVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkVariant")
            .field("name", &self.name)
            .field("engine", &self.engine.kind())
            .field("state", &self.state.status)
            .finish()
    }
}

/// Insertion ordered set of variants addressable by unique name
#[derive(Debug, Default)]
pub struct VariantRegistry {
    variants: Vec<BenchmarkVariant>,
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variant, rejecting duplicate names
    pub fn register(&mut self, variant: BenchmarkVariant) -> Result<()> {
        if self.contains(variant.name()) {
            return Err(Error::DuplicateVariant(variant.name().to_string()));
        }
        self.variants.push(variant);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variants.iter().any(|v| v.name() == name)
    }

    pub fn get(&self, name: &str) -> Result<&BenchmarkVariant> {
        self.variants
            .iter()
            .find(|v| v.name() == name)
            .ok_or_else(|| Error::not_found(format!("variant '{}'", name)))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut BenchmarkVariant> {
        self.variants
            .iter_mut()
            .find(|v| v.name() == name)
            .ok_or_else(|| Error::not_found(format!("variant '{}'", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BenchmarkVariant> {
        self.variants.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.variants.iter().map(|v| v.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}
