//! Builds engines and the variant registry from configuration.

use std::path::Path;

use anyhow::{bail, Context, Result};
use descriptor_engine::{DescriptorEngine, DescriptorOptions};
use inferbench_core::{BenchmarkEngine, BenchmarkVariant, Config, VariantConfig, VariantRegistry};
use resnet_engine::{ResNetEngine, ResNetOptions};
use sequential_engine::{SequentialEngine, SequentialOptions};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Engine kinds accepted in `variants[].engine`
pub const ENGINE_KINDS: [&str; 3] = ["descriptor", "sequential", "resnet"];

/// Settings map with `base_dir` defaulted under the artifacts root
fn settings_for(variant: &VariantConfig, artifacts_dir: &Path) -> Value {
    let mut settings: Map<String, Value> = variant
        .settings
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if variant.engine != "resnet" && !settings.contains_key("base_dir") {
        let dir = artifacts_dir.join(&variant.engine);
        settings.insert(
            "base_dir".to_string(),
            Value::String(dir.to_string_lossy().into_owned()),
        );
    }
    Value::Object(settings)
}

fn options<T: DeserializeOwned>(variant: &VariantConfig, settings: Value) -> Result<T> {
    serde_json::from_value(settings)
        .with_context(|| format!("Invalid settings for variant '{}'", variant.name))
}

/// Parsed options of one variant, tagged by engine kind
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOptions {
    Descriptor(DescriptorOptions),
    Sequential(SequentialOptions),
    ResNet(ResNetOptions),
}

impl EngineOptions {
    /// Resolve a variant's settings; identical configs yield equal options
    pub fn from_variant(variant: &VariantConfig, artifacts_dir: &Path) -> Result<Self> {
        let settings = settings_for(variant, artifacts_dir);
        debug!(variant = %variant.name, engine = %variant.engine, %settings, "Resolving engine options");

        Ok(match variant.engine.as_str() {
            "descriptor" => EngineOptions::Descriptor(options(variant, settings)?),
            "sequential" => EngineOptions::Sequential(options(variant, settings)?),
            "resnet" => EngineOptions::ResNet(options(variant, settings)?),
            other => bail!(
                "Unknown engine '{}' for variant '{}', expected one of {}",
                other,
                variant.name,
                ENGINE_KINDS.join(", ")
            ),
        })
    }

    pub fn into_engine(self) -> Box<dyn BenchmarkEngine> {
        match self {
            EngineOptions::Descriptor(options) => Box::new(DescriptorEngine::new(options)),
            EngineOptions::Sequential(options) => Box::new(SequentialEngine::new(options)),
            EngineOptions::ResNet(options) => Box::new(ResNetEngine::new(options)),
        }
    }
}

/// Construct the engine a variant names
pub fn build_engine(variant: &VariantConfig, artifacts_dir: &Path) -> Result<Box<dyn BenchmarkEngine>> {
    Ok(EngineOptions::from_variant(variant, artifacts_dir)?.into_engine())
}

/// Registry holding every enabled variant, in declaration order
pub fn build_registry(config: &Config) -> Result<VariantRegistry> {
    let mut registry = VariantRegistry::new();
    for variant in config.enabled_variants() {
        let engine = build_engine(variant, &config.artifacts_dir)?;
        let mut entry = BenchmarkVariant::new(variant.name.clone(), engine);
        if let Some(description) = &variant.description {
            entry = entry.with_description(description.clone());
        }
        registry
            .register(entry)
            .with_context(|| format!("Cannot register variant '{}'", variant.name))?;
    }
    info!("Registered {} variants", registry.len());
    Ok(registry)
}
