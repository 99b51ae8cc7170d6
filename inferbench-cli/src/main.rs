use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};
use inferbench_core::decoder::{encode_eightbit, encode_raw, ENCODINGS};
use inferbench_core::{Capabilities, Config, InferBench, Summary, VariantConfig, VERSION};
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

mod factory;
mod logging;
mod sink;

use sink::TerminalSink;

/// Command-line interface for the inferbench inference benchmark harness
#[derive(Debug, Parser)]
#[clap(name = "inferbench", version = VERSION, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[clap(short, long, value_name = "FILE", default_value = "config/inferbench.yaml")]
    config: PathBuf,

    /// Log at debug level
    #[clap(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Command,
}

/// inferbench CLI commands
#[derive(Debug, Subcommand)]
enum Command {
    /// Benchmark one variant, or every enabled variant
    #[clap(name = "run")]
    Run {
        /// Variant name
        #[clap(value_name = "VARIANT")]
        variant: Option<String>,

        /// Iterations including the discarded warm-up run
        #[clap(short = 'n', long)]
        iterations: Option<usize>,

        /// Pause between iterations
        #[clap(long, value_name = "MS")]
        cooldown_ms: Option<u64>,

        /// Print summaries as JSON
        #[clap(long)]
        json: bool,
    },

    /// List configured variants
    #[clap(name = "list")]
    List {
        /// Print as JSON
        #[clap(long)]
        json: bool,
    },

    /// Report optional compute capabilities
    #[clap(name = "probe")]
    Probe {
        /// Print as JSON
        #[clap(long)]
        json: bool,
    },

    /// Encode a little-endian f32 weight file
    #[clap(name = "pack")]
    Pack {
        #[clap(value_name = "INPUT")]
        input: PathBuf,

        #[clap(value_name = "OUTPUT")]
        output: PathBuf,

        /// Target encoding
        #[clap(short, long, default_value = "eightbit")]
        encoding: String,
    },

    /// Write a sample configuration and sample model artifacts
    #[clap(name = "init")]
    Init {
        /// Project directory
        #[clap(value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Show version information
    #[clap(name = "version")]
    Version,
}

fn main() -> ExitCode {
    // Parse command-line arguments
    let cli = Cli::parse();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "✗".bright_red(), e);
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    logging::init(&config.logging, cli.verbose)?;

    // Create a runtime for async operations
    let runtime = Runtime::new().context("Failed to create async runtime")?;

    match cli.command {
        Command::Run {
            variant,
            iterations,
            cooldown_ms,
            json,
        } => runtime.block_on(run_benchmarks(config, variant, iterations, cooldown_ms, json)),
        Command::List { json } => list_variants(&config, json),
        Command::Probe { json } => probe(json),
        Command::Pack {
            input,
            output,
            encoding,
        } => pack(&input, &output, &encoding),
        Command::Init { dir } => runtime.block_on(init_project(&dir)),
        Command::Version => print_version(),
    }
}

/// Config file if present, overlaid by the environment
fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        Config::default()
    };
    config.merge(&Config::from_env()?);
    if !path.exists() {
        warn!("Config file {} not found, using defaults", path.display());
    }
    Ok(config)
}

/// Run variants one after another
async fn run_benchmarks(
    mut config: Config,
    variant: Option<String>,
    iterations: Option<usize>,
    cooldown_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    if let Some(ms) = cooldown_ms {
        config.runner.cooldown_ms = ms;
    }

    let registry = factory::build_registry(&config)?;
    let names: Vec<String> = match variant {
        Some(name) => vec![name],
        None => registry.names().into_iter().map(str::to_string).collect(),
    };
    if names.is_empty() {
        bail!("No enabled variants in the configuration");
    }

    let sink = Arc::new(TerminalSink::new(json));
    let bench = InferBench::new(config, registry, sink).await?;

    let mut summaries: Vec<Summary> = Vec::new();
    let mut failed = Vec::new();
    for name in &names {
        if !json {
            println!("{} Benchmarking {}", "•".bright_green(), name.bright_cyan());
        }
        match bench.run_variant(name, iterations).await {
            Ok(summary) => {
                if !json {
                    println!("{} {}", "✓".bright_green(), summary);
                }
                summaries.push(summary);
            }
            Err(e) if names.len() == 1 => {
                return Err(e).with_context(|| format!("Benchmark of '{}' failed", name))
            }
            Err(e) => {
                eprintln!("{} {}: {}", "✗".bright_red(), name, e);
                failed.push(name.clone());
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }
    if !failed.is_empty() {
        bail!("{} of {} variants failed: {}", failed.len(), names.len(), failed.join(", "));
    }
    Ok(())
}

fn list_variants(config: &Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.variants)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Name", "Engine", "Enabled", "Settings", "Description"]);
    for variant in &config.variants {
        let mut settings: Vec<String> = variant
            .settings
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        settings.sort();
        table.add_row(vec![
            variant.name.clone(),
            variant.engine.clone(),
            if variant.enabled { "yes" } else { "no" }.to_string(),
            settings.join(" "),
            variant.description.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

fn probe(json: bool) -> Result<()> {
    let caps = Capabilities::probe();
    if json {
        println!("{}", serde_json::to_string_pretty(&caps)?);
        return Ok(());
    }
    for line in caps.advisories() {
        println!("{} {}", "•".bright_yellow(), line);
    }
    Ok(())
}

/// Re-encode a raw f32 file in one of the weight encodings
fn pack(input: &Path, output: &Path, encoding: &str) -> Result<()> {
    let bytes =
        std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    if bytes.len() % 4 != 0 {
        bail!(
            "{} is {} bytes, not a whole number of f32 values",
            input.display(),
            bytes.len()
        );
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let encoded = match encoding {
        "raw" => encode_raw(&values),
        "eightbit" => encode_eightbit(&values),
        other => bail!(
            "Unsupported encoding '{}', expected one of {}",
            other,
            ENCODINGS.join(", ")
        ),
    };
    std::fs::write(output, &encoded)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(values = values.len(), encoding, "Packed weights");
    println!(
        "{} Packed {} values: {} -> {} bytes ({})",
        "✓".bright_green(),
        values.len(),
        bytes.len(),
        encoded.len(),
        encoding
    );
    Ok(())
}

fn variant(name: &str, engine: &str, description: &str, settings: Value) -> VariantConfig {
    let settings: HashMap<String, Value> = match settings {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    VariantConfig {
        name: name.to_string(),
        engine: engine.to_string(),
        description: Some(description.to_string()),
        enabled: true,
        settings,
    }
}

/// Configuration matching the artifacts written by `init`
fn sample_config(artifacts_dir: PathBuf) -> Config {
    let mut config = Config {
        artifacts_dir,
        ..Config::default()
    };
    config.variants = vec![
        variant(
            "descriptor-native",
            "descriptor",
            "MLP descriptor, sequential kernels",
            serde_json::json!({"model": "mlp", "backend": "native"}),
        ),
        variant(
            "descriptor-threaded",
            "descriptor",
            "MLP descriptor, eightbit weights, data parallel kernels",
            serde_json::json!({"model": "mlp", "backend": "threaded"}),
        ),
        variant(
            "descriptor-fallback",
            "descriptor",
            "MLP descriptor, indexed loops",
            serde_json::json!({"model": "mlp", "backend": "fallback", "placeholders": {"N": 4}}),
        ),
        variant(
            "sequential-tiny",
            "sequential",
            "Pooled classifier, 64px input",
            serde_json::json!({"model": "tiny", "resolution": 64}),
        ),
        variant(
            "sequential-tiny-gpu",
            "sequential",
            "Pooled classifier, parallel dense layers",
            serde_json::json!({"model": "tiny", "resolution": 64, "gpu": true}),
        ),
        variant(
            "resnet18-cpu",
            "resnet",
            "ResNet-18 at 224px",
            serde_json::json!({"backend": "cpu"}),
        ),
        variant(
            "resnet18-gpu",
            "resnet",
            "ResNet-18 at 224px, parallel convolutions",
            serde_json::json!({"backend": "gpu"}),
        ),
    ];
    config
}

/// Write `config/inferbench.yaml` and sample artifacts under `dir`
async fn init_project(dir: &Path) -> Result<()> {
    println!(
        "{} Initializing project in {}",
        "•".bright_green(),
        dir.display().to_string().bright_cyan()
    );
    let artifacts = dir.join("artifacts");

    for backend in descriptor_engine::Backend::ALL {
        let options = descriptor_engine::DescriptorOptions {
            base_dir: artifacts.join("descriptor"),
            backend,
            ..Default::default()
        };
        let encoding = match backend {
            descriptor_engine::Backend::Threaded => "eightbit",
            _ => "raw",
        };
        let written = descriptor_engine::write_sample(&options, encoding).await?;
        println!("  {} {}", "+".bright_green(), written.graph.display());
    }

    let options = sequential_engine::SequentialOptions {
        base_dir: artifacts.join("sequential"),
        model: "tiny".to_string(),
        resolution: Some(64),
        gpu: false,
    };
    let written = sequential_engine::write_sample(&options).await?;
    println!("  {} {}", "+".bright_green(), written.topology.display());

    let config_path = dir.join("config").join("inferbench.yaml");
    if config_path.exists() {
        println!(
            "{} Keeping existing {}",
            "•".bright_yellow(),
            config_path.display()
        );
    } else {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(&sample_config(artifacts))
            .context("Failed to serialize sample config")?;
        std::fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("  {} {}", "+".bright_green(), config_path.display());
    }

    println!("{} Project initialized", "✓".bright_green());
    Ok(())
}

/// Print version information
fn print_version() -> Result<()> {
    println!("inferbench v{}", VERSION);
    println!("Inference benchmark harness");
    println!("Engines: {}", factory::ENGINE_KINDS.join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from([
            "inferbench",
            "run",
            "descriptor-native",
            "-n",
            "5",
            "--cooldown-ms",
            "0",
            "--json",
        ]);
        match cli.command {
            Command::Run {
                variant,
                iterations,
                cooldown_ms,
                json,
            } => {
                assert_eq!(variant.as_deref(), Some("descriptor-native"));
                assert_eq!(iterations, Some(5));
                assert_eq!(cooldown_ms, Some(0));
                assert!(json);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config, PathBuf::from("config/inferbench.yaml"));
    }

    #[test]
    fn test_sample_config_round_trips_through_yaml() {
        let config = sample_config(PathBuf::from("artifacts"));
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.variants.len(), 7);
        assert_eq!(parsed.variants[2].settings["placeholders"]["N"], 4);
        assert!(factory::build_registry(&parsed).is_ok());
    }

    #[test]
    fn test_pack_rejects_partial_values() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("w.f32");
        std::fs::write(&input, [0u8; 6]).unwrap();

        assert!(pack(&input, &dir.path().join("w.bin"), "eightbit").is_err());

        std::fs::write(&input, encode_raw(&[0.5, -1.0])).unwrap();
        pack(&input, &dir.path().join("w.bin"), "eightbit").unwrap();
        assert_eq!(std::fs::read(dir.path().join("w.bin")).unwrap().len(), 16 + 2);
        assert!(pack(&input, &dir.path().join("w.bin"), "zstd").is_err());
    }

    #[tokio::test]
    async fn test_init_then_run_every_sample_variant() {
        let dir = TempDir::new().unwrap();
        init_project(dir.path()).await.unwrap();

        let mut config = Config::from_file(dir.path().join("config/inferbench.yaml")).unwrap();
        config.runner.cooldown_ms = 0;
        config.variants.retain(|v| v.engine != "resnet");

        let registry = factory::build_registry(&config).unwrap();
        let bench = InferBench::new(config, registry, Arc::new(TerminalSink::new(true)))
            .await
            .unwrap();
        for info in bench.variants().await {
            let summary = bench.run_variant(&info.name, Some(3)).await.unwrap();
            assert_eq!(summary.samples.len(), 2);
        }
    }
}
