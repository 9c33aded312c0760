// Scenario Runner - Load and execute scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/partition_heal.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/pow_convergence.yaml --seed 0x1234...

use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};
use simple_logger::SimpleLogger;

use cs_rust::{SimConfig, SimRunner};

/// Scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Simulation configuration; unset fields keep their defaults
    #[serde(default)]
    config: SimConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

fn main() {
    if let Err(e) = SimpleLogger::new().with_level(log::LevelFilter::Info).init() {
        eprintln!("logger init failed: {}", e);
    }

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED_HEX]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/pow_convergence.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/partition_heal.yaml --seed 0x123456...", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    // Parse optional seed
    let seed: Option<[u8; 32]> = if args.len() >= 4 && args[2] == "--seed" {
        match parse_seed_hex(&args[3]) {
            Ok(seed) => Some(seed),
            Err(e) => {
                eprintln!("Invalid hex seed: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let scenarios = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        find_scenarios(path)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", path.display());
        std::process::exit(1);
    }

    let mut failed = 0;
    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        if let Err(e) = run_scenario_file(scenario_path, seed) {
            error!("{}: {}", scenario_path.display(), e);
            failed += 1;
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
}

fn find_scenarios(dir: &Path) -> Vec<PathBuf> {
    let mut scenarios = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some("yaml") || ext == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();
    scenarios
}

fn run_scenario_file(path: &Path, seed: Option<[u8; 32]>) -> Result<(), Box<dyn Error>> {
    info!("Loading scenario from: {}", path.display());

    let yaml_content = fs::read_to_string(path)?;
    let scenario: ScenarioFile = serde_yaml::from_str(&yaml_content)?;

    let title = scenario
        .meta
        .name
        .clone()
        .unwrap_or_else(|| path.display().to_string());
    println!("=== {} ===", title);
    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }
    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let mut config = scenario.config;
    config.seed = seed;

    println!("Configuration:");
    println!("  Nodes: {}", config.num_nodes);
    println!("  Consensus: {:?}", config.consensus);
    println!("  Latency: {}..={}ms", config.latency_min_ms, config.latency_max_ms);
    println!("  Duration: {}ms (+{}ms settle)", config.duration_ms, config.settle_ms);
    println!("  k_finality: {}", config.k_finality);
    println!("  Schedule: {} event(s)", config.schedule.len());
    println!("\nStarting simulation...\n");

    let csv_path = config.csv_output_path.clone();
    let mut runner = SimRunner::new(config);
    let result = runner.run();

    println!("{}", result);

    if let Some(csv_path) = csv_path {
        runner.export_events_csv(&csv_path)?;
        info!("events written to {}", csv_path);
    }

    if !result.faults.is_empty() {
        return Err(format!("{} node(s) halted finality", result.faults.len()).into());
    }

    Ok(())
}

fn parse_seed_hex(hex: &str) -> Result<[u8; 32], Box<dyn Error>> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i >= 32 {
            break;
        }
        let byte_str = std::str::from_utf8(chunk)?;
        seed[i] = u8::from_str_radix(byte_str, 16)?;
    }

    Ok(seed)
}
