use std::env;

use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use cs_rust::cs_simulator::hex_seed;
use cs_rust::{SimConfig, SimRunner};

// Usage: chainsim [pow | hybrid] [--verbose]
fn main() {
    let args: Vec<String> = env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose");
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("logger init failed: {}", e);
    }

    let mode = args
        .iter()
        .skip(1)
        .find(|a| !a.starts_with("--"))
        .map(String::as_str)
        .unwrap_or("pow");

    let mut config = match mode {
        "pow" => SimConfig::pow_scenario(),
        "hybrid" => SimConfig::partition_scenario(),
        other => {
            eprintln!("unknown mode '{}', expected pow or hybrid", other);
            std::process::exit(1);
        }
    };
    config.enable_event_logging = verbose;

    info!(
        "starting {} simulation: {} nodes, {}ms + {}ms settle",
        mode, config.num_nodes, config.duration_ms, config.settle_ms
    );

    let mut runner = SimRunner::new(config);
    let result = runner.run();

    println!("{}", result);
    info!("rerun with seed {}", hex_seed(&result.seed_used));
}
