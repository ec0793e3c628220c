use std::path::PathBuf;
use std::process;

use nnhw_compiler::memory::address_table;
use nnhw_compiler::HwConfig;
use nnhw_cosim::scenario::{self, SCENARIOS};
use nnhw_cosim::SimConfig;

fn usage() {
    eprintln!("Usage: nnhw-cosim [OPTIONS] <SCENARIO>");
    eprintln!();
    eprintln!("Compile a built-in model and verify it bit-exactly in co-simulation.");
    eprintln!();
    eprintln!("Scenarios: {}", SCENARIOS.join(", "));
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --hw <FILE>      Hardware config JSON (bus_width, chunk_size, ...)");
    eprintln!("  --config <FILE>  Simulation config JSON (warmup_cycles, max_cycles, ...)");
    eprintln!("  --seed <N>       Stimulus seed (overrides the config)");
    eprintln!("  --par <N>        Output parallelism for every operator (default: 2)");
    eprintln!("  --list           Print the address of every tensor and exit");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG=info    Show pipeline stages and the memory map");
    eprintln!("  RUST_LOG=debug   Show every register write and operator");
}

fn number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or_else(|| {
        eprintln!("{flag} requires a number");
        process::exit(1);
    })
}

fn path(flag: &str, value: Option<String>) -> PathBuf {
    PathBuf::from(value.unwrap_or_else(|| {
        eprintln!("{flag} requires a file path");
        process::exit(1);
    }))
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mut name: Option<String> = None;
    let mut hw_path: Option<PathBuf> = None;
    let mut sim_path: Option<PathBuf> = None;
    let mut seed: Option<u64> = None;
    let mut par: usize = 2;
    let mut list = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--hw" => hw_path = Some(path("--hw", args.next())),
            "--config" => sim_path = Some(path("--config", args.next())),
            "--seed" => seed = Some(number("--seed", args.next())),
            "--par" => par = number("--par", args.next()),
            "--list" => list = true,
            "--help" | "-h" => {
                usage();
                process::exit(0);
            }
            _ => {
                if name.is_none() {
                    name = Some(arg);
                } else {
                    eprintln!("unexpected argument: {arg}");
                    process::exit(1);
                }
            }
        }
    }

    let name = name.unwrap_or_else(|| {
        usage();
        process::exit(1);
    });

    let hw = match &hw_path {
        Some(p) => HwConfig::load(p).map_err(nnhw_cosim::SimError::from),
        None => Ok(HwConfig::default()),
    };
    let sim = match &sim_path {
        Some(p) => SimConfig::load(p),
        None => Ok(SimConfig::default()),
    };

    let result = hw.and_then(|hw| {
        let mut sim = sim?;
        if let Some(seed) = seed {
            sim.seed = seed;
        }
        let scenario = scenario::by_name(&name, par, sim.seed)?;
        if list {
            let compiled = scenario.compile(hw)?;
            let mut table: Vec<_> = address_table(&compiled.design.graph).into_iter().collect();
            table.sort_by_key(|&(_, addr)| addr);
            for (tensor, addr) in table {
                println!("{addr:#010x}  {tensor}");
            }
            process::exit(0);
        }
        eprintln!("==> Simulating: {name} (par {par}, seed {})", sim.seed);
        scenario.run(hw, sim)
    });

    match result {
        Ok(report) => {
            println!("{report}");
            if !report.passed() {
                for m in report.mismatches.iter().take(10) {
                    eprintln!("  {}[{}]: expected {}, got {}", m.output, m.index, m.expected, m.actual);
                }
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
