mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};

use cli::{Cli, Commands};
use nlm_lockd::config::LockdConfig;
use nlm_lockd::dispatch::{OperationKind, DISPATCH_TABLE};
use nlm_lockd::sim::{self, Scenario, ScenarioReport};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Policy => cmd_policy(cli.json),
        Commands::Config { preset, output } => cmd_config(&preset, output.as_deref()),
        Commands::CheckConfig { config } => cmd_check_config(&config, cli.json),
        Commands::Simulate {
            scenario,
            preset,
            config,
            trace,
        } => cmd_simulate(&scenario, &preset, config, trace, cli.json),
    }
}

fn cmd_policy(as_json: bool) -> Result<()> {
    if as_json {
        let rows: Vec<_> = DISPATCH_TABLE
            .iter()
            .map(|p| {
                json!({
                    "proc": p.kind.proc_number(),
                    "name": p.kind.name(),
                    "handler": format!("{:?}", p.handler),
                    "immediate_reply": p.immediate_reply_required,
                    "reply_mode": format!("{:?}", p.deferred_reply_mode),
                    "result_proc": p.result_proc.map(OperationKind::name),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:>4}  {:<12} {:<11} {:<9} {:<9} {}", "PROC", "NAME", "HANDLER", "IMMEDIATE", "MODE", "RESULT");
    for p in DISPATCH_TABLE.iter() {
        println!(
            "{:>4}  {:<12} {:<11} {:<9} {:<9} {}",
            p.kind.proc_number(),
            p.kind.name(),
            format!("{:?}", p.handler),
            if p.immediate_reply_required { "yes" } else { "no" },
            format!("{:?}", p.deferred_reply_mode),
            p.result_proc.map(OperationKind::name).unwrap_or("-")
        );
    }
    println!();
    println!("Blocking LOCK and LOCK_MSG defer their reply: BLOCKED first, then GRANTED");
    println!("(synchronous GRANTED for LOCK, GRANTED_MSG for LOCK_MSG).");
    Ok(())
}

fn cmd_config(preset: &str, output: Option<&Path>) -> Result<()> {
    let config = LockdConfig::preset(preset).ok_or_else(|| anyhow!("unknown preset '{}'", preset))?;
    match output {
        Some(path) => {
            config.save(path)?;
            println!("Wrote {} preset to {}", preset, path.display());
        }
        None => println!("{}", config.to_json()),
    }
    Ok(())
}

fn cmd_check_config(path: &Path, as_json: bool) -> Result<()> {
    let config = LockdConfig::load(path)?;
    if as_json {
        println!(
            "{}",
            json!({
                "status": "ok",
                "node_name": config.node_name,
                "grace_period_ms": config.recovery.grace_period_ms,
                "max_blocks_per_file": config.limits.max_blocks_per_file,
            })
        );
    } else {
        println!("Configuration {} is valid", path.display());
        println!("  Node name:           {}", config.node_name);
        println!("  Grace period:        {:?}", config.recovery.grace_period());
        println!("  Granted retry:       {:?}", config.grant.retry_interval());
        println!("  Max blocks per file: {}", config.limits.max_blocks_per_file);
    }
    Ok(())
}

fn cmd_simulate(name: &str, preset: &str, config_path: Option<PathBuf>, trace: bool, as_json: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => LockdConfig::load(&path)?,
        None => LockdConfig::preset(preset).ok_or_else(|| anyhow!("unknown preset '{}'", preset))?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    let mut reports: Vec<ScenarioReport> = if name == "all" {
        runtime.block_on(sim::run_all(&config))?
    } else {
        let scenario = Scenario::parse(name).ok_or_else(|| anyhow!("unknown scenario '{}'", name))?;
        vec![runtime.block_on(sim::run(scenario, &config))?]
    };

    if !trace {
        for report in reports.iter_mut() {
            report.trace.clear();
        }
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}", report);
            for line in &report.trace {
                println!("  {}", line);
            }
        }
    }

    let failed = reports.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        return Err(anyhow!("{} scenario(s) failed", failed));
    }
    Ok(())
}
