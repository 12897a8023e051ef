//! cqlharness - developer tooling for embedded CQL test fixtures
//!
//! - `tokenize` shows how a script is split into statements
//! - `ports` allocates a port plan the way a bring-up would
//! - `config` prints the effective configuration

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cqlharness_core::{
    init_tracing, tokenize, tokenize_raw, HarnessConfig, PortAllocator, PortName,
    TemplateVariables,
};

#[derive(Parser)]
#[command(name = "cqlharness", version)]
#[command(about = "Developer tooling for embedded CQL test fixtures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the statements of a CQL script, one per line
    Tokenize {
        file: PathBuf,
        /// Template variable, `name=value`; enables substitution
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Allocate a free port for every engine interface
    Ports,
    /// Print the effective configuration as JSON
    Config {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn parse_var(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    Ok((name.trim().to_string(), value.to_string()))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Tokenize { file, vars } => tokenize_file(&file, vars),
        Command::Ports => print_ports(),
        Command::Config { file } => print_config(file),
    }
}

fn tokenize_file(file: &Path, vars: Vec<(String, String)>) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let statements = if vars.is_empty() {
        tokenize_raw(text.lines())?
    } else {
        tokenize(text.lines(), &TemplateVariables::from_iter(vars))?
    };
    for statement in statements {
        println!("{statement}");
    }
    Ok(())
}

fn print_ports() -> Result<()> {
    let allocator = PortAllocator::new();
    let reservations = PortName::ALL
        .into_iter()
        .map(|name| allocator.reserve(name, name.default_policy()))
        .collect::<cqlharness_core::Result<Vec<_>>>()?;
    for reservation in &reservations {
        println!("{:<12} {}", reservation.name(), reservation.port());
    }
    Ok(())
}

fn print_config(file: Option<PathBuf>) -> Result<()> {
    let config = match file {
        Some(path) => HarnessConfig::from_json_file(path)?,
        None => HarnessConfig::default(),
    }
    .with_env_overrides();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
