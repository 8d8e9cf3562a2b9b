mod cli;

use agrorisk::{ModelDefinition, ModelResults, RiskModel, RuleRegistry, Table};
use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let registry = RuleRegistry::with_defaults();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Rules => {
            for name in registry.names() {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Check => {
            let definition = ModelDefinition::load(cli.model)?;
            let model = RiskModel::from_definition(&definition, &registry)?;
            for output in model.outputs() {
                println!(
                    "{}: {} rules, {} output rules",
                    output.label(),
                    output.rules().len(),
                    output.output_rules().len()
                );
            }
            println!("Model '{}' OK", model.name());
            Ok(())
        }
        Commands::Run => {
            let definition = ModelDefinition::load(cli.model)?;
            let mut model = RiskModel::from_definition(&definition, &registry)?;
            let table = read_table(cli.data.as_deref())?;
            tracing::info!(rows = table.len(), columns = ?table.column_names(), "loaded data");

            let results = model.run(&table)?;
            write_results(&results, cli.output.as_deref())
        }
    }
}

fn read_table(path: Option<&Path>) -> Result<Table> {
    let content = match path {
        Some(p) => {
            std::fs::read_to_string(p).with_context(|| format!("Failed to read {:?}", p))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read data from stdin")?;
            buf
        }
    };
    let records: Vec<Value> =
        serde_json::from_str(&content).context("Data must be a JSON array of records")?;
    Ok(Table::from_records(&records)?)
}

fn write_results(results: &[(String, ModelResults)], path: Option<&Path>) -> Result<()> {
    let mut out = Map::new();
    for (label, result) in results {
        let mut entry = Map::new();
        entry.insert("hourly".into(), Value::Array(result.hourly.to_records()));
        entry.insert("daily".into(), Value::Array(result.daily.to_records()));
        out.insert(label.clone(), Value::Object(entry));
    }
    let rendered = serde_json::to_string_pretty(&Value::Object(out))?;

    match path {
        Some(p) => std::fs::write(p, rendered).with_context(|| format!("Failed to write {:?}", p)),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", rendered)?;
            Ok(())
        }
    }
}
