//! procshift: convert T-SQL stored procedures into dbt models.
//!
//! # Usage
//!
//! ```bash
//! # Convert one procedure and print the model
//! procshift convert procs/usp_sales_report.sql -p redshift --var region=EU
//!
//! # Convert a directory into a dbt project
//! procshift convert procs/ -p glue -o out/ --scaffold --date-range 2024-01-01,2024-01-31
//!
//! # Show the write pattern only
//! procshift classify procs/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use procshift::config::Config;
use procshift::prelude::*;
use tracing::Level;

#[derive(Parser)]
#[command(name = "procshift")]
#[command(version)]
#[command(about = "T-SQL stored procedures to dbt models for Glue, Athena and Redshift", long_about = None)]
#[command(after_help = "EXAMPLES:
    procshift convert usp_orders.sql -p athena --var region=EU
    procshift convert procs/ -p redshift -o dbt/ --scaffold
    procshift classify procs/")]
struct Cli {
    /// Config file (default: ./procshift.toml, then the user config dir)
    #[arg(long, global = true, env = "PROCSHIFT_CONFIG")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a procedure file or a directory of `.sql` files
    Convert {
        /// Procedure file or directory
        path: PathBuf,

        /// Target platform: glue, athena or redshift
        #[arg(short, long)]
        platform: Option<String>,

        /// Output directory; models are printed when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Parameter value, repeatable (name=value)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Start and end date (YYYY-MM-DD,YYYY-MM-DD)
        #[arg(long, value_delimiter = ',', num_args = 2, value_name = "START,END")]
        date_range: Option<Vec<String>>,

        /// Value for the region parameter
        #[arg(long)]
        region: Option<String>,

        /// Value for the threshold parameter
        #[arg(long)]
        threshold: Option<i64>,

        /// Points subtracted per manual-review marker
        #[arg(long)]
        manual_penalty: Option<u32>,

        /// Write dbt project files around the models (requires --output)
        #[arg(long, requires = "output")]
        scaffold: bool,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Print the write pattern of each procedure
    Classify {
        /// Procedure file or directory
        path: PathBuf,
    },
    /// List platform profiles
    Platforms,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Returns `Ok(false)` when any unit failed.
fn run(cli: Cli) -> Result<bool> {
    let config = Config::discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Platforms => {
            show_platforms();
            Ok(true)
        }
        Commands::Classify { path } => classify_units(&path),
        Commands::Convert {
            path,
            platform,
            output,
            vars,
            date_range,
            region,
            threshold,
            manual_penalty,
            scaffold,
            format,
        } => {
            let platform = platform
                .or_else(|| config.convert.platform.clone())
                .ok_or_else(|| anyhow!("no platform given; use --platform or set [convert] platform"))?;

            let mut options = config.options()?;
            for var in &vars {
                let (name, value) = var
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--var expects NAME=VALUE, got '{var}'"))?;
                options = options.with_var(name.trim(), value.trim());
            }
            if let Some(range) = &date_range {
                options = options.with_date_range(&range[0], &range[1])?;
            }
            if let Some(region) = region {
                options = options.with_region(region);
            }
            if let Some(threshold) = threshold {
                options = options.with_threshold(threshold);
            }

            let penalty = manual_penalty.unwrap_or(config.convert.manual_penalty);
            let job = ConvertJob {
                platform: &platform,
                options: &options,
                penalty,
                output: output.as_deref(),
                scaffold,
                format,
                settings: &config.project,
            };
            job.run(&path)
        }
    }
}

struct ConvertJob<'a> {
    platform: &'a str,
    options: &'a ConvertOptions,
    penalty: u32,
    output: Option<&'a Path>,
    scaffold: bool,
    format: OutputFormat,
    settings: &'a ProjectSettings,
}

impl ConvertJob<'_> {
    fn run(&self, path: &Path) -> Result<bool> {
        let registry = ProfileRegistry::shared();
        let profile = registry.get(self.platform)?;
        let converter = Converter::new(registry).with_manual_penalty(self.penalty);

        let (units, mut failures) = load_units(path)?;
        let mut artifacts = Vec::new();
        for (unit, result) in units.iter().zip(converter.convert_batch(&units, self.platform, self.options)) {
            match result {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => failures.push((unit.name.clone(), e.to_string())),
            }
        }

        match self.output {
            Some(dir) => self.write(dir, &artifacts, profile.platform)?,
            None => self.print(&artifacts)?,
        }

        for (name, message) in &failures {
            eprintln!("{} {}: {}", "✗".red(), name.yellow(), message);
        }
        eprintln!(
            "{} {} converted, {} failed",
            "Done:".green().bold(),
            artifacts.len(),
            failures.len()
        );
        Ok(failures.is_empty())
    }

    fn print(&self, artifacts: &[ConversionArtifact]) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(artifacts)?),
            OutputFormat::Text => {
                for artifact in artifacts {
                    println!("{}", artifact.text);
                    eprintln!("{}", summary(artifact));
                }
            }
        }
        Ok(())
    }

    fn write(&self, dir: &Path, artifacts: &[ConversionArtifact], platform: Platform) -> Result<()> {
        let files = if self.scaffold {
            scaffold(artifacts, platform, self.settings, self.options.vars())?
        } else {
            artifacts
                .iter()
                .map(|a| ProjectFile {
                    path: PathBuf::from(format!("{}.sql", a.name)),
                    contents: a.text.clone(),
                })
                .collect()
        };
        for file in &files {
            let written = file.write_to(dir)?;
            println!("{} {}", "✓".green(), written.display());
        }
        for artifact in artifacts {
            eprintln!("{}", summary(artifact));
        }
        if matches!(self.format, OutputFormat::Json) {
            let report = dir.join("conversion_report.json");
            fs::write(&report, serde_json::to_string_pretty(artifacts)?)
                .with_context(|| format!("writing {}", report.display()))?;
        }
        Ok(())
    }
}

fn summary(artifact: &ConversionArtifact) -> String {
    let score = artifact.score.to_string();
    let score = match artifact.score {
        90..=100 => score.green(),
        60..=89 => score.yellow(),
        _ => score.red(),
    };
    format!(
        "{} {} [{}] score {} ({}/{} rules, {} manual)",
        "•".cyan(),
        artifact.name.bold(),
        artifact.pattern,
        score,
        artifact.breakdown.applied,
        artifact.breakdown.relevant,
        artifact.breakdown.markers
    )
}

/// Parse `path` or every `.sql` file directly under it. Files that fail to
/// parse are returned as failures.
fn load_units(path: &Path) -> Result<(Vec<SourceUnit>, Vec<(String, String)>)> {
    let files = if path.is_dir() {
        let mut files: Vec<PathBuf> = fs::read_dir(path)
            .with_context(|| format!("reading {}", path.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("sql")))
            .collect();
        files.sort();
        if files.is_empty() {
            bail!("no .sql files in {}", path.display());
        }
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut units = Vec::new();
    let mut failures = Vec::new();
    for file in files {
        let name = unit_name(&file);
        let text = fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        match SourceUnit::parse(&text, &name) {
            Ok(unit) => units.push(unit),
            Err(e) => failures.push((name, e.to_string())),
        }
    }
    Ok((units, failures))
}

/// Model name from a file name: lower-cased stem without a `usp_` prefix.
fn unit_name(file: &Path) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| "model".to_string());
    stem.strip_prefix("usp_").map(str::to_string).unwrap_or(stem)
}

fn classify_units(path: &Path) -> Result<bool> {
    let (units, failures) = load_units(path)?;
    for unit in &units {
        let pattern = classify(&unit.body);
        println!("{:<40} {}", unit.name.bold(), pattern.to_string().cyan());
    }
    for (name, message) in &failures {
        eprintln!("{} {}: {}", "✗".red(), name.yellow(), message);
    }
    Ok(failures.is_empty())
}

fn show_platforms() {
    for profile in ProfileRegistry::shared().iter() {
        println!(
            "{:<10} {:<14} merge={} append={}",
            profile.key().cyan().bold(),
            profile.dialect,
            profile.merge_strategy,
            profile.append_strategy
        );
    }
}
