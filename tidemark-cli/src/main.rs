//! Command-line interface for the tidemark migration engine.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tidemark::{Config, Engine, InfoRow, Target, VersionKey};

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Database schema migrations with versioned and repeatable scripts")]
#[command(version)]
struct Cli {
    /// Database URL (e.g. sqlite:app.db). Falls back to TIDEMARK_URL, then
    /// DATABASE_URL, then the properties file.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Properties file with tidemark.* keys (k=v lines, # comments)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Migration script location; may be given multiple times
    #[arg(long, global = true)]
    location: Vec<String>,

    /// Name of the metadata table
    #[arg(long, global = true)]
    table: Option<String>,

    /// Target version: a version number, 'latest' or 'current'
    #[arg(long, global = true)]
    target: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Migrate {
        /// Skip validation before migrating
        #[arg(long)]
        skip_validate: bool,

        /// Apply migrations with versions below the newest applied one
        #[arg(long)]
        out_of_order: bool,

        /// Baseline a non-empty database without metadata before migrating
        #[arg(long)]
        baseline_on_migrate: bool,
    },

    /// Show the state of every known migration
    Info,

    /// Validate applied migrations against resolved scripts
    Validate,

    /// Mark an existing database with a baseline version
    Baseline {
        /// Version to baseline at (default: 1)
        #[arg(long)]
        baseline_version: Option<String>,
    },

    /// Remove failed history entries and rewrite drifted checksums
    Repair,

    /// Drop user objects and reset the migration history
    Clean {
        /// Confirm that dropping data is intended
        #[arg(long)]
        allow_clean: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if let Err(err) = run(cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::default();

    if let Some(path) = &cli.config {
        let properties = read_properties(path)?;
        config = config.apply_properties(properties)?;
    }
    if let Some(url) = cli
        .url
        .clone()
        .or_else(|| std::env::var("TIDEMARK_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
    {
        config = config.with_url(url);
    }
    if !cli.location.is_empty() {
        config = config.with_locations(&cli.location);
    }
    if let Some(table) = &cli.table {
        config = config.with_table(table);
    }
    if let Some(target) = &cli.target {
        config = config.with_target(Target::parse(target)?);
    }

    match cli.command {
        Commands::Migrate {
            skip_validate,
            out_of_order,
            baseline_on_migrate,
        } => {
            if skip_validate {
                config = config.with_validate_on_migrate(false);
            }
            if out_of_order {
                config = config.with_out_of_order(true);
            }
            if baseline_on_migrate {
                config = config.with_baseline_on_migrate(true);
            }
            let mut engine = Engine::open(config)?;
            let applied = engine.migrate()?;
            println!("Successfully applied {applied} migration(s)");
        }
        Commands::Info => {
            let mut engine = Engine::open(config)?;
            let rows = engine.info()?;
            print_info(&rows);
        }
        Commands::Validate => {
            let mut engine = Engine::open(config)?;
            engine.validate()?;
            println!("Validation passed");
        }
        Commands::Baseline { baseline_version } => {
            if let Some(version) = baseline_version {
                config = config.with_baseline_version(VersionKey::parse(&version)?);
            }
            let mut engine = Engine::open(config)?;
            engine.baseline()?;
            println!("Baseline established at version {}", engine.config().baseline_version());
        }
        Commands::Repair => {
            let mut engine = Engine::open(config)?;
            engine.repair()?;
            println!("Repair complete");
        }
        Commands::Clean { allow_clean } => {
            if !allow_clean {
                return Err("refusing to drop data; re-run with --allow-clean".into());
            }
            let mut engine = Engine::open(config)?;
            engine.clean()?;
            println!("Clean complete");
        }
    }
    Ok(())
}

/// Parse a properties file: `key=value` lines, blank lines and `#` comments
/// ignored.
fn read_properties(path: &PathBuf) -> Result<Vec<(String, String)>, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read properties file {}: {e}", path.display()))?;
    let mut properties = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                properties.push((key.trim().to_string(), value.trim().to_string()))
            }
            None => {
                return Err(format!("malformed properties line: '{line}'").into());
            }
        }
    }
    Ok(properties)
}

fn print_info(rows: &[InfoRow]) {
    let headers = ["Category", "Version", "Description", "State", "Installed On"];
    let mut table: Vec<[String; 5]> = Vec::new();
    for row in rows {
        let installed_on = row
            .applied
            .as_ref()
            .map(|e| e.installed_on.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        table.push([
            row.kind().to_string(),
            row.version().map(ToString::to_string).unwrap_or_default(),
            row.description().to_string(),
            row.state.to_string(),
            installed_on,
        ]);
    }

    let mut widths: [usize; 5] = headers.map(str::len);
    for row in &table {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: [&str; 5]| {
        let mut out = String::from("|");
        for (cell, width) in cells.iter().zip(widths.iter()) {
            let width = *width;
            out.push_str(&format!(" {cell:<width$} |"));
        }
        out
    };
    let separator = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");
    println!("+{separator}+");
    println!(
        "{}",
        line([headers[0], headers[1], headers[2], headers[3], headers[4]])
    );
    println!("+{separator}+");
    for row in &table {
        println!(
            "{}",
            line([&row[0], &row[1], &row[2], &row[3], &row[4]])
        );
    }
    println!("+{separator}+");
    if table.is_empty() {
        println!("No migrations found.");
    }
}
