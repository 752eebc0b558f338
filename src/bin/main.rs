//! Quiver CLI - Compile models to SQL
//!
//! Usage:
//!   quiver compile <model.json> [--query <name> | --index <n> | --text <query.json>] [--dialect <dialect>]
//!   quiver model <model.json> [--json]
//!   quiver build-plan <model.json>
//!   quiver dialects
//!
//! Examples:
//!   quiver compile models/flights.json --query by_carrier
//!   quiver compile models/flights.json --index 0 --dialect snowflake --timing
//!   quiver build-plan models/flights.json

use clap::{Parser, Subcommand, ValueEnum};
use quiver::cache::InMemoryModelCache;
use quiver::config::Settings;
use quiver::diagnostics::{render, Diagnostic};
use quiver::model::NamedObject;
use quiver::runtime::{CompileOutcome, FileUrlReader, QueryRequest, QueryTarget, Runtime};
use quiver::sql::dialect::{dialect_names, get_dialect};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quiver")]
#[command(about = "Quiver - A semantic query compiler that emits multi-dialect SQL")]
#[command(version)]
struct Cli {
    /// Config file (overrides QUIVER_CONFIG and quiver.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query of a model to SQL
    Compile {
        /// Path to the model document
        file: PathBuf,

        /// Named query to compile
        #[arg(short, long, conflicts_with_all = ["index", "text"])]
        query: Option<String>,

        /// Index of a run statement (defaults to the first)
        #[arg(short, long, conflicts_with = "text")]
        index: Option<usize>,

        /// Query document compiled against the model
        #[arg(short, long)]
        text: Option<PathBuf>,

        /// SQL dialect to generate instead of the source's own
        #[arg(short, long)]
        dialect: Option<String>,

        /// Row limit for queries that set none
        #[arg(long)]
        row_limit: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "sql")]
        output: OutputFormat,

        /// Print phase timings to stderr
        #[arg(long)]
        timing: bool,
    },

    /// List the sources and queries of a model
    Model {
        /// Path to the model document
        file: PathBuf,

        /// Print the whole model as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the build levels of the persisted queries of a model
    BuildPlan {
        /// Path to the model document
        file: PathBuf,
    },

    /// List registered SQL dialects
    Dialects,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Output SQL only
    Sql,
    /// Output SQL with comments
    Verbose,
    /// Output the compiled query as JSON
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Commands::Dialects = cli.command {
        return cmd_dialects();
    }

    let runtime = match build_runtime(&settings) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let tokio = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Compile {
            file,
            query,
            index,
            text,
            dialect,
            row_limit,
            output,
            timing,
        } => {
            let target = match (query, index, text) {
                (Some(name), _, _) => QueryTarget::Named(name),
                (_, _, Some(path)) => match fs::read_to_string(&path) {
                    Ok(text) => QueryTarget::Text(text),
                    Err(e) => {
                        eprintln!("Error reading file '{}': {}", path.display(), e);
                        return ExitCode::FAILURE;
                    }
                },
                (_, index, _) => QueryTarget::Index(index.unwrap_or(0)),
            };
            tokio.block_on(cmd_compile(
                &runtime, &settings, file, target, dialect, row_limit, output, timing,
            ))
        }
        Commands::Model { file, json } => tokio.block_on(cmd_model(&runtime, file, json)),
        Commands::BuildPlan { file } => tokio.block_on(cmd_build_plan(&runtime, &settings, file)),
        Commands::Dialects => cmd_dialects(),
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings, quiver::config::SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

fn build_runtime(settings: &Settings) -> Result<Runtime, quiver::config::SettingsError> {
    let connections = settings.connection_map()?;
    let runtime = Runtime::new(Arc::new(FileUrlReader), Arc::new(connections));
    Ok(if settings.cache.enabled {
        runtime.with_cache(Arc::new(InMemoryModelCache::new()))
    } else {
        runtime
    })
}

/// `file://` URL of a model path.
fn model_url(file: &Path) -> Result<String, String> {
    let absolute = fs::canonicalize(file)
        .map_err(|e| format!("Error reading file '{}': {}", file.display(), e))?;
    url::Url::from_file_path(&absolute)
        .map(|u| u.to_string())
        .map_err(|_| format!("Cannot make a URL of '{}'", absolute.display()))
}

/// Print diagnostics, with source excerpts for the files they point into.
fn report(diagnostics: &[Diagnostic]) {
    let mut sources: HashMap<String, Option<String>> = HashMap::new();
    for diagnostic in diagnostics {
        let source = sources.entry(diagnostic.url.clone()).or_insert_with(|| {
            url::Url::parse(&diagnostic.url)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .and_then(|p| fs::read_to_string(p).ok())
        });
        match source {
            Some(text) => eprintln!("{}", render(diagnostic, text)),
            None => eprintln!("{}", diagnostic),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_compile(
    runtime: &Runtime,
    settings: &Settings,
    file: PathBuf,
    target: QueryTarget,
    dialect: Option<String>,
    row_limit: Option<u64>,
    output: OutputFormat,
    timing: bool,
) -> ExitCode {
    let url = match model_url(&file) {
        Ok(u) => u,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(name) = &dialect {
        if get_dialect(name).is_none() {
            eprintln!("Unknown dialect '{}' (known: {})", name, dialect_names().join(", "));
            return ExitCode::FAILURE;
        }
    }

    let mut options = settings.compile_options();
    options.dialect = dialect;
    if row_limit.is_some() {
        options.default_row_limit = row_limit;
    }
    let request = QueryRequest {
        model_url: url,
        target,
        options,
    };

    let outcome = match runtime.compile_query(&request).await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Compilation error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    report(outcome.diagnostics());
    if timing {
        eprintln!("timing: {}", outcome.timing());
    }

    let CompileOutcome::Compiled { value: compiled, .. } = outcome else {
        return ExitCode::FAILURE;
    };
    match output {
        OutputFormat::Sql => {
            println!("{}", compiled.sql);
        }
        OutputFormat::Verbose => {
            println!("-- Quiver Compiled SQL");
            println!("-- Model: {}", file.display());
            if let Some(name) = &compiled.query_name {
                println!("-- Query: {}", name);
            }
            println!("-- Source: {}", compiled.source_name);
            println!("-- Connection: {}", compiled.connection_name);
            println!("-- Dialect: {}", compiled.dialect);
            println!();
            println!("{}", compiled.sql);
        }
        OutputFormat::Json => match serde_json::to_string_pretty(&compiled) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error encoding output: {}", e);
                return ExitCode::FAILURE;
            }
        },
    }
    ExitCode::SUCCESS
}

async fn cmd_model(runtime: &Runtime, file: PathBuf, json: bool) -> ExitCode {
    let url = match model_url(&file) {
        Ok(u) => u,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let outcome = match runtime.compile_model(&url).await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Compilation error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    report(outcome.diagnostics());
    let CompileOutcome::Compiled { value: model, .. } = outcome else {
        return ExitCode::FAILURE;
    };

    if json {
        return match serde_json::to_string_pretty(&model) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error encoding output: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    println!("Model: {}", model.name);
    println!();

    let mut sources = Vec::new();
    let mut queries = Vec::new();
    for name in &model.exports {
        match model.contents.get(name) {
            Some(NamedObject::Source(def)) => sources.push((name, def)),
            Some(NamedObject::Query(q)) => queries.push(q),
            None => {}
        }
    }

    if !sources.is_empty() {
        println!("Sources:");
        for (name, def) in &sources {
            println!(
                "  - {} ({} fields, connection: \"{}\")",
                name,
                def.fields.len(),
                def.connection
            );
        }
        println!();
    }

    if !queries.is_empty() {
        println!("Queries:");
        for q in &queries {
            let persist = if q.persist.is_some() { " [persist]" } else { "" };
            println!("  - {}{}", q.name, persist);
        }
        println!();
    }

    println!("Run statements: {}", model.queries.len());
    let imports = model.dependencies.flatten();
    if !imports.is_empty() {
        println!("Imports:");
        for dep in imports {
            println!("  - {}", dep);
        }
    }
    ExitCode::SUCCESS
}

async fn cmd_build_plan(runtime: &Runtime, settings: &Settings, file: PathBuf) -> ExitCode {
    let url = match model_url(&file) {
        Ok(u) => u,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let outcome = match runtime.build_graph(&url, &settings.build_options()).await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Build error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    report(outcome.diagnostics());
    let CompileOutcome::Compiled { value: graph, .. } = outcome else {
        return ExitCode::FAILURE;
    };

    if graph.is_empty() {
        println!("No persisted queries.");
        return ExitCode::SUCCESS;
    }
    for (level, nodes) in graph.levels().iter().enumerate() {
        println!("Level {}:", level);
        for node in nodes {
            let table = node.table_name.as_deref().unwrap_or(&node.name);
            let digest = node.digest.get(..12).unwrap_or(&node.digest);
            println!("  - {} -> {} [{}] {}", node.name, table, node.connection, digest);
            if !node.dependencies.is_empty() {
                println!("      after: {}", node.dependencies.join(", "));
            }
        }
    }
    println!();
    println!("Leaves: {}", graph.leaves().join(", "));
    ExitCode::SUCCESS
}

fn cmd_dialects() -> ExitCode {
    for name in dialect_names() {
        println!("{}", name);
    }
    ExitCode::SUCCESS
}
