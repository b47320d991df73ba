//! quarry CLI: explain and validate YAML-described queries against a YAML
//! catalog.

mod dsl;

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use quarry_core::config::OptimizerOptions;
use quarry_optimizer::{FileHistory, Optimization, PhysicalNode};

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Cost-based distributed query optimizer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a query and print the multi-fragment plan (EXPLAIN)
    Explain {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        /// Path to the catalog YAML file
        #[arg(short, long)]
        catalog: PathBuf,

        /// Worker count the plan targets
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Drivers per worker
        #[arg(long, default_value = "4")]
        drivers: usize,

        /// Search node budget (0 = unbounded)
        #[arg(long, default_value = "0")]
        budget: u64,

        /// History file to calibrate from (newline-delimited JSON)
        #[arg(long)]
        history: Option<PathBuf>,

        /// Print the full plan as JSON instead of a tree
        #[arg(long)]
        json: bool,
    },

    /// Parse-check a query and catalog pair
    Validate {
        #[arg(short, long)]
        query: PathBuf,

        #[arg(short, long)]
        catalog: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Explain {
            query,
            catalog,
            workers,
            drivers,
            budget,
            history,
            json,
        } => explain(&query, &catalog, workers, drivers, budget, history, json),
        Commands::Validate { query, catalog } => validate(&query, &catalog),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn explain(
    query_path: &PathBuf,
    catalog_path: &PathBuf,
    workers: usize,
    drivers: usize,
    budget: u64,
    history_path: Option<PathBuf>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = dsl::parse_catalog(&fs::read_to_string(catalog_path)?)?;
    let plan = dsl::parse_query(&fs::read_to_string(query_path)?, &catalog)?;

    let history = FileHistory::new();
    if let Some(path) = &history_path {
        history.update_from_file(&path.display().to_string())?;
    }

    let mut opts = OptimizerOptions::from_env();
    opts.num_workers = workers;
    opts.num_drivers = drivers;
    opts.search_node_budget = budget;

    let mut optimization = Optimization::new(&plan, &catalog, &history, opts)?;
    let best = optimization.best_plan()?;
    let executable = optimization.to_executable_plan(&best)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executable)?);
        return Ok(());
    }

    println!("Query Plan");
    println!("==========");
    println!();
    println!(
        "Workers: {}  Drivers: {}  Estimated cost: {:.1}",
        executable.plan.num_workers,
        executable.plan.num_drivers,
        best.total(),
    );
    println!("Estimated output rows: {:.0}", best.out_cardinality);
    println!();
    for fragment in &executable.plan.fragments {
        println!(
            "Fragment {} (width {})",
            fragment.task_prefix, fragment.width
        );
        for stage in &fragment.input_stages {
            println!(
                "  input: {} -> node {}",
                stage.task_prefix, stage.consumer_node_id
            );
        }
        print_node(&fragment.root, 1, &executable);
        println!();
    }
    Ok(())
}

fn print_node(node: &PhysicalNode, depth: usize, plan: &quarry_optimizer::PlanAndStats) {
    let indent = "  ".repeat(depth);
    let prediction = plan
        .predictions
        .get(&node.id)
        .map(|cost| {
            format!(
                "  [rows={:.0} cost={:.1}]",
                cost.input_cardinality * cost.fanout,
                cost.unit_cost
            )
        })
        .unwrap_or_default();
    println!("{indent}{} ({}){prediction}", node.op.name(), node.id);
    for input in &node.inputs {
        print_node(input, depth + 1, plan);
    }
}

fn validate(
    query_path: &PathBuf,
    catalog_path: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = dsl::parse_catalog(&fs::read_to_string(catalog_path)?)?;
    let _ = dsl::parse_query(&fs::read_to_string(query_path)?, &catalog)?;
    println!("✓ Query and catalog are valid");
    Ok(())
}
