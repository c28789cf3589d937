//! Command line correlation tool.
//!
//! Loads a configuration document, resolves a seed query through the
//! matching store, and traverses the rule graph:
//!
//! ```bash
//! corral -c corral.yaml list domains
//! corral -c corral.yaml neighbours --query 'k8s:/api/v1/namespaces/ns1/pods' --depth 3
//! corral -c corral.yaml goals --query 'alert:{"alertname":"High"}' --class log:application
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use corral_core::domains::{self, k8s};
use corral_core::{CancelToken, Config, Constraint, Engine, Graph};

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Correlate observability signals across backends", long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Output format.
    #[arg(short, long, value_enum, default_value = "yaml")]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List domains, classes, or rules known to the engine
    List {
        /// What to list: domains, classes, rules
        #[arg(value_parser = ["domains", "classes", "rules"])]
        what: String,
    },
    /// Explore everything reachable from a seed query
    Neighbours {
        /// Seed query, e.g. 'k8s:/api/v1/namespaces/ns1/pods'
        #[arg(short, long)]
        query: String,

        /// Maximum number of rule applications from the seeds
        #[arg(short, long, default_value_t = 3)]
        depth: usize,

        /// Maximum objects merged from stores
        #[arg(long)]
        limit_total: Option<usize>,
    },
    /// Find objects of specific classes related to a seed query
    Goals {
        /// Seed query
        #[arg(short, long)]
        query: String,

        /// Goal class (domain:class); repeatable
        #[arg(short = 'g', long = "class", required = true)]
        classes: Vec<String>,

        /// Maximum objects merged from stores
        #[arg(long)]
        limit_total: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "corral=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut engine = Engine::new(domains::all())?;

    // Built-in k8s rules, then the user's configuration on top.
    let k8s_domain = engine.registry().domain("k8s")?.clone();
    engine.add_rules(k8s::selector_rules(&k8s_domain)?)?;

    if let Some(path) = &cli.config {
        let config = Config::load(path).with_context(|| format!("loading {path}"))?;
        config.apply(&mut engine)?;
    }

    match &cli.command {
        Commands::List { what } => list(&engine, what, cli.output),
        Commands::Neighbours {
            query,
            depth,
            limit_total,
        } => {
            let constraint = constraint_from(*limit_total);
            let query = engine.query(query)?;
            let seeds = engine.seed_from_query(&query, &constraint).await?;
            let graph = engine
                .neighbours(
                    vec![(query.class().clone(), seeds)],
                    *depth,
                    &constraint,
                    &CancelToken::new(),
                )
                .await?;
            print_graph(&graph, cli.output)
        }
        Commands::Goals {
            query,
            classes,
            limit_total,
        } => {
            let constraint = constraint_from(*limit_total);
            let query = engine.query(query)?;
            let seeds = engine.seed_from_query(&query, &constraint).await?;
            let goal_classes = classes
                .iter()
                .map(|c| engine.class(c))
                .collect::<Result<Vec<_>, _>>()?;
            let graph = engine
                .goals(
                    vec![(query.class().clone(), seeds)],
                    &goal_classes,
                    &constraint,
                    &CancelToken::new(),
                )
                .await?;
            print_graph(&graph, cli.output)
        }
    }
}

fn constraint_from(limit_total: Option<usize>) -> Constraint {
    let mut constraint = Constraint::new();
    if let Some(limit) = limit_total {
        constraint = constraint.with_limit_total(limit);
    }
    constraint
}

fn list(engine: &Engine, what: &str, output: Output) -> anyhow::Result<()> {
    let value = match what {
        "domains" => serde_json::json!(engine
            .registry()
            .domains()
            .map(|d| d.name().to_string())
            .collect::<Vec<_>>()),
        "classes" => serde_json::json!(engine
            .registry()
            .domains()
            .map(|d| {
                (
                    d.name().to_string(),
                    d.class_names(),
                )
            })
            .collect::<std::collections::BTreeMap<_, _>>()),
        "rules" => serde_json::json!(engine
            .rules()
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name(),
                    "start": r.start().iter().map(|c| c.full_name()).collect::<Vec<_>>(),
                    "goal": r.goal().iter().map(|c| c.full_name()).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>()),
        other => anyhow::bail!("unknown list target {other:?}"),
    };
    print_value(&value, output)
}

fn print_graph(graph: &Graph, output: Output) -> anyhow::Result<()> {
    let snapshot = graph.snapshot();
    let value = serde_json::to_value(&snapshot)?;
    print_value(&value, output)
}

fn print_value(value: &serde_json::Value, output: Output) -> anyhow::Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
