use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "warpbal",
    about = "WarpGrid: inspect cluster balance and defragmentation candidates",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a cluster snapshot.
    ///
    /// Prints the blended std dev, the energy, per-metric scores and, for
    /// every metric using reservation based defragmentation, the nodes
    /// that should be kept empty.
    Score {
        /// Cluster snapshot (JSON)
        #[arg(short, long)]
        snapshot: String,
        /// Balancing settings (TOML); defaults apply when omitted
        #[arg(long)]
        settings: Option<String>,
        /// Move cost of the state being scored
        #[arg(long, default_value_t = 0.0)]
        cost: f64,
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// List the nodes to empty for a defragmentation metric
    Candidates {
        #[arg(short, long)]
        snapshot: String,
        #[arg(long)]
        settings: Option<String>,
        /// Metric name
        #[arg(short, long)]
        metric: String,
        /// Number of nodes (default: the configured empty node target)
        #[arg(short, long)]
        count: Option<usize>,
        /// Rank nodes by their emptiness across all reservation metrics
        #[arg(long)]
        overlapping: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warpgrid_balance=info".parse()?)
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Score { snapshot, settings, cost, format } => {
            commands::score::score(&snapshot, settings.as_deref(), cost, format)
        }
        Commands::Candidates { snapshot, settings, metric, count, overlapping } => {
            commands::candidates::candidates(&snapshot, settings.as_deref(), &metric, count, overlapping)
        }
    }
}
