//! circuit-bench CLI: compare, expand and inspect circuits

use anyhow::{Context, Result};
use circuit_bench::{
    Circuit, ComponentUniverse, Correspondence, Experiment, ExperimentConfig, JsonLinesSink,
    MetricsSink, ModelShape, TracingSink,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "circuit-bench")]
#[command(about = "Circuit comparison and ground-truth expansion for circuit-discovery benchmarks")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare a hypothesis circuit with a ground-truth circuit
    Compare {
        /// Hypothesis circuit JSON
        #[arg(long)]
        hypothesis: PathBuf,

        /// Ground-truth circuit JSON
        #[arg(long)]
        ground_truth: PathBuf,

        #[command(flatten)]
        shape: ShapeArgs,

        /// Benchmark case identifier
        #[arg(long, default_value = "3")]
        case: String,

        /// Output directory for results
        #[arg(short, long, default_value = "results")]
        output_dir: PathBuf,

        /// Experiment config JSON (overrides --case and --output-dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Append metrics as JSON lines to this file
        #[arg(long)]
        metrics_log: Option<PathBuf>,

        /// JSON array of the discovery run's mask scores
        #[arg(long)]
        mask_scores: Option<PathBuf>,
    },

    /// Expand a correspondence into a ground-truth circuit
    Expand {
        /// Correspondence JSON
        #[arg(long)]
        correspondence: PathBuf,

        #[command(flatten)]
        shape: ShapeArgs,

        /// Output circuit JSON
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List the nodes and edges of a circuit
    Inspect {
        /// Circuit JSON
        #[arg(long)]
        circuit: PathBuf,
    },
}

#[derive(Args)]
struct ShapeArgs {
    /// Number of transformer layers
    #[arg(long)]
    n_layers: usize,

    /// Attention heads per layer
    #[arg(long)]
    n_heads: usize,

    /// Exclude the token embedding from the universe
    #[arg(long)]
    no_embed: bool,

    /// Exclude the positional embedding from the universe
    #[arg(long)]
    no_pos_embed: bool,
}

impl ShapeArgs {
    fn model_shape(&self) -> ModelShape {
        let mut shape = ModelShape::new(self.n_layers, self.n_heads);
        if self.no_embed {
            shape = shape.without_embed();
        }
        if self.no_pos_embed {
            shape = shape.without_pos_embed();
        }
        shape
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Compare {
            hypothesis,
            ground_truth,
            shape,
            case,
            output_dir,
            config,
            metrics_log,
            mask_scores,
        } => {
            let config = match config {
                Some(path) => ExperimentConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => ExperimentConfig {
                    case_id: case,
                    output_dir,
                    ..Default::default()
                },
            };
            let sink: Box<dyn MetricsSink> = match metrics_log {
                Some(path) => Box::new(
                    JsonLinesSink::open(&path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => Box::new(TracingSink),
            };
            let mask_scores: Option<Vec<f64>> = match mask_scores {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    Some(serde_json::from_str(&content).with_context(|| {
                        format!("Failed to parse mask scores {}", path.display())
                    })?)
                }
                None => None,
            };
            compare(
                &hypothesis,
                &ground_truth,
                &shape.model_shape(),
                config,
                sink,
                mask_scores.as_deref(),
            )
        }
        Command::Expand {
            correspondence,
            shape,
            output,
        } => expand(&correspondence, &shape.model_shape(), &output),
        Command::Inspect { circuit } => inspect(&circuit),
    }
}

fn compare(
    hypothesis_path: &Path,
    ground_truth_path: &Path,
    shape: &ModelShape,
    config: ExperimentConfig,
    sink: Box<dyn MetricsSink>,
    mask_scores: Option<&[f64]>,
) -> Result<()> {
    let hypothesis = Circuit::load(hypothesis_path)
        .with_context(|| format!("Failed to load hypothesis {}", hypothesis_path.display()))?;
    let ground_truth = Circuit::load(ground_truth_path).with_context(|| {
        format!("Failed to load ground truth {}", ground_truth_path.display())
    })?;
    let full = shape.full_circuit();
    info!(
        "Universe: {} components, {} edges",
        full.len(),
        full.edge_count()
    );

    let mut experiment = Experiment::new(config, sink);
    let report = experiment.compare(&hypothesis, &ground_truth, &full, mask_scores)?;

    println!("{}", serde_json::to_string_pretty(&report.evaluation)?);
    println!(
        "\nNodes: TPR {:.3} FPR {:.3}",
        report.evaluation.nodes.tpr(),
        report.evaluation.nodes.fpr()
    );
    println!(
        "Edges: TPR {:.3} FPR {:.3}",
        report.evaluation.edges.tpr(),
        report.evaluation.edges.fpr()
    );
    Ok(())
}

fn expand(correspondence_path: &Path, shape: &ModelShape, output: &Path) -> Result<()> {
    let correspondence = Correspondence::load(correspondence_path).with_context(|| {
        format!("Failed to load correspondence {}", correspondence_path.display())
    })?;
    let circuit = correspondence.ground_truth_circuit(&shape.full_circuit())?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    circuit.save(output)?;
    info!(
        "Ground truth: {} nodes, {} edges saved to {}",
        circuit.len(),
        circuit.edge_count(),
        output.display()
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let circuit = Circuit::load(path)
        .with_context(|| format!("Failed to load circuit {}", path.display()))?;

    println!("=== {} ===", path.display());
    println!("{} nodes, {} edges", circuit.len(), circuit.edge_count());
    println!("\nNodes:");
    for node in circuit.sorted_nodes() {
        println!("  {node}");
    }
    println!("\nEdges:");
    for edge in circuit.sorted_edges() {
        println!("  {edge}");
    }
    Ok(())
}
