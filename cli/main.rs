#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use matchrate::config::AnalysisConfig;
use matchrate::model::selection::{CriterionKind, Direction};
use matchrate::pipeline::{render_report, run_analysis, run_prediction, write_outputs};

#[derive(Clone, Copy, ValueEnum)]
pub enum CriterionCli {
    Bic,
    Aic,
}

impl From<CriterionCli> for CriterionKind {
    fn from(value: CriterionCli) -> Self {
        match value {
            CriterionCli::Bic => CriterionKind::Bic,
            CriterionCli::Aic => CriterionKind::Aic,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DirectionCli {
    Both,
    Backward,
    Forward,
}

impl From<DirectionCli> for Direction {
    fn from(value: DirectionCli) -> Self {
        match value {
            DirectionCli::Both => Direction::Both,
            DirectionCli::Backward => Direction::Backward,
            DirectionCli::Forward => Direction::Forward,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the per-grade CSV extract
    pub input: PathBuf,

    /// TOML file with analysis settings; flags below take precedence
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Seed for the train/holdout split
    #[arg(long)]
    pub seed: Option<u64>,

    /// Share of rows used for training
    #[arg(long, value_name = "F")]
    pub train_fraction: Option<f64>,

    /// Directory receiving the model, report, grid and plots
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Penalty used by stepwise selection
    #[arg(long, value_enum)]
    pub criterion: Option<CriterionCli>,

    /// Stepwise search direction
    #[arg(long, value_enum)]
    pub direction: Option<DirectionCli>,

    /// Step of the enroll_share prediction grid; must divide 1
    #[arg(long, value_name = "S")]
    pub grid_step: Option<f64>,

    /// Fail when MatchValue + MismatchValue disagrees with TotalTeacher
    #[arg(long)]
    pub strict_rates: bool,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to the per-grade CSV extract to score
    pub input: PathBuf,

    /// Trained model file (.toml)
    #[arg(long)]
    pub model: PathBuf,

    /// Where to write the predictions
    #[arg(long, default_value = "predictions.csv")]
    pub output: PathBuf,

    /// Tolerance used when auditing rate consistency during aggregation
    #[arg(long, default_value = "0.05")]
    pub rate_tolerance: f64,
}

#[derive(Parser)]
#[command(name = "matchrate", version, about = "Weighted logistic analysis of student/teacher race match")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate, fit, evaluate and plot
    Run(RunArgs),
    /// Score a raw extract with a saved model
    Predict(PredictArgs),
}

fn build_config(args: &RunArgs) -> Result<AnalysisConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(fraction) = args.train_fraction {
        config.train_fraction = fraction;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(criterion) = args.criterion {
        config.criterion = criterion.into();
    }
    if let Some(direction) = args.direction {
        config.direction = direction.into();
    }
    if let Some(step) = args.grid_step {
        config.grid_step = step;
    }
    if args.strict_rates {
        config.strict_rates = true;
    }
    Ok(config)
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let report = run_analysis(&args.input, &config)?;
    println!("{}", render_report(&report));
    let files = write_outputs(&report, &config.output_dir)?;
    println!("Model saved to: {}", files.model.display());
    println!("Report saved to: {}", files.report.display());
    println!("Prediction grid saved to: {}", files.grid.display());
    println!(
        "Plots saved to: {} and {}",
        files.prediction_plot.display(),
        files.log_odds_plot.display()
    );
    Ok(())
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let rows = run_prediction(&args.input, &args.model, &args.output, args.rate_tolerance)?;
    println!("Wrote {rows} predictions to {}", args.output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Predict(args) => predict(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
