use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mlmc_alloc::config::MlmcConfig;
use mlmc_alloc::sde::{SdeModel, SdeParams};
use mlmc_alloc::{MlmcController, Result};

/// Multilevel Monte Carlo on the Euler–Maruyama SDE model.
#[derive(Debug, Parser)]
#[command(name = "mlmc-alloc", version, about)]
struct Args {
    /// JSON run configuration; fields not given keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of levels in the hierarchy
    #[arg(short = 'L', long, default_value = "4")]
    levels: usize,

    /// Pilot samples per level (one value is used for every level)
    #[arg(long, value_delimiter = ',')]
    pilot: Option<Vec<usize>>,

    /// Convergence tolerance
    #[arg(long)]
    tol: Option<f64>,

    /// Budget for cost-constrained runs
    #[arg(long)]
    budget: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Drift exponent p in dX = -X^p dt + sqrt(2) sig dW
    #[arg(long, default_value = "1.0")]
    p: f64,

    /// Write the results as pretty JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<MlmcConfig> {
    let mut config = match &args.config {
        Some(path) => MlmcConfig::from_json_file(path)?,
        None => MlmcConfig::default(),
    };
    if let Some(pilot) = &args.pilot {
        config.pilot_samples = pilot.clone();
    }
    if let Some(tol) = args.tol {
        config.convergence_tol = tol;
    }
    if let Some(budget) = args.budget {
        config.budget = Some(budget);
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let params = SdeParams { p: args.p, ..SdeParams::default() };
    let mut controller = MlmcController::new(config, SdeModel::new(params, args.levels))?;
    let results = controller.run()?;

    for (q, summary) in results.qoi.iter().enumerate() {
        println!("QoI {q} moments: {:?}", summary.moments);
        println!(
            "QoI {q} standard errors: mean {:.4e}, spread {:.4e}",
            summary.std_error_mean, summary.std_error_spread
        );
        if let Some(ratio) = summary.variance_ratio_vs_mc {
            println!("QoI {q} variance ratio vs MC: {ratio:.4}");
        }
        if let Some(rates) = summary.rates {
            println!(
                "QoI {q} rates: alpha {:.3}, beta {:.3}, gamma {:.3}",
                rates.alpha, rates.beta, rates.gamma
            );
        }
    }
    println!("Samples per level: {:?}", results.allocated_counts);
    println!("MLMC cost: {:.1} ({:.1} finest-level evaluations)", results.equivalent_cost, results.equivalent_hf_evals);
    if let Some(projection) = &results.projection {
        println!(
            "Projected samples: {:?}, cost {:.1}, estimator variance {:?}",
            projection.samples, projection.cost, projection.estimator_variance
        );
    }
    for warning in &results.allocation_warnings {
        println!("warning: {warning}");
    }

    if let Some(path) = &args.output {
        results.write_json(path)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
