mod logging;
mod session;
mod simulation;

use clap::Parser;
use session::SessionConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "trialbench")]
#[command(about = "Runs a simulated go/nogo nose-poke session and exports the trial results.")]
struct Cli {
    /// Session configuration (JSON). Defaults to a tone-pip go/nogo session.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of trials to run
    #[arg(long)]
    trials: Option<usize>,
    /// Seed for trial selection and the simulated animal
    #[arg(long)]
    seed: Option<u64>,
    /// Where to write the trial results
    #[arg(long, default_value = "trial_results.json")]
    output: PathBuf,
    #[arg(long, short)]
    verbose: bool,
    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(trials) = cli.trials {
        config.trials = trials;
    }
    if let Some(seed) = cli.seed {
        config.behavior.seed = seed;
        config.animal.seed = seed;
    }
    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("=== TRIALBENCH GO/NOGO SESSION ===");
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);
    println!(
        "Seed: {}, Trials: {}, Sample rate: {} Hz\n",
        config.behavior.seed, config.trials, config.fs
    );

    let summary = simulation::run(&config)?;
    summary.print();
    simulation::save_results(&cli.output, &summary.results)?;
    info!(path = %cli.output.display(), "results saved");
    println!("Results saved to {}", cli.output.display());
    Ok(())
}
