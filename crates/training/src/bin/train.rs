use std::path::PathBuf;

use clap::Parser;
use training::{config::ConfigOverride, DistributedContext, ProbeConfig, Trainer, TrainingError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Linear-probe training on frozen features", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to the probe config file (toml or json)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Resume from a checkpoint directory, or the latest one under it"
    )]
    resume: Option<PathBuf>,

    #[arg(long, help = "Only evaluate the (resumed) classifier")]
    eval: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = ProbeConfig::load(&args.config)?.with_overrides(&args.overrides)?;
    if args.resume.is_some() {
        config.runtime.resume = args.resume;
    }
    if args.eval {
        config.runtime.eval = true;
    }
    config.validate()?;

    let ctx = DistributedContext::init_from_env()?;
    let device = config.resolve_device(ctx.local_rank())?;
    let ctx = ctx.with_device(device);
    log::info!(
        "rank {} of {} on {:?}",
        ctx.rank(),
        ctx.world_size(),
        ctx.device()
    );

    let mut trainer = Trainer::new(config, ctx)?;
    let summary = trainer.run()?;
    log::info!(
        "finished {} epoch(s), max accuracy {:.2}%",
        summary.epochs_run,
        summary.max_accuracy
    );
    Ok(())
}
