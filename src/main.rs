use std::process;

use quire::{
    config::{self, Command, Settings, SimulateArgs},
    infra::{error::InfraError, telemetry},
    simulate,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "quire failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "quire failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or_else(|| Command::Simulate(SimulateArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Simulate(args) => run_simulate(settings, args).await,
        Command::CheckConfig => run_check_config(&settings),
    }
}

async fn run_simulate(settings: Settings, args: SimulateArgs) -> Result<(), InfraError> {
    let report = simulate::run(settings.cache, &args).await?;

    println!(
        "reads={} writes={} hits={} hit_rate={:.3} stale={} elapsed_ms={}",
        report.reads,
        report.writes,
        report.hits,
        report.hit_rate().unwrap_or_default(),
        report.stale,
        report.elapsed.as_millis()
    );

    if report.stale > 0 {
        return Err(InfraError::simulation(format!(
            "{} stale renders served",
            report.stale
        )));
    }
    Ok(())
}

fn run_check_config(settings: &Settings) -> Result<(), InfraError> {
    let rendered = settings
        .to_toml()
        .map_err(|err| InfraError::configuration(err.to_string()))?;
    info!("Configuration is valid");
    print!("{rendered}");
    Ok(())
}
