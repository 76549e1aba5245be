mod cli;
mod recorder;

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use iox::SignalFile;
use tor_core::{Clock, Interrupt, SystemClock};
use tor_orchestrator::{event_channel, Session};
use tor_sim_offline::{OfflineConfig, OfflineSim};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tor_runner=info,tor_orchestrator=info,tor_sim_offline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = match cli.session_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return ExitCode::from(2);
        }
    };

    let offline = OfflineConfig { realtime: cli.realtime, seed: cfg.population.seed.unwrap_or(0), ..Default::default() };
    let timeout = Duration::try_from_secs_f64(cli.timeout).unwrap_or(Duration::from_secs(10));
    let sim = match OfflineSim::connect(&cli.host, cli.port, timeout, offline) {
        Ok(sim) => sim,
        Err(e) => {
            error!(error = %e, "could not reach the simulator");
            return ExitCode::from(e.code());
        }
    };

    let signal_path = cli.signal_path();
    info!(path = %signal_path.display(), "signal file");
    let signal = SignalFile::new(signal_path);
    let clock: Box<dyn Clock + Send> = if cli.realtime { Box::new(SystemClock::new()) } else { Box::new(sim.clock()) };

    let (tx, rx) = event_channel();
    // without an event log the receiver is dropped here and events are discarded
    let recorder = cli.event_log.clone().and_then(|path| match recorder::spawn(path, rx) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "event recording disabled");
            None
        }
    });

    let interrupt = Interrupt::new();
    let flag = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, stopping after the current frame");
            flag.raise();
        }
    });

    let scenario = cfg.scenario;
    info!(%scenario, label = scenario.label(), endpoint = sim.endpoint(), "starting session");
    let joined = tokio::task::spawn_blocking(move || {
        Session::new(sim, clock, Box::new(signal), cfg, interrupt).with_events(tx).run()
    })
    .await;
    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "session thread panicked");
            return ExitCode::from(101);
        }
    };

    if let Some(handle) = recorder {
        match handle.join() {
            Ok(Ok(n)) => info!(records = n, "event log written"),
            Ok(Err(e)) => warn!("event log incomplete: {e:#}"),
            Err(_) => warn!("event recorder panicked"),
        }
    }

    if let Some(path) = &cli.report {
        match iox::write_report(&outcome.report, path) {
            Ok(()) => info!(path = %path.display(), "report written"),
            Err(e) => warn!("could not write report: {e:#}"),
        }
    }

    let r = &outcome.report;
    info!(
        id = %r.id,
        trigger_frame = ?r.trigger_frame,
        frames = r.frames,
        outcome = ?r.outcome,
        vehicles_destroyed = r.teardown.vehicles_destroyed,
        walkers_destroyed = r.teardown.walkers_destroyed,
        "done"
    );
    ExitCode::from(outcome.exit_code())
}
