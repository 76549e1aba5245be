use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use model::{Phase, PhaseRecord, ScenarioOutcome, SessionEvent, SessionReport, TeardownReport};
use tor_core::{ActorId, Clock, Interrupt, Result, Signal, SignalChannel, Simulator, TorError, WorldSettings};

use crate::config::{LightGate, SessionConfig};
use crate::context::{Context, EventTx};
use crate::maneuver;
use crate::population::{self, Population};
use crate::scenario;
use crate::stepper::{Stepper, TickMode};
use crate::wait::{wait_for_value, wait_seconds};

/// What a finished session hands back: the report (always) and how the
/// session body ended.
pub struct SessionOutcome {
    pub report: SessionReport,
    pub result: Result<()>,
}

impl SessionOutcome {
    pub fn exit_code(&self) -> u8 {
        match &self.result {
            Ok(()) => 0,
            Err(e) => e.code(),
        }
    }
}

/// One TOR session against one world: setup, watch for the operator's
/// takeover signal, run the scenario, hand control back, tear down.
///
/// Teardown runs exactly once, from [`Session::run`] or from `Drop` when the
/// session is abandoned or unwinds.
pub struct Session<S: Simulator> {
    ctx: Context<S>,
    cfg: SessionConfig,
    population: Population,
    sync_master: bool,
    restore_settings: Option<WorldSettings>,
    report: SessionReport,
    torn_down: bool,
}

impl<S: Simulator> Session<S> {
    pub fn new(
        sim: S,
        clock: Box<dyn Clock + Send>,
        signal: Box<dyn SignalChannel + Send>,
        cfg: SessionConfig,
        interrupt: Interrupt,
    ) -> Self {
        let mode = if cfg.asynchronous { TickMode::Asynchronous } else { TickMode::Synchronous };
        let ctx = Context::new(Stepper::new(sim, mode, interrupt), clock, signal, cfg.tm_port);
        let started_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let report = SessionReport::new(cfg.scenario, started_at);
        Self {
            ctx,
            cfg,
            population: Population::default(),
            sync_master: false,
            restore_settings: None,
            report,
            torn_down: false,
        }
    }

    pub fn with_events(mut self, tx: EventTx) -> Self {
        self.ctx.attach_events(tx);
        self
    }

    pub fn population(&self) -> &Population { &self.population }

    pub fn run(mut self) -> SessionOutcome {
        info!(id = %self.report.id, scenario = %self.cfg.scenario, "session started");
        let result = self.run_phases();
        match &result {
            Ok(()) => info!("session finished"),
            Err(TorError::Interrupted) => warn!("session interrupted by operator"),
            Err(e) => error!(code = e.code(), error = %e, "session aborted"),
        }
        if let Err(e) = &result {
            self.report.error = Some(e.to_string());
        }
        self.teardown();
        let placeholder = SessionReport::new(self.cfg.scenario, String::new());
        SessionOutcome { report: std::mem::replace(&mut self.report, placeholder), result }
    }

    fn run_phases(&mut self) -> Result<()> {
        self.enter(Phase::Setup);
        self.setup()?;

        self.enter(Phase::WatchingForTrigger);
        self.watch_for_trigger()?;

        self.enter(Phase::RunningScenario);
        self.run_scenario()?;

        self.enter(Phase::Restoring);
        self.restore_autonomy()
    }

    fn enter(&mut self, phase: Phase) {
        let frame = self.ctx.stepper.last_frame();
        let sim_time_s = self.ctx.sim().elapsed_seconds();
        info!(?phase, frame, "phase");
        self.report.phases.push(PhaseRecord { phase, frame, sim_time_s });
        self.ctx.emit(SessionEvent::PhaseChanged { phase });
    }

    fn setup(&mut self) -> Result<()> {
        let traffic = self.cfg.traffic.clone();
        {
            let sim = self.ctx.sim_mut();
            sim.tm_set_global_distance_to_leading_vehicle(traffic.leading_distance_m)?;
            if traffic.respawn_dormant {
                sim.tm_set_respawn_dormant_vehicles(true)?;
            }
            if let Some(seed) = self.cfg.population.seed {
                sim.tm_set_random_seed(seed)?;
            }
        }

        let original = self.ctx.sim().settings()?;
        let mut settings = original;
        if self.cfg.asynchronous {
            info!("running asynchronously, frames are driven by someone else");
        } else {
            self.ctx.sim_mut().tm_set_synchronous_mode(true)?;
            if !original.synchronous_mode {
                self.sync_master = true;
                settings.synchronous_mode = true;
                settings.fixed_delta_seconds = Some(self.cfg.fixed_delta_seconds);
            }
        }
        if self.cfg.no_rendering {
            settings.no_rendering_mode = true;
        }
        if settings != original {
            self.restore_settings = Some(original);
            self.ctx.sim_mut().apply_settings(settings)?;
        }
        let mode = if self.sync_master { TickMode::Synchronous } else { TickMode::Asynchronous };
        self.ctx.stepper.set_mode(mode);
        info!(sync_master = self.sync_master, ?mode, "world settings applied");

        population::spawn(&mut self.ctx, &self.cfg.population, self.sync_master, &mut self.population)?;
        self.ctx.emit(SessionEvent::PopulationSpawned {
            vehicles: self.population.vehicles.len(),
            walkers: self.population.walkers.len(),
        });
        self.ctx.sim_mut().tm_set_global_speed_difference(traffic.speed_difference_pct)?;

        let ego = self.ctx.sim().find_ego_vehicle()?.ok_or(TorError::EgoVehicleMissing)?;
        self.ctx.ego = Some(ego);
        self.ctx.set_autopilot(ego, true)?;
        info!(ego, "autopilot enabled on ego vehicle");

        match self.ctx.signal.write(Signal::Idle) {
            Ok(()) => self.ctx.emit(SessionEvent::SignalWritten { value: Signal::Idle.value() }),
            Err(e) => warn!(error = %e, "could not signal the start of the reading task"),
        }
        info!("reading task started");
        Ok(())
    }

    fn watch_for_trigger(&mut self) -> Result<()> {
        let ego = self.ctx.ego()?;
        let trigger = self.cfg.trigger;
        let gate = self.cfg.light_gate;
        let mut unavailable = false;
        loop {
            let frame = self.ctx.advance()?;
            if let Some(gate) = gate {
                if let Err(e) = self.apply_light_gate(ego, gate) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(error = %e, "traffic light gate skipped this frame");
                }
            }
            match self.ctx.signal.read() {
                Ok(v) if v == trigger => {
                    info!(frame, value = v.value(), "takeover trigger observed");
                    self.report.trigger_frame = Some(frame);
                    self.ctx.emit(SessionEvent::TakeoverObserved { value: v.value() });
                    return Ok(());
                }
                Ok(_) => unavailable = false,
                Err(e) => {
                    if !unavailable {
                        warn!(error = %e, "signal channel unavailable, retrying every frame");
                    }
                    unavailable = true;
                }
            }
        }
    }

    fn apply_light_gate(&mut self, ego: ActorId, gate: LightGate) -> Result<()> {
        let Some(light) = self.ctx.sim().traffic_light_at(ego)? else { return Ok(()) };
        let state = self.ctx.sim().traffic_light_state(light)?;
        if state == gate.from {
            self.ctx.sim_mut().set_traffic_light_state(light, gate.to)?;
            info!(light, from = ?gate.from, to = ?gate.to, "traffic light switched for the ego");
            self.ctx.emit(SessionEvent::TrafficLightChanged { light, from: gate.from, to: gate.to });
        }
        Ok(())
    }

    fn run_scenario(&mut self) -> Result<()> {
        let ticks = wait_for_value(&mut self.ctx, Signal::TakeoverRequested)?;
        info!(ticks, "takeover request issued");
        let ego = self.ctx.ego()?;

        if let Some(direction) = self.cfg.maneuver.direction {
            match maneuver::execute(&mut self.ctx, ego, direction, &self.cfg.maneuver) {
                Ok(record) => self.report.maneuver = Some(record),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(code = e.code(), error = %e, "lane change skipped"),
            }
        }

        let kind = self.cfg.scenario;
        let outcome = match scenario::dispatch(kind, &mut self.ctx, &self.cfg.weather) {
            Ok(()) => ScenarioOutcome::Completed,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(scenario = %kind, code = e.code(), error = %e, "scenario skipped");
                ScenarioOutcome::Skipped(e.to_string())
            }
        };
        self.ctx.emit(SessionEvent::ScenarioFinished { scenario: kind, outcome: outcome.clone() });
        self.report.outcome = outcome;
        Ok(())
    }

    fn restore_autonomy(&mut self) -> Result<()> {
        let ego = self.ctx.ego()?;
        self.ctx.set_autopilot(ego, true)?;
        info!(grace_s = self.cfg.grace_period_s, "autopilot enabled again");
        wait_seconds(&mut self.ctx, self.cfg.grace_period_s)?;
        Ok(())
    }

    /// Puts the world back. Every step runs even when an earlier one failed;
    /// failures end up in the report.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.enter(Phase::TornDown);
        let mut td = TeardownReport::default();

        if let Some(settings) = self.restore_settings.take() {
            match self.ctx.sim_mut().apply_settings(settings) {
                Ok(()) => td.settings_restored = true,
                Err(e) => {
                    warn!(error = %e, "could not restore world settings");
                    td.errors.push(format!("restore settings: {e}"));
                }
            }
        }

        self.population.despawn(self.ctx.sim_mut(), &mut td);

        if let Some(ego) = self.ctx.ego {
            match self.ctx.set_autopilot(ego, false) {
                Ok(()) => {
                    td.ego_autopilot_disabled = true;
                    info!(ego, "manual control handed back on ego vehicle");
                }
                Err(e) => {
                    warn!(ego, error = %e, "could not disable ego autopilot");
                    td.errors.push(format!("disable ego autopilot: {e}"));
                }
            }
        }

        if self.cfg.teardown_pause_s > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(self.cfg.teardown_pause_s));
        }

        self.ctx.emit(SessionEvent::TeardownFinished {
            vehicles: td.vehicles_destroyed,
            walkers: td.walkers_destroyed,
            errors: td.errors.len(),
        });
        info!(vehicles = td.vehicles_destroyed, walkers = td.walkers_destroyed, errors = td.errors.len(), "teardown done");
        self.report.frames = self.ctx.stepper.frames();
        self.report.teardown = td;
    }
}

impl<S: Simulator> Drop for Session<S> {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!("session dropped before teardown, tearing down now");
            self.teardown();
        }
    }
}
