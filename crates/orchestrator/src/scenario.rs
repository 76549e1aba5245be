//! Post-takeover scenarios, dispatched through a handler table.

use tracing::{error, info, warn};

use model::SessionEvent;
use tor_core::{Result, ScenarioKind, Simulator, TorError, VehicleControl, WeatherParameters};

use crate::config::WeatherScenarioConfig;
use crate::context::Context;
use crate::wait::wait_seconds;

pub type ScenarioHandler<S> = fn(&mut Context<S>, &WeatherScenarioConfig) -> Result<()>;

fn handlers<S: Simulator>() -> [(ScenarioKind, ScenarioHandler<S>); 4] {
    [
        (ScenarioKind::LeadVehicleDeceleration, lead_vehicle_deceleration::<S> as ScenarioHandler<S>),
        (ScenarioKind::ExtremeWeather, extreme_weather::<S> as ScenarioHandler<S>),
        (ScenarioKind::ConstructionSite, construction_site::<S> as ScenarioHandler<S>),
        (ScenarioKind::HumanCrossing, human_crossing::<S> as ScenarioHandler<S>),
    ]
}

/// Runs the scenario registered for `kind`. Placeholder kinds fail with
/// `NotImplemented` and leave the world untouched.
pub fn dispatch<S: Simulator>(kind: ScenarioKind, ctx: &mut Context<S>, cfg: &WeatherScenarioConfig) -> Result<()> {
    let handler = handlers::<S>()
        .into_iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, h)| h)
        .ok_or(TorError::NotImplemented(kind))?;
    info!(scenario = %kind, label = kind.label(), "scenario started");
    handler(ctx, cfg)
}

// TODO: scripted lead vehicle braking in front of the ego
fn lead_vehicle_deceleration<S: Simulator>(_ctx: &mut Context<S>, _cfg: &WeatherScenarioConfig) -> Result<()> {
    Err(TorError::NotImplemented(ScenarioKind::LeadVehicleDeceleration))
}

fn construction_site<S: Simulator>(_ctx: &mut Context<S>, _cfg: &WeatherScenarioConfig) -> Result<()> {
    Err(TorError::NotImplemented(ScenarioKind::ConstructionSite))
}

fn human_crossing<S: Simulator>(_ctx: &mut Context<S>, _cfg: &WeatherScenarioConfig) -> Result<()> {
    Err(TorError::NotImplemented(ScenarioKind::HumanCrossing))
}

/// Weather snapshot taken before a scenario changes it. Restored exactly
/// once: by [`WeatherGuard::restore`] or, failing that, on drop.
pub struct WeatherGuard<'a, S: Simulator> {
    ctx: &'a mut Context<S>,
    snapshot: WeatherParameters,
    restored: bool,
}

impl<'a, S: Simulator> WeatherGuard<'a, S> {
    pub fn capture(ctx: &'a mut Context<S>) -> Result<Self> {
        let snapshot = ctx.sim().weather()?;
        Ok(Self { ctx, snapshot, restored: false })
    }

    pub fn ctx(&mut self) -> &mut Context<S> { &mut *self.ctx }

    pub fn apply(&mut self, weather: WeatherParameters) -> Result<()> {
        self.ctx.sim_mut().set_weather(weather)?;
        self.ctx.emit(SessionEvent::WeatherApplied { weather });
        Ok(())
    }

    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        let weather = self.snapshot;
        self.ctx.sim_mut().set_weather(weather)?;
        self.ctx.emit(SessionEvent::WeatherRestored { weather });
        Ok(())
    }
}

impl<S: Simulator> Drop for WeatherGuard<'_, S> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        let weather = self.snapshot;
        match self.ctx.sim_mut().set_weather(weather) {
            Ok(()) => {
                warn!("scenario aborted, weather restored");
                self.ctx.emit(SessionEvent::WeatherRestored { weather });
            }
            Err(e) => error!(error = %e, "could not restore weather after aborted scenario"),
        }
    }
}

/// Drops visibility for `hold_s` seconds with the ego under manual control,
/// then puts the previous weather back.
pub fn extreme_weather<S: Simulator>(ctx: &mut Context<S>, cfg: &WeatherScenarioConfig) -> Result<()> {
    let ego = ctx.ego()?;
    let mut guard = WeatherGuard::capture(ctx)?;
    guard.apply(cfg.profile)?;
    guard.ctx().set_autopilot(ego, false)?;
    guard.ctx().sim_mut().apply_control(ego, VehicleControl::default())?;
    guard.ctx().advance()?;
    info!(hold_s = cfg.hold_s, fog_density = cfg.profile.fog_density, "extreme weather applied");
    wait_seconds(guard.ctx(), cfg.hold_s)?;
    guard.restore()?;
    info!("weather restored");
    Ok(())
}
