//! Timed lane change with scoped revocation of the vehicle's autopilot.

use std::time::Duration;
use tracing::{error, info, warn};

use model::{ManeuverRecord, SessionEvent};
use tor_core::{ActorId, LaneChange, Result, Simulator, TorError};

use crate::config::ManeuverConfig;
use crate::context::Context;
use crate::wait::wait;

/// Holds control of one vehicle while its autopilot is revoked.
///
/// Autopilot is given back exactly once: through [`AutopilotGuard::release`]
/// on the success path, or by `Drop` on every other path (early `?`,
/// interrupt, panic unwinding).
pub struct AutopilotGuard<'a, S: Simulator> {
    ctx: &'a mut Context<S>,
    vehicle: ActorId,
    armed: bool,
}

impl<'a, S: Simulator> AutopilotGuard<'a, S> {
    /// Revokes autopilot on `vehicle`. The guard is armed before the call, so
    /// a failed revoke still ends with the autopilot restored.
    pub fn revoke(ctx: &'a mut Context<S>, vehicle: ActorId) -> Result<Self> {
        let guard = Self { ctx, vehicle, armed: true };
        guard.ctx.set_autopilot(vehicle, false)?;
        Ok(guard)
    }

    pub fn ctx(&mut self) -> &mut Context<S> { &mut *self.ctx }

    pub fn vehicle(&self) -> ActorId { self.vehicle }

    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.ctx.set_autopilot(self.vehicle, true)
    }
}

impl<S: Simulator> Drop for AutopilotGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        match self.ctx.set_autopilot(self.vehicle, true) {
            Ok(()) => warn!(vehicle = self.vehicle, "maneuver aborted, autopilot restored"),
            Err(e) => error!(vehicle = self.vehicle, error = %e, "could not restore autopilot after aborted maneuver"),
        }
    }
}

/// Time to cross one lane at `speed_mps` with the heading turned by
/// `heading_delta_deg`: `|lane_width / (speed * sin(delta))|`, clamped to
/// `cfg.max_duration_s`.
pub fn lane_change_duration(lane_width_m: f64, speed_mps: f64, heading_delta_deg: f64, cfg: &ManeuverConfig) -> Result<Duration> {
    if !(lane_width_m.is_finite() && lane_width_m > 0.0) {
        return Err(TorError::InvalidManeuverState(format!("lane width {lane_width_m} m")));
    }
    if !(speed_mps.is_finite() && speed_mps >= cfg.min_speed_mps) {
        return Err(TorError::InvalidManeuverState(format!(
            "speed {speed_mps:.3} m/s is below the {:.2} m/s needed to change lanes",
            cfg.min_speed_mps
        )));
    }
    let lateral = heading_delta_deg.to_radians().sin();
    if !lateral.is_finite() || lateral.abs() < 1e-6 {
        return Err(TorError::InvalidManeuverState(format!("heading delta {heading_delta_deg} deg has no lateral component")));
    }
    let secs = (lane_width_m / (speed_mps * lateral)).abs();
    let secs = if secs > cfg.max_duration_s {
        warn!(estimated_s = secs, max_s = cfg.max_duration_s, "lane change duration clamped");
        cfg.max_duration_s
    } else {
        secs
    };
    Ok(Duration::from_secs_f64(secs))
}

/// Rotates `vehicle` off its lane, holds the heading until one lane width is
/// covered, then hands it back to the autopilot.
pub fn execute<S: Simulator>(
    ctx: &mut Context<S>,
    vehicle: ActorId,
    direction: LaneChange,
    cfg: &ManeuverConfig,
) -> Result<ManeuverRecord> {
    let transform = ctx.sim().transform(vehicle)?;
    let speed_mps = ctx.sim().velocity(vehicle)?.length();
    let heading_delta_deg = direction.heading_delta_deg(cfg.heading_delta_deg);

    let mut guard = AutopilotGuard::revoke(ctx, vehicle)?;
    guard.ctx().sim_mut().set_transform(vehicle, transform.with_yaw_offset(heading_delta_deg))?;
    guard.ctx().advance()?;

    let lane_width_m = guard.ctx().sim().lane_width_at(transform.location)?;
    let duration = lane_change_duration(lane_width_m, speed_mps, heading_delta_deg, cfg)?;
    info!(?direction, speed_mps, lane_width_m, secs = duration.as_secs_f64(), "lane change started");
    guard.ctx().emit(SessionEvent::ManeuverStarted {
        direction,
        heading_delta_deg,
        duration_s: duration.as_secs_f64(),
    });

    let ticks = wait(guard.ctx(), duration)?;
    guard.release()?;
    ctx.advance()?;

    ctx.emit(SessionEvent::ManeuverFinished { ticks });
    info!(ticks, "lane change done");
    Ok(ManeuverRecord {
        direction,
        heading_delta_deg,
        speed_mps,
        lane_width_m,
        duration_s: duration.as_secs_f64(),
        ticks,
    })
}
