//! Background traffic: autopilot vehicles and navigating pedestrians.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use model::TeardownReport;
use tor_core::{ActorId, Blueprint, Result, Simulator, SpawnCommand, SpawnResponse, TorError, Transform};

use crate::config::PopulationConfig;
use crate::context::Context;

pub const WALKER_CONTROLLER: &str = "controller.ai.walker";

#[derive(Debug, Clone, PartialEq)]
pub struct WalkerHandle {
    pub walker: ActorId,
    pub controller: Option<ActorId>,
    pub max_speed: f32,
}

/// Actors this session spawned and therefore owns. Filled as spawns succeed,
/// so teardown sees everything even when setup stops halfway.
#[derive(Debug, Default)]
pub struct Population {
    pub vehicles: Vec<ActorId>,
    pub walkers: Vec<WalkerHandle>,
}

impl Population {
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty() && self.walkers.is_empty()
    }

    pub fn controllers(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.walkers.iter().filter_map(|w| w.controller)
    }

    /// Stops and destroys everything tracked. Every step runs regardless of
    /// earlier failures; a rejected destroy batch is retried once. The lists
    /// are empty afterwards.
    pub fn despawn<S: Simulator>(&mut self, sim: &mut S, report: &mut TeardownReport) {
        info!(vehicles = self.vehicles.len(), "destroying non-ego vehicles");
        report.vehicles_destroyed += destroy_with_retry(sim, &self.vehicles, "vehicles", report).unwrap_or(0);
        self.vehicles.clear();

        for controller in self.controllers() {
            match sim.stop_walker(controller) {
                Ok(()) => report.controllers_stopped += 1,
                Err(e) => {
                    warn!(controller, error = %e, "could not stop walker controller");
                    report.errors.push(format!("stop controller {controller}: {e}"));
                }
            }
        }

        // controllers first so none outlives its walker
        let mut ids: Vec<ActorId> = self.controllers().collect();
        ids.extend(self.walkers.iter().map(|w| w.walker));
        info!(walkers = self.walkers.len(), "destroying walkers");
        if destroy_with_retry(sim, &ids, "walkers", report).is_some() {
            report.walkers_destroyed += self.walkers.len();
        }
        self.walkers.clear();
    }
}

/// Actors destroyed, or `None` once the batch has failed twice.
fn destroy_with_retry<S: Simulator>(sim: &mut S, ids: &[ActorId], what: &str, report: &mut TeardownReport) -> Option<usize> {
    if ids.is_empty() {
        return Some(0);
    }
    match sim.destroy_batch(ids) {
        Ok(n) => Some(n),
        Err(first) => {
            warn!(what, error = %first, "destroy batch failed, retrying once");
            match sim.destroy_batch(ids) {
                Ok(n) => Some(n),
                Err(e) => {
                    error!(what, count = ids.len(), error = %e, "destroy batch failed twice, giving up");
                    report.errors.push(format!("destroy {what}: {e}"));
                    None
                }
            }
        }
    }
}

/// Blueprints matching `filter`, narrowed to `generation` ("all", "1" or "2").
/// A filter that names a single blueprint ignores the generation; any other
/// generation value selects nothing.
pub fn select_blueprints<S: Simulator>(sim: &S, filter: &str, generation: &str) -> Result<Vec<Blueprint>> {
    let bps = sim.blueprints(filter)?;
    if generation.eq_ignore_ascii_case("all") || bps.len() == 1 {
        return Ok(bps);
    }
    match generation.trim().parse::<u32>() {
        Ok(g @ (1 | 2)) => Ok(bps.into_iter().filter(|b| b.generation == Some(g)).collect()),
        _ => {
            warn!(filter, generation, "actor generation is not valid, no actor will be spawned");
            Ok(Vec::new())
        }
    }
}

/// Spawns the configured vehicles and walkers into `population`.
/// `commit_frames` advances one frame after each batch, as the session does
/// when it owns the clock.
pub fn spawn<S: Simulator>(
    ctx: &mut Context<S>,
    cfg: &PopulationConfig,
    commit_frames: bool,
    population: &mut Population,
) -> Result<()> {
    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    spawn_vehicles(ctx, cfg, &mut rng, commit_frames, population)?;
    if cfg.walker_seed != 0 {
        ctx.sim_mut().set_pedestrians_seed(cfg.walker_seed)?;
        rng = StdRng::seed_from_u64(cfg.walker_seed);
    }
    spawn_walkers(ctx, cfg, &mut rng, population)?;
    info!(vehicles = population.vehicles.len(), walkers = population.walkers.len(), "population spawned");
    Ok(())
}

fn spawn_vehicles<S: Simulator>(
    ctx: &mut Context<S>,
    cfg: &PopulationConfig,
    rng: &mut StdRng,
    commit_frames: bool,
    population: &mut Population,
) -> Result<()> {
    if cfg.vehicles == 0 {
        return Ok(());
    }
    let mut blueprints: Vec<Blueprint> = select_blueprints(ctx.sim(), &cfg.vehicle_filter, &cfg.vehicle_generation)?
        .into_iter()
        .filter(|b| !b.id.contains("dreyevr") && !b.id.contains("bike"))
        .collect();
    blueprints.sort_by(|a, b| a.id.cmp(&b.id));
    if blueprints.is_empty() {
        warn!(filter = %cfg.vehicle_filter, "no vehicle blueprint matches, skipping vehicles");
        return Ok(());
    }

    let mut spawn_points = ctx.sim().spawn_points()?;
    let mut count = cfg.vehicles;
    if count < spawn_points.len() {
        spawn_points.shuffle(rng);
    } else if count > spawn_points.len() {
        warn!(requested = count, available = spawn_points.len(), "not enough spawn points");
        count = spawn_points.len();
    }

    let port = ctx.tm_port;
    let mut batch = Vec::with_capacity(count);
    for transform in spawn_points.into_iter().take(count) {
        let Some(bp) = blueprints.choose(rng) else { break };
        let mut bp = bp.clone();
        for attr in ["color", "driver_id"] {
            let choice = bp.recommended_values(attr).and_then(|v| v.choose(rng)).cloned();
            if let Some(value) = choice {
                bp.set_attribute(attr, value);
            }
        }
        batch.push(SpawnCommand { blueprint: bp, transform, parent: None, autopilot: Some(port) });
    }

    let responses = ctx.sim_mut().spawn_batch(batch, false)?;
    let spawned = collect_spawned(&responses, "vehicles");
    population.vehicles.extend(&spawned);
    if commit_frames {
        ctx.advance()?;
    }

    if cfg.car_lights_on {
        for &vehicle in &population.vehicles {
            if let Err(e) = ctx.sim_mut().tm_update_vehicle_lights(vehicle, true) {
                warn!(vehicle, error = %e, "could not enable automatic lights");
            }
        }
    }
    Ok(())
}

fn spawn_walkers<S: Simulator>(
    ctx: &mut Context<S>,
    cfg: &PopulationConfig,
    rng: &mut StdRng,
    population: &mut Population,
) -> Result<()> {
    if cfg.walkers == 0 {
        return Ok(());
    }
    let blueprints = select_blueprints(ctx.sim(), &cfg.walker_filter, &cfg.walker_generation)?;
    if blueprints.is_empty() {
        warn!(filter = %cfg.walker_filter, "no walker blueprint matches, skipping walkers");
        return Ok(());
    }

    let mut batch = Vec::new();
    let mut speeds = Vec::new();
    for _ in 0..cfg.walkers {
        let Some(location) = ctx.sim_mut().random_navigation_location()? else { continue };
        let Some(bp) = blueprints.choose(rng) else { break };
        let mut bp = bp.clone();
        if bp.has_attribute("is_invincible") {
            bp.set_attribute("is_invincible", "false");
        }
        let running = rng.gen::<f64>() < cfg.running_fraction;
        speeds.push(walker_speed(&bp, running));
        let transform = Transform { location, ..Transform::default() };
        batch.push(SpawnCommand { blueprint: bp, transform, parent: None, autopilot: None });
    }

    let responses = ctx.sim_mut().spawn_batch(batch, false)?;
    ctx.advance()?;
    let first_walker = population.walkers.len();
    for (response, max_speed) in responses.iter().zip(speeds) {
        if let Ok(walker) = response {
            population.walkers.push(WalkerHandle { walker: *walker, controller: None, max_speed });
        }
    }
    collect_spawned(&responses, "walkers");

    let Some(controller_bp) = ctx.sim().find_blueprint(WALKER_CONTROLLER)? else {
        warn!("walker controller blueprint missing, walkers will stand still");
        return Ok(());
    };
    let batch: Vec<SpawnCommand> = population.walkers[first_walker..]
        .iter()
        .map(|w| SpawnCommand {
            blueprint: controller_bp.clone(),
            transform: Transform::default(),
            parent: Some(w.walker),
            autopilot: None,
        })
        .collect();
    let responses = ctx.sim_mut().spawn_batch(batch, false)?;
    for (handle, response) in population.walkers[first_walker..].iter_mut().zip(&responses) {
        handle.controller = response.as_ref().ok().copied();
    }
    collect_spawned(&responses, "walker controllers");

    // let the controllers see their walkers' transforms
    ctx.advance()?;

    ctx.sim_mut().set_pedestrians_cross_factor(cfg.crossing_factor)?;
    for handle in &population.walkers[first_walker..] {
        let Some(controller) = handle.controller else { continue };
        let Some(destination) = ctx.sim_mut().random_navigation_location()? else { continue };
        if let Err(e) = ctx.sim_mut().start_walker(controller, destination, handle.max_speed) {
            warn!(controller, error = %e, "could not start walker controller");
        }
    }
    Ok(())
}

/// Speed for a walker blueprint: the walking or running recommended value,
/// zero when the blueprint has no speed attribute.
fn walker_speed(bp: &Blueprint, running: bool) -> f32 {
    let idx = if running { 2 } else { 1 };
    match bp.recommended_values("speed").and_then(|v| v.get(idx)) {
        Some(v) => v.parse().unwrap_or(0.0),
        None => {
            warn!(blueprint = %bp.id, "walker has no speed");
            0.0
        }
    }
}

/// Logs every failed command and returns the ids that spawned.
fn collect_spawned(responses: &[SpawnResponse], what: &'static str) -> Vec<ActorId> {
    let mut ok = Vec::with_capacity(responses.len());
    for response in responses {
        match response {
            Ok(id) => ok.push(*id),
            Err(msg) => error!(what, error = %msg, "spawn failed"),
        }
    }
    let failed = responses.len() - ok.len();
    if failed > 0 {
        warn!("{}", TorError::SpawnPartialFailure { what, requested: responses.len(), failed });
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use tor_sim_offline::{FaultPlan, OfflineConfig, OfflineSim};

    fn small() -> PopulationConfig {
        PopulationConfig { vehicles: 6, walkers: 4, seed: Some(7), ..Default::default() }
    }

    #[test]
    fn generation_filter_rules() {
        let sim = OfflineSim::new(OfflineConfig::default());
        let all = select_blueprints(&sim, "vehicle.*", "All").unwrap();
        assert!(all.iter().any(|b| b.id.contains("dreyevr")));
        let gen1 = select_blueprints(&sim, "vehicle.*", "1").unwrap();
        assert!(!gen1.is_empty());
        assert!(gen1.iter().all(|b| b.generation == Some(1)));
        assert!(select_blueprints(&sim, "vehicle.*", "3").unwrap().is_empty());
        assert!(select_blueprints(&sim, "vehicle.*", "two").unwrap().is_empty());
        // a single match ignores the generation
        let one = select_blueprints(&sim, "vehicle.tesla.*", "1").unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].generation, Some(2));
    }

    #[test]
    fn spawns_vehicles_and_walkers_with_controllers() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let mut pop = Population::default();
        spawn(&mut ctx, &small(), true, &mut pop).unwrap();

        assert_eq!(pop.vehicles.len(), 6);
        assert_eq!(pop.walkers.len(), 4);
        assert!(pop.walkers.iter().all(|w| w.controller.is_some()));
        assert_eq!(probe.population_counts(), (6, 4));
        assert_eq!(probe.active_controller_count(), 4);
        for &v in &pop.vehicles {
            let actor = probe.actor(v).unwrap();
            assert!(actor.autopilot);
            assert!(!actor.blueprint.contains("dreyevr") && !actor.blueprint.contains("bike"));
        }
        for w in &pop.walkers {
            assert!(w.max_speed == 1.4 || w.max_speed == 2.5);
        }
        // vehicle commit, walker commit, controller settle
        assert_eq!(probe.frame(), 3);
    }

    #[test]
    fn same_seed_spawns_same_population() {
        let layout = || {
            let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
            let mut pop = Population::default();
            spawn(&mut ctx, &small(), true, &mut pop).unwrap();
            pop.vehicles.iter()
                .map(|&v| {
                    let a = probe.actor(v).unwrap();
                    (a.blueprint, a.transform.location.x as i64, a.transform.location.y as i64)
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(layout(), layout());
    }

    #[test]
    fn partial_spawn_failure_keeps_successes() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        probe.set_faults(FaultPlan { fail_every_nth_spawn: Some(3), ..Default::default() });
        let mut pop = Population::default();
        spawn(&mut ctx, &small(), true, &mut pop).unwrap();
        // commands 3 and 6 of the vehicle batch fail
        assert_eq!(pop.vehicles.len(), 4);
        assert_eq!(probe.population_counts().0, 4);
        // walker 3 fails; of the remaining three, controller 3 fails
        assert_eq!(pop.walkers.len(), 3);
        assert_eq!(pop.controllers().count(), 2);
    }

    #[test]
    fn request_beyond_spawn_points_is_capped() {
        let (mut ctx, _probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let cfg = PopulationConfig { vehicles: 500, walkers: 0, seed: Some(1), ..Default::default() };
        let mut pop = Population::default();
        spawn(&mut ctx, &cfg, false, &mut pop).unwrap();
        let points = ctx.sim().spawn_points().unwrap().len();
        assert!(pop.vehicles.len() <= points);
        assert!(pop.vehicles.len() >= points - 2);
    }

    #[test]
    fn despawn_empties_world_and_retries_once() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let mut pop = Population::default();
        spawn(&mut ctx, &small(), true, &mut pop).unwrap();
        probe.set_faults(FaultPlan { fail_destroy_batches: 1, ..Default::default() });
        let mut report = TeardownReport::default();
        pop.despawn(ctx.sim_mut(), &mut report);

        assert!(pop.is_empty());
        assert_eq!(probe.population_counts(), (0, 0));
        assert_eq!(probe.controller_count(), 0);
        assert_eq!(report.vehicles_destroyed, 6);
        assert_eq!(report.walkers_destroyed, 4);
        assert_eq!(report.controllers_stopped, 4);
        assert!(report.errors.is_empty());
        // vehicles twice, walkers once
        assert_eq!(probe.destroy_calls(), 3);
        assert!(probe.ego().and_then(|e| probe.actor(e)).is_some());
    }

    #[test]
    fn despawn_keeps_going_after_repeated_failure() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let mut pop = Population::default();
        spawn(&mut ctx, &small(), true, &mut pop).unwrap();
        probe.set_faults(FaultPlan { fail_destroy_batches: 2, ..Default::default() });
        let mut report = TeardownReport::default();
        pop.despawn(ctx.sim_mut(), &mut report);

        assert!(pop.is_empty());
        assert_eq!(report.errors.len(), 1);
        // vehicles were lost to the double failure, walkers still went
        assert_eq!(probe.population_counts(), (6, 0));
        assert_eq!(report.vehicles_destroyed, 0);
        assert_eq!(report.walkers_destroyed, 4);
        assert_eq!(report.controllers_stopped, 4);
    }

    #[test]
    fn walkers_left_behind_are_not_counted_as_destroyed() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let mut pop = Population::default();
        spawn(&mut ctx, &small(), true, &mut pop).unwrap();
        probe.set_faults(FaultPlan { fail_destroy_batches: 4, ..Default::default() });
        let mut report = TeardownReport::default();
        pop.despawn(ctx.sim_mut(), &mut report);

        assert!(pop.is_empty());
        assert_eq!(probe.population_counts(), (6, 4));
        assert_eq!(report.vehicles_destroyed, 0);
        assert_eq!(report.walkers_destroyed, 0);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(probe.destroy_calls(), 4);
    }

    #[test]
    fn invalid_generation_spawns_nothing() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let cfg = PopulationConfig { vehicle_generation: "9".into(), walker_generation: "x".into(), ..small() };
        let mut pop = Population::default();
        spawn(&mut ctx, &cfg, true, &mut pop).unwrap();
        assert!(pop.is_empty());
        assert_eq!(probe.population_counts(), (0, 0));
    }
}
