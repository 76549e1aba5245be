//! Headless, deterministic stand-in for the simulation engine.
//!
//! A straight three-lane road with an ego vehicle, cycling traffic lights,
//! traffic-manager driven vehicles and navigating walkers. Good enough to run
//! a whole TOR session without the engine, and to inject faults in tests.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use tor_core::*;

pub mod library;
mod state;

pub use state::{Actor, ActorKind};
use state::WorldState;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub seed: u64,
    /// Sleep after every frame so simulation time tracks wall time.
    pub realtime: bool,
    pub spawn_ego: bool,
    pub ego_initial_speed_mps: f64,
    pub speed_limit_mps: f64,
    pub max_speed_mps: f64,
    pub accel_mps2: f64,
    pub decel_mps2: f64,
    pub lane_width_m: f64,
    /// Frame period when the world is not in fixed-step mode.
    pub variable_step_s: f64,
    pub light_stop_range_m: f64,
    pub green_s: f64,
    pub yellow_s: f64,
    pub red_s: f64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            realtime: false,
            spawn_ego: true,
            ego_initial_speed_mps: 0.0,
            speed_limit_mps: 8.33,
            max_speed_mps: 40.0,
            accel_mps2: 3.0,
            decel_mps2: 6.0,
            lane_width_m: library::LANE_WIDTH_M,
            variable_step_s: 0.05,
            light_stop_range_m: 20.0,
            green_s: 10.0,
            yellow_s: 3.0,
            red_s: 10.0,
        }
    }
}

/// Failures to inject, for exercising error paths.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Every tick from this frame on fails with `ConnectionFailure`.
    pub disconnect_at_frame: Option<u64>,
    pub fail_set_weather: bool,
    pub fail_set_transform: bool,
    /// The n-th, 2n-th, ... command of every spawn batch fails.
    pub fail_every_nth_spawn: Option<usize>,
    /// Number of leading `destroy_batch` calls that fail.
    pub fail_destroy_batches: usize,
    pub fail_lane_width: bool,
}

/// Shared handle to the offline world. Clones observe the same state, so a
/// test can keep one while the session owns another.
#[derive(Clone)]
pub struct OfflineSim {
    inner: Arc<Mutex<WorldState>>,
    endpoint: String,
}

impl OfflineSim {
    pub fn new(cfg: OfflineConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(WorldState::new(cfg))), endpoint: "offline".into() }
    }

    /// Mirrors the engine client's connect step; the offline world accepts
    /// any endpoint but a zero port, and records it for logging.
    pub fn connect(host: &str, port: u16, timeout: Duration, cfg: OfflineConfig) -> Result<Self> {
        if port == 0 {
            return Err(TorError::ConnectionFailure(format!("{host}:{port} is not a valid endpoint")));
        }
        let mut sim = Self::new(cfg);
        sim.endpoint = format!("{host}:{port}");
        info!(endpoint = %sim.endpoint, timeout_s = timeout.as_secs_f64(), "connected to offline world");
        Ok(sim)
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    pub fn clock(&self) -> SimClock { SimClock { inner: self.inner.clone() } }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.inner.lock().faults = faults;
    }

    /// Runs `hook` after every frame with the new frame number. Hooks run
    /// outside the world lock, so they may read or drive this handle.
    pub fn on_tick<F: FnMut(u64) + Send + 'static>(&self, hook: F) {
        self.inner.lock().hooks.push(Box::new(hook));
    }

    pub fn frame(&self) -> u64 { self.inner.lock().frame }

    pub fn ego(&self) -> Option<ActorId> { self.inner.lock().ego }

    pub fn actor(&self, id: ActorId) -> Option<Actor> { self.inner.lock().actors.get(&id).cloned() }

    /// Vehicles other than the ego, and walkers.
    pub fn population_counts(&self) -> (usize, usize) {
        let st = self.inner.lock();
        let ego = st.ego;
        let vehicles = st.actors.values().filter(|a| a.is_vehicle() && Some(a.id) != ego).count();
        let walkers = st.actors.values().filter(|a| matches!(a.kind, ActorKind::Walker)).count();
        (vehicles, walkers)
    }

    pub fn controller_count(&self) -> usize {
        self.inner.lock().actors.values().filter(|a| matches!(a.kind, ActorKind::WalkerController { .. })).count()
    }

    pub fn active_controller_count(&self) -> usize {
        self.inner.lock().actors.values()
            .filter(|a| matches!(a.kind, ActorKind::WalkerController { active: true, .. }))
            .count()
    }

    pub fn autopilot_log(&self) -> Vec<(ActorId, bool)> { self.inner.lock().autopilot_log.clone() }

    pub fn weather_log(&self) -> Vec<WeatherParameters> { self.inner.lock().weather_log.clone() }

    pub fn settings_log(&self) -> Vec<WorldSettings> { self.inner.lock().settings_log.clone() }

    /// `destroy_batch` calls seen so far, rejected ones included.
    pub fn destroy_calls(&self) -> usize { self.inner.lock().destroy_calls }

    pub fn tm_speed_difference(&self) -> f64 { self.inner.lock().tm_speed_difference_pct }

    pub fn traffic_lights(&self) -> Vec<(ActorId, TrafficLightState)> {
        self.inner.lock().actors.values()
            .filter_map(|a| match a.kind {
                ActorKind::TrafficLight { state, .. } => Some((a.id, state)),
                _ => None,
            })
            .collect()
    }

    /// Sets the velocity of a vehicle directly, bypassing the controllers.
    pub fn set_speed(&self, actor: ActorId, speed_mps: f64) -> Result<()> {
        self.inner.lock().actor_mut(actor)?.speed = speed_mps;
        Ok(())
    }

    pub fn set_synchronous(&self, enabled: bool, fixed_delta: Option<f64>) {
        let mut st = self.inner.lock();
        st.settings.synchronous_mode = enabled;
        st.settings.fixed_delta_seconds = fixed_delta;
    }

    fn step(&self) -> Result<u64> {
        let (frame, mut hooks, sleep) = {
            let mut st = self.inner.lock();
            st.check_connection()?;
            let dt = st.step_seconds();
            let frame = st.advance();
            (frame, std::mem::take(&mut st.hooks), st.cfg.realtime.then(|| Duration::from_secs_f64(dt)))
        };
        for hook in hooks.iter_mut() {
            hook(frame);
        }
        {
            let mut st = self.inner.lock();
            let added = std::mem::replace(&mut st.hooks, hooks);
            st.hooks.extend(added);
        }
        if let Some(d) = sleep {
            std::thread::sleep(d);
        }
        Ok(frame)
    }
}

/// Clock that reads simulation time, so waits are measured in simulated
/// seconds and tests stay deterministic.
#[derive(Clone)]
pub struct SimClock {
    inner: Arc<Mutex<WorldState>>,
}

impl Clock for SimClock {
    fn now(&self) -> Duration { Duration::from_micros(self.inner.lock().elapsed_us) }
}

impl Simulator for OfflineSim {
    fn tick(&mut self) -> Result<u64> {
        if !self.inner.lock().settings.synchronous_mode {
            debug!("tick issued while the world is asynchronous");
        }
        self.step()
    }

    fn wait_for_tick(&mut self) -> Result<u64> { self.step() }

    fn elapsed_seconds(&self) -> f64 { self.inner.lock().elapsed_seconds() }

    fn settings(&self) -> Result<WorldSettings> {
        let st = self.inner.lock();
        st.check_connection()?;
        Ok(st.settings)
    }

    fn apply_settings(&mut self, settings: WorldSettings) -> Result<()> {
        let mut st = self.inner.lock();
        st.check_connection()?;
        st.settings = settings;
        st.settings_log.push(settings);
        Ok(())
    }

    fn weather(&self) -> Result<WeatherParameters> { Ok(self.inner.lock().weather) }

    fn set_weather(&mut self, weather: WeatherParameters) -> Result<()> {
        let mut st = self.inner.lock();
        if st.faults.fail_set_weather {
            return Err(TorError::Other(anyhow::anyhow!("weather update rejected")));
        }
        st.weather = weather;
        st.weather_log.push(weather);
        Ok(())
    }

    fn find_ego_vehicle(&self) -> Result<Option<ActorId>> {
        let st = self.inner.lock();
        Ok(st.actors.values()
            .find(|a| a.is_vehicle() && a.blueprint.contains("dreyevr"))
            .map(|a| a.id))
    }

    fn transform(&self, actor: ActorId) -> Result<Transform> {
        Ok(self.inner.lock().actor(actor)?.transform)
    }

    fn set_transform(&mut self, actor: ActorId, transform: Transform) -> Result<()> {
        let mut st = self.inner.lock();
        if st.faults.fail_set_transform {
            return Err(TorError::Other(anyhow::anyhow!("transform of actor {actor} rejected")));
        }
        st.actor_mut(actor)?.transform = transform;
        Ok(())
    }

    fn velocity(&self, actor: ActorId) -> Result<Vector3> {
        let st = self.inner.lock();
        let a = st.actor(actor)?;
        let fwd = a.transform.forward();
        Ok(Vector3::new(fwd.x * a.speed, fwd.y * a.speed, 0.0))
    }

    fn apply_control(&mut self, actor: ActorId, control: VehicleControl) -> Result<()> {
        self.inner.lock().actor_mut(actor)?.control = control;
        Ok(())
    }

    fn set_autopilot(&mut self, actor: ActorId, enabled: bool, _tm_port: u16) -> Result<()> {
        let mut st = self.inner.lock();
        st.check_connection()?;
        st.actor_mut(actor)?.autopilot = enabled;
        st.autopilot_log.push((actor, enabled));
        Ok(())
    }

    fn lane_width_at(&self, _location: Vector3) -> Result<f64> {
        let st = self.inner.lock();
        if st.faults.fail_lane_width {
            return Err(TorError::Other(anyhow::anyhow!("no waypoint near location")));
        }
        Ok(st.cfg.lane_width_m)
    }

    fn traffic_light_at(&self, vehicle: ActorId) -> Result<Option<ActorId>> {
        let st = self.inner.lock();
        let loc = st.actor(vehicle)?.transform.location;
        Ok(st.light_ahead(&loc, st.cfg.light_stop_range_m))
    }

    fn traffic_light_state(&self, light: ActorId) -> Result<TrafficLightState> {
        match self.inner.lock().actor(light)?.kind {
            ActorKind::TrafficLight { state, .. } => Ok(state),
            _ => Err(TorError::ActorNotFound(light)),
        }
    }

    fn set_traffic_light_state(&mut self, light: ActorId, state: TrafficLightState) -> Result<()> {
        let mut st = self.inner.lock();
        match &mut st.actor_mut(light)?.kind {
            ActorKind::TrafficLight { state: s, in_state_s } => {
                *s = state;
                *in_state_s = 0.0;
                Ok(())
            }
            _ => Err(TorError::ActorNotFound(light)),
        }
    }

    fn tm_set_synchronous_mode(&mut self, enabled: bool) -> Result<()> {
        self.inner.lock().tm_sync = enabled;
        Ok(())
    }

    fn tm_set_global_distance_to_leading_vehicle(&mut self, meters: f64) -> Result<()> {
        self.inner.lock().tm_leading_distance_m = meters;
        Ok(())
    }

    fn tm_set_global_speed_difference(&mut self, percentage: f64) -> Result<()> {
        self.inner.lock().tm_speed_difference_pct = percentage;
        Ok(())
    }

    fn tm_set_respawn_dormant_vehicles(&mut self, enabled: bool) -> Result<()> {
        self.inner.lock().tm_respawn_dormant = enabled;
        Ok(())
    }

    fn tm_set_random_seed(&mut self, seed: u64) -> Result<()> {
        use rand::SeedableRng;
        self.inner.lock().rng = rand::rngs::StdRng::seed_from_u64(seed);
        Ok(())
    }

    fn tm_update_vehicle_lights(&mut self, actor: ActorId, enabled: bool) -> Result<()> {
        self.inner.lock().actor_mut(actor)?.lights = enabled;
        Ok(())
    }

    fn blueprints(&self, pattern: &str) -> Result<Vec<Blueprint>> {
        Ok(self.inner.lock().library.iter().filter(|b| wildcard_match(pattern, &b.id)).cloned().collect())
    }

    fn find_blueprint(&self, id: &str) -> Result<Option<Blueprint>> {
        Ok(self.inner.lock().library.iter().find(|b| b.id == id).cloned())
    }

    fn spawn_points(&self) -> Result<Vec<Transform>> { Ok(library::spawn_points()) }

    fn spawn_batch(&mut self, commands: Vec<SpawnCommand>, commit: bool) -> Result<Vec<SpawnResponse>> {
        let responses = {
            let mut st = self.inner.lock();
            st.check_connection()?;
            commands.into_iter().enumerate().map(|(i, c)| st.spawn_one(c, i)).collect::<Vec<_>>()
        };
        if commit {
            self.step()?;
        }
        Ok(responses)
    }

    fn destroy_batch(&mut self, actors: &[ActorId]) -> Result<usize> {
        let mut st = self.inner.lock();
        st.destroy_calls += 1;
        if st.faults.fail_destroy_batches > 0 {
            st.faults.fail_destroy_batches -= 1;
            return Err(TorError::Other(anyhow::anyhow!("destroy batch of {} actors rejected", actors.len())));
        }
        let ego = st.ego;
        let mut destroyed = 0;
        for id in actors {
            if Some(*id) == ego {
                continue;
            }
            if st.actors.remove(id).is_some() {
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    fn random_navigation_location(&mut self) -> Result<Option<Vector3>> {
        Ok(Some(self.inner.lock().random_sidewalk_location()))
    }

    fn set_pedestrians_seed(&mut self, seed: u64) -> Result<()> {
        use rand::SeedableRng;
        self.inner.lock().rng = rand::rngs::StdRng::seed_from_u64(seed);
        Ok(())
    }

    fn set_pedestrians_cross_factor(&mut self, factor: f32) -> Result<()> {
        self.inner.lock().pedestrians_cross_factor = factor;
        Ok(())
    }

    fn start_walker(&mut self, controller: ActorId, destination: Vector3, max_speed: f32) -> Result<()> {
        let mut st = self.inner.lock();
        match &mut st.actor_mut(controller)?.kind {
            ActorKind::WalkerController { active, destination: d, max_speed: m, .. } => {
                *active = true;
                *d = destination;
                *m = max_speed;
                Ok(())
            }
            _ => Err(TorError::ActorNotFound(controller)),
        }
    }

    fn stop_walker(&mut self, controller: ActorId) -> Result<()> {
        let mut st = self.inner.lock();
        match &mut st.actor_mut(controller)?.kind {
            ActorKind::WalkerController { active, .. } => {
                *active = false;
                Ok(())
            }
            _ => Err(TorError::ActorNotFound(controller)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synchronous_sim() -> OfflineSim {
        let sim = OfflineSim::new(OfflineConfig::default());
        sim.set_synchronous(true, Some(0.025));
        sim
    }

    #[test]
    fn tick_advances_frame_and_clock() {
        let mut sim = synchronous_sim();
        let clock = sim.clock();
        assert_eq!(sim.tick().unwrap(), 1);
        assert_eq!(sim.tick().unwrap(), 2);
        assert_eq!(clock.now(), Duration::from_millis(50));
        assert!((sim.elapsed_seconds() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn tick_hooks_can_read_the_world() {
        let mut sim = synchronous_sim();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (probe, log) = (sim.clone(), seen.clone());
        sim.on_tick(move |f| log.lock().push((f, probe.frame())));
        sim.tick().unwrap();
        sim.tick().unwrap();
        assert_eq!(*seen.lock(), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn disconnect_fault_fails_ticks() {
        let mut sim = synchronous_sim();
        sim.set_faults(FaultPlan { disconnect_at_frame: Some(2), ..Default::default() });
        sim.tick().unwrap();
        sim.tick().unwrap();
        assert!(matches!(sim.tick(), Err(TorError::ConnectionFailure(_))));
    }

    #[test]
    fn ego_is_found_by_blueprint() {
        let sim = synchronous_sim();
        assert_eq!(sim.find_ego_vehicle().unwrap(), sim.ego());
        let no_ego = OfflineSim::new(OfflineConfig { spawn_ego: false, ..Default::default() });
        assert_eq!(no_ego.find_ego_vehicle().unwrap(), None);
    }

    #[test]
    fn autopilot_accelerates_toward_speed_bias() {
        let mut sim = synchronous_sim();
        let ego = sim.ego().unwrap();
        sim.tm_set_global_speed_difference(-100.0).unwrap();
        sim.set_autopilot(ego, true, 8000).unwrap();
        for _ in 0..40 {
            sim.tick().unwrap();
        }
        let v = sim.velocity(ego).unwrap().length();
        assert!(v > 2.9 && v < 3.1, "speed after 1s was {v}");
    }

    #[test]
    fn rotated_vehicle_moves_sideways() {
        let mut sim = synchronous_sim();
        let ego = sim.ego().unwrap();
        sim.set_speed(ego, 10.0).unwrap();
        let t = sim.transform(ego).unwrap().with_yaw_offset(-20.0);
        sim.set_transform(ego, t).unwrap();
        for _ in 0..40 {
            sim.tick().unwrap();
        }
        let y = sim.transform(ego).unwrap().location.y;
        assert!(y < -3.0, "lateral offset {y}");
    }

    #[test]
    fn lights_cycle_and_can_be_forced() {
        let mut sim = synchronous_sim();
        let (light, state) = sim.traffic_lights()[0];
        assert_eq!(state, TrafficLightState::Red);
        sim.set_traffic_light_state(light, TrafficLightState::Green).unwrap();
        assert_eq!(sim.traffic_light_state(light).unwrap(), TrafficLightState::Green);
        for _ in 0..420 {
            sim.tick().unwrap();
        }
        assert_eq!(sim.traffic_light_state(light).unwrap(), TrafficLightState::Yellow);
    }

    #[test]
    fn ego_reports_light_when_close() {
        let mut sim = synchronous_sim();
        let ego = sim.ego().unwrap();
        assert_eq!(sim.traffic_light_at(ego).unwrap(), None);
        let mut t = sim.transform(ego).unwrap();
        t.location.x = library::FIRST_LIGHT_X - 10.0;
        sim.set_transform(ego, t).unwrap();
        assert!(sim.traffic_light_at(ego).unwrap().is_some());
    }

    #[test]
    fn spawn_batch_reports_per_command_results() {
        let mut sim = synchronous_sim();
        sim.set_faults(FaultPlan { fail_every_nth_spawn: Some(2), ..Default::default() });
        let points = sim.spawn_points().unwrap();
        let bp = sim.find_blueprint("vehicle.audi.tt").unwrap().unwrap();
        let cmds: Vec<SpawnCommand> = points.iter().take(4)
            .map(|t| SpawnCommand { blueprint: bp.clone(), transform: *t, parent: None, autopilot: Some(8000) })
            .collect();
        let res = sim.spawn_batch(cmds, true).unwrap();
        assert_eq!(res.iter().filter(|r| r.is_ok()).count(), 2);
        assert!(res[1].is_err() && res[3].is_err());
        assert_eq!(sim.population_counts().0, 2);
        assert_eq!(sim.frame(), 1);
    }

    #[test]
    fn controller_needs_walker_parent() {
        let mut sim = synchronous_sim();
        let ctrl = sim.find_blueprint(library::WALKER_CONTROLLER).unwrap().unwrap();
        let ego = sim.ego();
        let res = sim.spawn_batch(vec![SpawnCommand {
            blueprint: ctrl,
            transform: Transform::default(),
            parent: ego,
            autopilot: None,
        }], false).unwrap();
        assert!(res[0].is_err());
    }

    #[test]
    fn destroy_batch_spares_ego_and_counts_removed() {
        let mut sim = synchronous_sim();
        let ego = sim.ego().unwrap();
        let bp = sim.find_blueprint("vehicle.tesla.model3").unwrap().unwrap();
        let t = sim.spawn_points().unwrap()[0];
        let id = sim.spawn_batch(vec![SpawnCommand { blueprint: bp, transform: t, parent: None, autopilot: None }], false)
            .unwrap()[0].clone().unwrap();
        assert_eq!(sim.destroy_batch(&[id, ego, 9999]).unwrap(), 1);
        assert!(sim.actor(ego).is_some());
    }

    #[test]
    fn blueprint_filter_uses_wildcards() {
        let sim = synchronous_sim();
        let walkers = sim.blueprints("walker.pedestrian.*").unwrap();
        assert_eq!(walkers.len(), 8);
        assert_eq!(sim.blueprints("vehicle.tesla.*").unwrap().len(), 1);
    }
}
