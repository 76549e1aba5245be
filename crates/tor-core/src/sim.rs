use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::*;

/// Capability interface of the external simulation engine.
///
/// Mirrors the call contract of the engine's client API; the transport is
/// owned by the implementation. All calls are blocking.
pub trait Simulator {
    /// Synchronous mode: process exactly one fixed step and return its frame.
    fn tick(&mut self) -> Result<u64>;
    /// Asynchronous mode: block until the next externally driven frame.
    fn wait_for_tick(&mut self) -> Result<u64>;
    /// Simulation time of the last committed frame.
    fn elapsed_seconds(&self) -> f64;

    fn settings(&self) -> Result<WorldSettings>;
    fn apply_settings(&mut self, settings: WorldSettings) -> Result<()>;

    fn weather(&self) -> Result<WeatherParameters>;
    fn set_weather(&mut self, weather: WeatherParameters) -> Result<()>;

    fn find_ego_vehicle(&self) -> Result<Option<ActorId>>;
    fn transform(&self, actor: ActorId) -> Result<Transform>;
    fn set_transform(&mut self, actor: ActorId, transform: Transform) -> Result<()>;
    fn velocity(&self, actor: ActorId) -> Result<Vector3>;
    fn apply_control(&mut self, actor: ActorId, control: VehicleControl) -> Result<()>;
    fn set_autopilot(&mut self, actor: ActorId, enabled: bool, tm_port: u16) -> Result<()>;
    /// Width of the driving lane under `location`.
    fn lane_width_at(&self, location: Vector3) -> Result<f64>;

    /// Traffic light currently affecting `vehicle`, if it is at one.
    fn traffic_light_at(&self, vehicle: ActorId) -> Result<Option<ActorId>>;
    fn traffic_light_state(&self, light: ActorId) -> Result<TrafficLightState>;
    fn set_traffic_light_state(&mut self, light: ActorId, state: TrafficLightState) -> Result<()>;

    // traffic manager
    fn tm_set_synchronous_mode(&mut self, enabled: bool) -> Result<()>;
    fn tm_set_global_distance_to_leading_vehicle(&mut self, meters: f64) -> Result<()>;
    fn tm_set_global_speed_difference(&mut self, percentage: f64) -> Result<()>;
    fn tm_set_respawn_dormant_vehicles(&mut self, enabled: bool) -> Result<()>;
    fn tm_set_random_seed(&mut self, seed: u64) -> Result<()>;
    fn tm_update_vehicle_lights(&mut self, actor: ActorId, enabled: bool) -> Result<()>;

    /// Blueprints whose id matches the wildcard `pattern`.
    fn blueprints(&self, pattern: &str) -> Result<Vec<Blueprint>>;
    fn find_blueprint(&self, id: &str) -> Result<Option<Blueprint>>;
    fn spawn_points(&self) -> Result<Vec<Transform>>;
    /// Applies the commands in order; `commit` ticks once afterwards.
    fn spawn_batch(&mut self, commands: Vec<SpawnCommand>, commit: bool) -> Result<Vec<SpawnResponse>>;
    /// Returns how many actors were actually destroyed.
    fn destroy_batch(&mut self, actors: &[ActorId]) -> Result<usize>;

    fn random_navigation_location(&mut self) -> Result<Option<Vector3>>;
    fn set_pedestrians_seed(&mut self, seed: u64) -> Result<()>;
    fn set_pedestrians_cross_factor(&mut self, factor: f32) -> Result<()>;
    fn start_walker(&mut self, controller: ActorId, destination: Vector3, max_speed: f32) -> Result<()>;
    fn stop_walker(&mut self, controller: ActorId) -> Result<()>;
}

/// Single-integer mailbox shared with the operator task.
pub trait SignalChannel {
    /// Overwrites any previous value.
    fn write(&self, signal: Signal) -> Result<()>;
    /// Last written value, or `ChannelUnavailable` when the store cannot be
    /// opened or does not hold a value in the signal domain.
    fn read(&self) -> Result<Signal>;
}

/// Monotonic time source used by the wait loops.
pub trait Clock {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration { (**self).now() }
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn now(&self) -> Duration { (**self).now() }
}

/// Wall clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self { Self { origin: Instant::now() } }
}

impl Default for SystemClock {
    fn default() -> Self { Self::new() }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration { self.origin.elapsed() }
}

/// Operator abort flag shared between the signal handler and the session.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self { Self::default() }

    pub fn raise(&self) { self.0.store(true, Ordering::SeqCst); }

    pub fn is_raised(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// Glob match supporting `*` (any run) and `?` (one char), as used by
/// blueprint filters like `vehicle.*` or `walker.pedestrian.00?1`.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
