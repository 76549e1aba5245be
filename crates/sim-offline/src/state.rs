use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tor_core::*;

use crate::library::{self, LANE_WIDTH_M};
use crate::{FaultPlan, OfflineConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum ActorKind {
    Vehicle,
    Walker,
    WalkerController { walker: ActorId, active: bool, destination: Vector3, max_speed: f32 },
    TrafficLight { state: TrafficLightState, in_state_s: f64 },
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: ActorId,
    pub blueprint: String,
    pub kind: ActorKind,
    pub transform: Transform,
    // scalar speed along the heading (vehicles, walkers)
    pub speed: f64,
    pub autopilot: bool,
    pub control: VehicleControl,
    pub lights: bool,
}

impl Actor {
    fn new(id: ActorId, blueprint: &str, kind: ActorKind, transform: Transform) -> Self {
        Self {
            id,
            blueprint: blueprint.to_string(),
            kind,
            transform,
            speed: 0.0,
            autopilot: false,
            control: VehicleControl::default(),
            lights: false,
        }
    }

    pub fn is_vehicle(&self) -> bool { matches!(self.kind, ActorKind::Vehicle) }
}

pub type TickHook = Box<dyn FnMut(u64) + Send>;

pub struct WorldState {
    pub cfg: OfflineConfig,
    pub faults: FaultPlan,
    pub frame: u64,
    pub elapsed_us: u64,
    pub settings: WorldSettings,
    pub weather: WeatherParameters,
    pub actors: BTreeMap<ActorId, Actor>,
    pub ego: Option<ActorId>,
    next_id: ActorId,
    pub rng: StdRng,
    pub library: Vec<Blueprint>,
    pub hooks: Vec<TickHook>,

    // traffic manager
    pub tm_sync: bool,
    pub tm_speed_difference_pct: f64,
    pub tm_leading_distance_m: f64,
    pub tm_respawn_dormant: bool,
    pub pedestrians_cross_factor: f32,

    // observation log for assertions
    pub autopilot_log: Vec<(ActorId, bool)>,
    pub weather_log: Vec<WeatherParameters>,
    pub destroy_calls: usize,
    pub settings_log: Vec<WorldSettings>,
}

impl WorldState {
    pub fn new(cfg: OfflineConfig) -> Self {
        let mut st = Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            faults: FaultPlan::default(),
            frame: 0,
            elapsed_us: 0,
            settings: WorldSettings::default(),
            weather: WeatherParameters::clear_noon(),
            actors: BTreeMap::new(),
            ego: None,
            next_id: 100,
            library: library::blueprint_library(),
            hooks: Vec::new(),
            tm_sync: false,
            tm_speed_difference_pct: 30.0,
            tm_leading_distance_m: 2.5,
            tm_respawn_dormant: false,
            pedestrians_cross_factor: 0.0,
            autopilot_log: Vec::new(),
            weather_log: Vec::new(),
            destroy_calls: 0,
            settings_log: Vec::new(),
            cfg,
        };
        for pos in library::light_positions() {
            let id = st.alloc_id();
            let kind = ActorKind::TrafficLight { state: TrafficLightState::Red, in_state_s: 0.0 };
            st.actors.insert(id, Actor::new(id, "traffic.traffic_light", kind, Transform::new(pos, Rotation::default())));
        }
        if st.cfg.spawn_ego {
            let id = st.alloc_id();
            let mut ego = Actor::new(id, library::EGO_BLUEPRINT, ActorKind::Vehicle, library::ego_start());
            ego.speed = st.cfg.ego_initial_speed_mps;
            st.actors.insert(id, ego);
            st.ego = Some(id);
        }
        st
    }

    pub fn alloc_id(&mut self) -> ActorId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn elapsed_seconds(&self) -> f64 { self.elapsed_us as f64 / 1e6 }

    /// Step used for the next frame: fixed delta when set, otherwise the
    /// variable rate an externally driven server would produce.
    pub fn step_seconds(&self) -> f64 {
        self.settings.fixed_delta_seconds.filter(|d| *d > 0.0).unwrap_or(self.cfg.variable_step_s)
    }

    pub fn actor(&self, id: ActorId) -> Result<&Actor> {
        self.actors.get(&id).ok_or(TorError::ActorNotFound(id))
    }

    pub fn actor_mut(&mut self, id: ActorId) -> Result<&mut Actor> {
        self.actors.get_mut(&id).ok_or(TorError::ActorNotFound(id))
    }

    pub fn check_connection(&self) -> Result<()> {
        match self.faults.disconnect_at_frame {
            Some(f) if self.frame >= f => Err(TorError::ConnectionFailure(format!("server stopped responding at frame {}", self.frame))),
            _ => Ok(()),
        }
    }

    fn autopilot_target_speed(&self) -> f64 {
        // the traffic manager expresses speed as a percentage below the limit
        let factor = 1.0 - self.tm_speed_difference_pct / 100.0;
        (self.cfg.speed_limit_mps * factor).clamp(0.0, self.cfg.max_speed_mps)
    }

    /// Light whose stop line lies within `range` meters ahead of `loc`.
    pub fn light_ahead(&self, loc: &Vector3, range: f64) -> Option<ActorId> {
        self.actors.values()
            .filter(|a| matches!(a.kind, ActorKind::TrafficLight { .. }))
            .find(|a| {
                let ahead = a.transform.location.x - loc.x;
                (0.0..=range).contains(&ahead) && (a.transform.location.y - loc.y).abs() < LANE_WIDTH_M * 3.0
            })
            .map(|a| a.id)
    }

    fn light_state(&self, id: ActorId) -> Option<TrafficLightState> {
        match self.actors.get(&id).map(|a| &a.kind) {
            Some(ActorKind::TrafficLight { state, .. }) => Some(*state),
            _ => None,
        }
    }

    pub fn advance(&mut self) -> u64 {
        let dt = self.step_seconds();
        let target = self.autopilot_target_speed();
        let stop_range = self.cfg.light_stop_range_m;

        // lights
        let (green, yellow, red) = (self.cfg.green_s, self.cfg.yellow_s, self.cfg.red_s);
        for a in self.actors.values_mut() {
            if let ActorKind::TrafficLight { state, in_state_s } = &mut a.kind {
                *in_state_s += dt;
                let limit = match state {
                    TrafficLightState::Green => green,
                    TrafficLightState::Yellow => yellow,
                    TrafficLightState::Red => red,
                    _ => f64::INFINITY,
                };
                if *in_state_s >= limit {
                    *state = match state {
                        TrafficLightState::Green => TrafficLightState::Yellow,
                        TrafficLightState::Yellow => TrafficLightState::Red,
                        _ => TrafficLightState::Green,
                    };
                    *in_state_s = 0.0;
                }
            }
        }

        // vehicles
        let ids: Vec<ActorId> = self.actors.values().filter(|a| a.is_vehicle()).map(|a| a.id).collect();
        for id in ids {
            let blocked = {
                let loc = self.actors[&id].transform.location;
                self.light_ahead(&loc, stop_range)
                    .and_then(|l| self.light_state(l))
                    .map(|s| matches!(s, TrafficLightState::Red | TrafficLightState::Yellow))
                    .unwrap_or(false)
            };
            let (accel, decel) = (self.cfg.accel_mps2, self.cfg.decel_mps2);
            let Some(v) = self.actors.get_mut(&id) else { continue };
            if v.autopilot {
                let goal = if blocked { 0.0 } else { target };
                if v.speed < goal {
                    v.speed = (v.speed + accel * dt).min(goal);
                } else {
                    v.speed = (v.speed - decel * dt).max(goal);
                }
                // autopilot steers back to the lane heading
                v.transform.rotation.yaw -= v.transform.rotation.yaw * (2.0 * dt).min(1.0);
            } else {
                let c = v.control;
                let a = c.throttle as f64 * accel - c.brake as f64 * decel - if c.hand_brake { decel } else { 0.0 };
                v.speed = (v.speed + a * dt).max(0.0);
            }
            let fwd = v.transform.forward();
            let dir = if !v.autopilot && v.control.reverse { -1.0 } else { 1.0 };
            v.transform.location.x += fwd.x * v.speed * dt * dir;
            v.transform.location.y += fwd.y * v.speed * dt * dir;
        }

        // walkers follow their controllers
        let moves: Vec<(ActorId, Vector3, f64)> = self.actors.values()
            .filter_map(|a| match a.kind {
                ActorKind::WalkerController { walker, active: true, destination, max_speed } => Some((walker, destination, max_speed as f64)),
                _ => None,
            })
            .collect();
        for (walker, dest, max_speed) in moves {
            if let Some(w) = self.actors.get_mut(&walker) {
                let here = w.transform.location;
                let dist = here.distance(&dest);
                if dist > 1e-6 {
                    let step = (max_speed * dt).min(dist);
                    w.transform.location.x += (dest.x - here.x) / dist * step;
                    w.transform.location.y += (dest.y - here.y) / dist * step;
                    w.transform.rotation.yaw = (dest.y - here.y).atan2(dest.x - here.x).to_degrees();
                    w.speed = step / dt;
                } else {
                    w.speed = 0.0;
                }
            }
        }

        self.frame += 1;
        self.elapsed_us += (dt * 1e6).round() as u64;
        self.frame
    }

    pub fn spawn_one(&mut self, cmd: SpawnCommand, index: usize) -> SpawnResponse {
        if let Some(n) = self.faults.fail_every_nth_spawn {
            if n > 0 && (index + 1) % n == 0 {
                return Err("Spawn failed because of collision at spawn position".into());
            }
        }
        let known = self.library.iter().any(|b| b.id == cmd.blueprint.id);
        if !known {
            return Err(format!("blueprint '{}' not found", cmd.blueprint.id));
        }
        let id_str = cmd.blueprint.id.as_str();
        let kind = if id_str == library::WALKER_CONTROLLER {
            let Some(parent) = cmd.parent else {
                return Err("walker controller requires a parent".into());
            };
            if !matches!(self.actors.get(&parent).map(|a| &a.kind), Some(ActorKind::Walker)) {
                return Err(format!("parent {} is not a walker", parent));
            }
            ActorKind::WalkerController { walker: parent, active: false, destination: Vector3::default(), max_speed: 0.0 }
        } else if id_str.starts_with("walker.") {
            ActorKind::Walker
        } else if id_str.starts_with("vehicle.") {
            let loc = cmd.transform.location;
            let occupied = self.actors.values()
                .any(|a| a.is_vehicle() && a.transform.location.distance(&loc) < 2.0);
            if occupied {
                return Err("Spawn failed because of collision at spawn position".into());
            }
            ActorKind::Vehicle
        } else {
            return Err(format!("blueprint '{}' cannot be spawned", id_str));
        };
        let id = self.alloc_id();
        let transform = match (&kind, cmd.parent) {
            (ActorKind::WalkerController { .. }, Some(p)) => self.actors[&p].transform,
            _ => cmd.transform,
        };
        let mut actor = Actor::new(id, id_str, kind, transform);
        if let Some(_port) = cmd.autopilot {
            actor.autopilot = true;
        }
        self.actors.insert(id, actor);
        Ok(id)
    }

    pub fn random_sidewalk_location(&mut self) -> Vector3 {
        let x = self.rng.gen_range(library::ROAD_START_X..library::ROAD_END_X / 4.0);
        let side = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        Vector3::new(x, side * library::SIDEWALK_Y, 0.9)
    }
}
