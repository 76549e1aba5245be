//! Core simulation model and traits used by the TOR scenario runner

use serde::{Serialize, Deserialize};
use std::fmt;
use std::str::FromStr;

mod sim;
pub use sim::*;

pub type ActorId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self { Self { x, y, z } }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(&self, other: &Vector3) -> f64 {
        Vector3::new(self.x - other.x, self.y - other.y, self.z - other.z).length()
    }
}

/// Orientation in degrees (engine convention: yaw around Z, 0 = +X).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub location: Vector3,
    pub rotation: Rotation,
}

impl Transform {
    pub fn new(location: Vector3, rotation: Rotation) -> Self { Self { location, rotation } }

    /// Same location, yaw rotated by `delta_deg`.
    pub fn with_yaw_offset(&self, delta_deg: f64) -> Self {
        let mut t = *self;
        t.rotation.yaw += delta_deg;
        t
    }

    /// Unit vector along the heading projected on the ground plane.
    pub fn forward(&self) -> Vector3 {
        let yaw = self.rotation.yaw.to_radians();
        Vector3::new(yaw.cos(), yaw.sin(), 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleControl {
    pub throttle: f32,   // 0..1
    pub steer: f32,      // -1..1
    pub brake: f32,      // 0..1
    pub hand_brake: bool,
    pub reverse: bool,
    pub manual_gear_shift: bool,
    pub gear: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficLightState {
    Red,
    Yellow,
    Green,
    Off,
    Unknown,
}

/// Atmospheric parameters. Captured as a snapshot before a scenario
/// mutates the weather and compared field-for-field on restore.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WeatherParameters {
    pub cloudiness: f32,             // 0..100
    pub precipitation: f32,          // 0..100
    pub precipitation_deposits: f32, // 0..100
    pub wind_intensity: f32,         // 0..100
    pub fog_density: f32,            // 0..100
    pub fog_distance: f32,           // meters
    pub fog_falloff: f32,
}

impl WeatherParameters {
    /// Dense fog with rain and strong wind, used by the extreme weather scenario.
    pub fn extreme_fog() -> Self {
        Self {
            cloudiness: 80.0,
            precipitation: 30.0,
            precipitation_deposits: 90.0,
            wind_intensity: 100.0,
            fog_density: 90.0,
            fog_distance: 5.0,
            fog_falloff: 20.0,
        }
    }

    pub fn clear_noon() -> Self {
        Self {
            cloudiness: 5.0,
            precipitation: 0.0,
            precipitation_deposits: 0.0,
            wind_intensity: 10.0,
            fog_density: 0.0,
            fog_distance: 0.0,
            fog_falloff: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldSettings {
    pub synchronous_mode: bool,
    pub no_rendering_mode: bool,
    pub fixed_delta_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneChange {
    Left,
    Right,
}

impl LaneChange {
    /// Fixed heading change applied for the duration of the maneuver.
    pub fn heading_delta_deg(self, magnitude_deg: f64) -> f64 {
        match self {
            LaneChange::Left => -magnitude_deg.abs(),
            LaneChange::Right => magnitude_deg.abs(),
        }
    }
}

impl FromStr for LaneChange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(Self::Left),
            "right" | "r" => Ok(Self::Right),
            other => Err(ParseError::LaneChange(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    LeadVehicleDeceleration,
    ExtremeWeather,
    ConstructionSite,
    HumanCrossing,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 4] = [
        ScenarioKind::LeadVehicleDeceleration,
        ScenarioKind::ExtremeWeather,
        ScenarioKind::ConstructionSite,
        ScenarioKind::HumanCrossing,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ScenarioKind::LeadVehicleDeceleration => "Leading Vehicle Abrupt Deceleration",
            ScenarioKind::ExtremeWeather => "Extreme Weather",
            ScenarioKind::ConstructionSite => "Construction Site Ahead",
            ScenarioKind::HumanCrossing => "Human Crossing",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioKind::LeadVehicleDeceleration => "lead-vehicle-deceleration",
            ScenarioKind::ExtremeWeather => "extreme-weather",
            ScenarioKind::ConstructionSite => "construction-site",
            ScenarioKind::HumanCrossing => "human-crossing",
        };
        f.write_str(s)
    }
}

/// Accepts the kebab-case name, the short study code (LVAD, EW, CSA, HCR)
/// or the numeric selector 1..=4.
impl FromStr for ScenarioKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "lvad" | "lead-vehicle-deceleration" => Ok(Self::LeadVehicleDeceleration),
            "2" | "ew" | "extreme-weather" => Ok(Self::ExtremeWeather),
            "3" | "csa" | "construction-site" => Ok(Self::ConstructionSite),
            "4" | "hcr" | "human-crossing" => Ok(Self::HumanCrossing),
            other => Err(ParseError::Scenario(other.to_string())),
        }
    }
}

/// Values exchanged with the operator task through the signal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum Signal {
    Idle = 0,
    Reserved = 1,
    TakeoverRequested = 2,
}

impl Signal {
    pub fn value(self) -> i64 { self as i64 }
}

impl TryFrom<i64> for Signal {
    type Error = ParseError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Signal::Idle),
            1 => Ok(Signal::Reserved),
            2 => Ok(Signal::TakeoverRequested),
            other => Err(ParseError::SignalOutOfDomain(other)),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Blueprint as listed by the engine's library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: String,
    pub generation: Option<u32>,
    // attribute name -> recommended values
    #[serde(default)]
    pub attributes: Vec<(String, Vec<String>)>,
    // attribute name -> chosen value
    #[serde(default)]
    pub overrides: Vec<(String, String)>,
}

impl Blueprint {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), generation: None, attributes: Vec::new(), overrides: Vec::new() }
    }

    pub fn recommended_values(&self, name: &str) -> Option<&[String]> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.recommended_values(name).is_some()
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.overrides.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.overrides.push((name.to_string(), value)),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.overrides.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnCommand {
    pub blueprint: Blueprint,
    pub transform: Transform,
    pub parent: Option<ActorId>,
    // traffic manager port to hand the actor to right after spawning
    pub autopilot: Option<u16>,
}

/// Per-command result of a batched spawn: actor id or the engine's message.
pub type SpawnResponse = Result<ActorId, String>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown scenario '{0}' (expected 1-4, lvad, ew, csa, hcr or a kebab-case name)")]
    Scenario(String),
    #[error("unknown lane change direction '{0}'")]
    LaneChange(String),
    #[error("signal value {0} is outside 0..=2")]
    SignalOutOfDomain(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum TorError {
    #[error("connection to simulator failed: {0}")]
    ConnectionFailure(String),
    #[error("signal channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("invalid maneuver state: {0}")]
    InvalidManeuverState(String),
    #[error("{failed} of {requested} {what} spawns failed")]
    SpawnPartialFailure { what: &'static str, requested: usize, failed: usize },
    #[error("ego vehicle not found in the world")]
    EgoVehicleMissing,
    #[error("actor {0} not found")]
    ActorNotFound(ActorId),
    #[error("scenario {0} is not implemented")]
    NotImplemented(ScenarioKind),
    #[error("interrupted by operator")]
    Interrupted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TorError {
    /// Stable code per error kind, also used as process exit status.
    pub fn code(&self) -> u8 {
        match self {
            TorError::ConnectionFailure(_) => 10,
            TorError::ChannelUnavailable(_) => 11,
            TorError::InvalidManeuverState(_) => 12,
            TorError::SpawnPartialFailure { .. } => 13,
            TorError::EgoVehicleMissing => 14,
            TorError::ActorNotFound(_) => 15,
            TorError::NotImplemented(_) => 16,
            TorError::Interrupted => 130,
            TorError::Other(_) => 1,
        }
    }

    /// Errors that end the session body. Everything else is logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailure(_) | TorError::Interrupted | TorError::EgoVehicleMissing
        )
    }
}

pub type Result<T, E = TorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_kind_parses_all_selector_forms() {
        assert_eq!("2".parse::<ScenarioKind>().unwrap(), ScenarioKind::ExtremeWeather);
        assert_eq!("LVAD".parse::<ScenarioKind>().unwrap(), ScenarioKind::LeadVehicleDeceleration);
        assert_eq!("construction-site".parse::<ScenarioKind>().unwrap(), ScenarioKind::ConstructionSite);
        assert_eq!(" hcr ".parse::<ScenarioKind>().unwrap(), ScenarioKind::HumanCrossing);
        assert!("5".parse::<ScenarioKind>().is_err());
        assert!("true".parse::<ScenarioKind>().is_err());
    }

    #[test]
    fn scenario_kind_display_parses_back() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.to_string().parse::<ScenarioKind>().unwrap(), kind);
        }
    }

    #[test]
    fn scenario_kind_serde_uses_kebab_case() {
        let s = serde_json::to_string(&ScenarioKind::ExtremeWeather).unwrap();
        assert_eq!(s, "\"extreme-weather\"");
    }

    #[test]
    fn signal_domain_is_enforced() {
        assert_eq!(Signal::try_from(2).unwrap(), Signal::TakeoverRequested);
        assert_eq!(Signal::Idle.value(), 0);
        assert!(matches!(Signal::try_from(3), Err(ParseError::SignalOutOfDomain(3))));
        assert!(Signal::try_from(-1).is_err());
    }

    #[test]
    fn lane_change_heading_sign() {
        assert_eq!(LaneChange::Left.heading_delta_deg(20.0), -20.0);
        assert_eq!(LaneChange::Right.heading_delta_deg(-20.0), 20.0);
    }

    #[test]
    fn yaw_offset_keeps_location() {
        let t = Transform::new(Vector3::new(1.0, 2.0, 0.5), Rotation { pitch: 0.0, yaw: 90.0, roll: 0.0 });
        let r = t.with_yaw_offset(-20.0);
        assert_eq!(r.location, t.location);
        assert_eq!(r.rotation.yaw, 70.0);
    }

    #[test]
    fn blueprint_attribute_override_replaces() {
        let mut bp = Blueprint::new("vehicle.audi.tt");
        bp.set_attribute("color", "1,2,3");
        bp.set_attribute("color", "4,5,6");
        assert_eq!(bp.attribute("color"), Some("4,5,6"));
        assert_eq!(bp.overrides.len(), 1);
    }

    #[test]
    fn error_codes_are_distinct() {
        let errs = [
            TorError::ConnectionFailure("x".into()),
            TorError::ChannelUnavailable("x".into()),
            TorError::InvalidManeuverState("x".into()),
            TorError::SpawnPartialFailure { what: "vehicle", requested: 2, failed: 1 },
            TorError::EgoVehicleMissing,
            TorError::ActorNotFound(1),
            TorError::NotImplemented(ScenarioKind::HumanCrossing),
            TorError::Interrupted,
        ];
        let mut codes: Vec<u8> = errs.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
        assert!(TorError::Interrupted.is_fatal());
        assert!(!TorError::ChannelUnavailable("x".into()).is_fatal());
    }
}
