//! Static blueprint library and road layout of the offline town.

use tor_core::{Blueprint, Rotation, Transform, Vector3};

pub const EGO_BLUEPRINT: &str = "vehicle.dreyevr.egovehicle";
pub const WALKER_CONTROLLER: &str = "controller.ai.walker";

// three-lane straight road along +X: the ego starts in the middle lane
// (y = 0), traffic spawns in the outer lanes at y = -LANE_WIDTH_M and
// y = +LANE_WIDTH_M. No collisions are modelled, so a lane change may move the
// ego into a lane that traffic also uses.
pub const LANE_WIDTH_M: f64 = 3.5;
pub const ROAD_START_X: f64 = -200.0;
pub const ROAD_END_X: f64 = 2000.0;
pub const SIDEWALK_Y: f64 = 8.0;

// traffic lights stand every LIGHT_SPACING_M meters starting at FIRST_LIGHT_X
pub const FIRST_LIGHT_X: f64 = 120.0;
pub const LIGHT_SPACING_M: f64 = 250.0;
pub const LIGHT_COUNT: usize = 8;

fn vehicle(id: &str, generation: u32, colors: &[&str]) -> Blueprint {
    let mut bp = Blueprint::new(id);
    bp.generation = Some(generation);
    if !colors.is_empty() {
        bp.attributes.push(("color".into(), colors.iter().map(|c| c.to_string()).collect()));
    }
    bp
}

fn walker(idx: u32) -> Blueprint {
    let mut bp = Blueprint::new(format!("walker.pedestrian.{:04}", idx));
    bp.generation = Some(if idx <= 4 { 1 } else { 2 });
    bp.attributes.push(("is_invincible".into(), vec!["true".into(), "false".into()]));
    // idle, walking, running
    bp.attributes.push(("speed".into(), vec!["0.0".into(), "1.4".into(), "2.5".into()]));
    bp
}

pub fn blueprint_library() -> Vec<Blueprint> {
    let mut lib = vec![
        vehicle("vehicle.audi.tt", 2, &["255,0,0", "0,0,255", "20,20,20"]),
        vehicle("vehicle.tesla.model3", 2, &["255,255,255", "10,10,10"]),
        vehicle("vehicle.lincoln.mkz_2017", 1, &["90,90,90"]),
        vehicle("vehicle.nissan.micra", 1, &["200,180,20", "30,120,200"]),
        vehicle("vehicle.mercedes.coupe_2020", 2, &[]),
        vehicle(EGO_BLUEPRINT, 2, &[]),
    ];
    let mut bike = vehicle("vehicle.bh.crossbike", 1, &[]);
    bike.attributes.push(("driver_id".into(), vec!["0".into(), "1".into(), "2".into()]));
    lib.push(bike);
    lib.extend((1..=8).map(walker));
    lib.push(Blueprint::new(WALKER_CONTROLLER));
    lib
}

/// Vehicle spawn points in both outer lanes, headed along +X, behind and ahead of
/// the ego start position.
pub fn spawn_points() -> Vec<Transform> {
    let mut points = Vec::new();
    for i in 0..30 {
        let x = -150.0 + 25.0 * i as f64;
        for y in [-LANE_WIDTH_M, LANE_WIDTH_M] {
            points.push(Transform::new(Vector3::new(x, y, 0.3), Rotation::default()));
        }
    }
    points
}

pub fn ego_start() -> Transform {
    Transform::new(Vector3::new(0.0, 0.0, 0.3), Rotation::default())
}

pub fn light_positions() -> impl Iterator<Item = Vector3> {
    (0..LIGHT_COUNT).map(|i| Vector3::new(FIRST_LIGHT_X + LIGHT_SPACING_M * i as f64, LANE_WIDTH_M * 2.0, 0.0))
}
