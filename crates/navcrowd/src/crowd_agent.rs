//! Crowd agent state and steering helpers

use bitflags::bitflags;
use navcrowd_common::{dist_2d, dist_sqr_2d, sqr, vadd, vlen, vmad, vnormalize, vscale, vsub};
use navcrowd_mesh::{PathQueueRef, PolyRef, StraightPathFlags};

use crate::local_boundary::LocalBoundary;
use crate::path_corridor::{Corner, PathCorridor};

/// The maximum number of neighbours an agent takes into account for steering
pub const MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners an agent looks ahead in its path
pub const MAX_CORNERS: usize = 4;

const DEFAULT_AGENT_RADIUS: f32 = 0.6;
const DEFAULT_AGENT_HEIGHT: f32 = 2.0;
const DEFAULT_AGENT_MAX_ACCELERATION: f32 = 8.0;
const DEFAULT_AGENT_MAX_SPEED: f32 = 3.5;

/// Stable agent identifier. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentHandle(pub(crate) u32);

impl AgentHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

/// The kind of surface the agent is currently on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrowdAgentState {
    /// The agent is not on the navigation mesh
    #[default]
    Invalid,
    /// The agent is walking on navigation mesh polygons
    Walking,
    /// The agent is traversing an off-mesh connection
    OffMesh,
}

/// Progress of the agent's move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Velocity,
}

bitflags! {
    /// Per-agent behaviour switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UpdateFlags: u8 {
        const ANTICIPATE_TURNS = 1;
        const OBSTACLE_AVOIDANCE = 2;
        const SEPARATION = 4;
        /// Shortcut the corridor towards visible corners
        const OPTIMIZE_VIS = 8;
        /// Periodically rerun a local search to straighten the corridor
        const OPTIMIZE_TOPO = 16;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::all()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Neighbours and walls further than this are ignored by steering
    pub collision_query_range: f32,
    pub path_optimization_range: f32,
    /// How strongly the agent keeps its distance from neighbours
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index of the obstacle avoidance configuration to use
    pub obstacle_avoidance_type: u8,
    /// Index of the query filter to use
    pub query_filter_type: u8,
    /// When false the caller moves the agent across off-mesh connections with
    /// `Crowd::set_agent_position`
    pub auto_traverse_off_mesh_link: bool,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_AGENT_RADIUS,
            height: DEFAULT_AGENT_HEIGHT,
            max_acceleration: DEFAULT_AGENT_MAX_ACCELERATION,
            max_speed: DEFAULT_AGENT_MAX_SPEED,
            collision_query_range: 12.0,
            path_optimization_range: 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::default(),
            obstacle_avoidance_type: 0,
            query_filter_type: 0,
            auto_traverse_off_mesh_link: true,
        }
    }
}

/// A neighbouring agent, by slot index in the crowd
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdNeighbour {
    pub idx: usize,
    /// Squared planar distance
    pub dist: f32,
}

/// Off-mesh connection traversal
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrowdAgentAnimation {
    pub active: bool,
    /// Agent position when the traversal started
    pub init_pos: [f32; 3],
    pub start_pos: [f32; 3],
    pub end_pos: [f32; 3],
    /// Position last tick, for agents moved by the caller
    pub prev_pos: [f32; 3],
    pub poly_ref: PolyRef,
    pub t: f32,
    pub tmax: f32,
}

#[derive(Debug, Clone)]
pub struct CrowdAgent {
    pub(crate) handle: AgentHandle,
    pub(crate) state: CrowdAgentState,
    /// The path does not reach the requested target
    pub(crate) partial: bool,
    pub(crate) corridor: PathCorridor,
    pub(crate) boundary: LocalBoundary,
    pub(crate) topology_opt_time: f32,
    pub(crate) neighbours: Vec<CrowdNeighbour>,
    pub(crate) desired_speed: f32,

    pub(crate) npos: [f32; 3],
    /// Collision resolution displacement
    pub(crate) disp: [f32; 3],
    /// Desired velocity from steering
    pub(crate) dvel: [f32; 3],
    /// Velocity after obstacle avoidance
    pub(crate) nvel: [f32; 3],
    pub(crate) vel: [f32; 3],

    pub(crate) params: AgentParams,
    pub(crate) corners: Vec<Corner>,

    pub(crate) target_state: MoveRequestState,
    pub(crate) target_ref: PolyRef,
    /// Target position, or the requested velocity in velocity mode
    pub(crate) target_pos: [f32; 3],
    pub(crate) target_path_queue_ref: Option<PathQueueRef>,
    pub(crate) target_replan: bool,
    pub(crate) target_replan_time: f32,
    /// Drift recovery is throttled until this reaches zero
    pub(crate) recovery_cooldown: f32,

    pub(crate) anim: CrowdAgentAnimation,
}

impl CrowdAgent {
    pub(crate) fn new(handle: AgentHandle, params: AgentParams, max_path: usize) -> Self {
        Self {
            handle,
            state: CrowdAgentState::Invalid,
            partial: false,
            corridor: PathCorridor::new(max_path),
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neighbours: Vec::with_capacity(MAX_NEIGHBOURS),
            desired_speed: 0.0,
            npos: [0.0; 3],
            disp: [0.0; 3],
            dvel: [0.0; 3],
            nvel: [0.0; 3],
            vel: [0.0; 3],
            params,
            corners: Vec::with_capacity(MAX_CORNERS),
            target_state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: [0.0; 3],
            target_path_queue_ref: None,
            target_replan: false,
            target_replan_time: 0.0,
            recovery_cooldown: 0.0,
            anim: CrowdAgentAnimation::default(),
        }
    }

    pub fn get_handle(&self) -> AgentHandle {
        self.handle
    }

    pub fn get_state(&self) -> CrowdAgentState {
        self.state
    }

    pub fn get_params(&self) -> &AgentParams {
        &self.params
    }

    pub fn get_position(&self) -> &[f32; 3] {
        &self.npos
    }

    pub fn get_velocity(&self) -> &[f32; 3] {
        &self.vel
    }

    pub fn get_desired_velocity(&self) -> &[f32; 3] {
        &self.dvel
    }

    /// Velocity chosen by obstacle avoidance this tick
    pub fn get_avoidance_velocity(&self) -> &[f32; 3] {
        &self.nvel
    }

    pub fn get_displacement(&self) -> &[f32; 3] {
        &self.disp
    }

    pub fn get_desired_speed(&self) -> f32 {
        self.desired_speed
    }

    pub fn get_corners(&self) -> &[Corner] {
        &self.corners
    }

    pub fn get_neighbours(&self) -> &[CrowdNeighbour] {
        &self.neighbours
    }

    pub fn get_corridor(&self) -> &PathCorridor {
        &self.corridor
    }

    pub fn get_boundary(&self) -> &LocalBoundary {
        &self.boundary
    }

    pub fn get_target_state(&self) -> MoveRequestState {
        self.target_state
    }

    pub fn get_target_ref(&self) -> PolyRef {
        self.target_ref
    }

    pub fn get_target_pos(&self) -> &[f32; 3] {
        &self.target_pos
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn get_animation(&self) -> &CrowdAgentAnimation {
        &self.anim
    }

    /// True when the target is a path target, not `None` or a velocity
    pub(crate) fn has_path_target(&self) -> bool {
        !matches!(self.target_state, MoveRequestState::None | MoveRequestState::Velocity)
    }

    /// Unit direction on the XZ plane towards the first corner
    pub fn calc_straight_steer_direction(&self) -> [f32; 3] {
        let Some(first) = self.corners.first() else {
            return [0.0; 3];
        };
        let mut dir = vsub(&first.pos, &self.npos);
        dir[1] = 0.0;
        vnormalize(&dir)
    }

    /// Direction towards the first corner bent towards the second one. The bend fades
    /// out as the first corner gets further than ten radii away.
    pub fn calc_smooth_steer_direction(&self) -> [f32; 3] {
        if self.corners.is_empty() {
            return [0.0; 3];
        }

        let ip1 = 1.min(self.corners.len() - 1);
        let p0 = &self.corners[0].pos;
        let p1 = &self.corners[ip1].pos;

        let mut dir0 = vsub(p0, &self.npos);
        let mut dir1 = vsub(p1, &self.npos);
        dir0[1] = 0.0;
        dir1[1] = 0.0;

        let len0 = vlen(&dir0);
        let len1 = vlen(&dir1);
        if len1 > 0.001 {
            dir1 = vscale(&dir1, 1.0 / len1);
        }

        let falloff = 1.0 / (1.0 + sqr(len0 / (10.0 * self.params.radius)));
        // Added, not subtracted: the heading leans into the turn towards the second corner
        let mut dir = vmad(&dir0, &dir1, len0 * 0.5 * falloff);
        dir[1] = 0.0;
        vnormalize(&dir)
    }

    /// Planar distance to the path end, when the end is among the corners
    pub fn distance_to_goal(&self) -> Option<f32> {
        let last = self.corners.last()?;
        if !last.flags.contains(StraightPathFlags::END) {
            return None;
        }
        Some(dist_2d(&self.npos, &last.pos))
    }

    /// Speed along the path. Near the goal the speed follows the braking curve of
    /// `max_acceleration`, so the agent comes to rest within a quarter radius of it.
    pub fn calc_desired_speed(&self) -> f32 {
        let max_speed = self.params.max_speed;
        let Some(dist) = self.distance_to_goal() else {
            return max_speed;
        };

        let stop_radius = self.params.radius * 0.25;
        if dist < stop_radius {
            return 0.0;
        }

        let accel = self.params.max_acceleration.max(f32::EPSILON);
        let stop_dist = dist - stop_radius;
        let braking = sqr(vlen(&self.vel)) / (2.0 * accel);
        let max_braking = sqr(max_speed) / (2.0 * accel);

        if stop_dist < braking.max(max_braking) {
            (2.0 * accel * stop_dist).sqrt().min(max_speed)
        } else {
            max_speed
        }
    }

    /// Applies the avoidance velocity under the acceleration limit and moves the agent.
    pub fn integrate(&mut self, dt: f32) {
        let max_delta = self.params.max_acceleration * dt;
        let mut dv = vsub(&self.nvel, &self.vel);
        let ds = vlen(&dv);
        if ds > max_delta {
            dv = vscale(&dv, max_delta / ds);
        }
        self.vel = vadd(&self.vel, &dv);

        if vlen(&self.vel) > 0.0001 {
            self.npos = vmad(&self.npos, &self.vel, dt);
        } else {
            self.vel = [0.0; 3];
        }
    }

    /// True when the last corner is an off-mesh connection within `radius`
    pub fn over_off_mesh_connection(&self, radius: f32) -> bool {
        let Some(last) = self.corners.last() else {
            return false;
        };
        last.flags.contains(StraightPathFlags::OFF_MESH_CONNECTION)
            && dist_sqr_2d(&self.npos, &last.pos) < sqr(radius)
    }

    /// Inserts a neighbour keeping the list sorted by distance. Equal distances keep
    /// insertion order. The list is capped at `MAX_NEIGHBOURS`.
    pub fn add_neighbour(&mut self, idx: usize, dist: f32) {
        let pos = self
            .neighbours
            .iter()
            .position(|n| dist < n.dist)
            .unwrap_or(self.neighbours.len());
        if pos >= MAX_NEIGHBOURS {
            return;
        }
        self.neighbours.insert(pos, CrowdNeighbour { idx, dist });
        self.neighbours.truncate(MAX_NEIGHBOURS);
    }
}
