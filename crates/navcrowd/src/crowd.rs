//! Crowd simulation
//!
//! [`Crowd`] owns a dense array of agents and advances them together. Each call to
//! [`Crowd::update`] runs these phases in order:
//!
//! 1. path validity checks and replanning triggers
//! 2. move requests: quick local searches, then the shared path queue
//! 3. corridor topology optimization for at most one agent
//! 4. proximity grid rebuild
//! 5. local boundaries and neighbour lists
//! 6. steering corners and visibility optimization
//! 7. off-mesh connection triggers
//! 8. steering, obstacle avoidance and integration, in parallel chunks
//! 9. collision resolution
//! 10. movement along the navmesh surface
//! 11. off-mesh traversal animation
//!
//! Agents are addressed by [`AgentHandle`]. Handles stay valid until the agent is
//! removed and are never reused.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use navcrowd_common::{
    dist_2d, dist_sqr_2d, sqr, tri_area_2d, vadd, vdist_sqr, vlen, vlen_sqr, vlerp, vmad, vscale,
    vsub, Error, Result,
};
use navcrowd_mesh::{NavMesh, NavMeshQuery, PathQueue, PolyRef, QueryFilter, Status};

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::crowd_agent::{
    AgentHandle, AgentParams, CrowdAgent, CrowdAgentAnimation, CrowdAgentState, MoveRequestState,
    UpdateFlags, MAX_CORNERS,
};
use crate::obstacle_avoidance::{
    ObstacleAvoidanceDebugData, ObstacleAvoidanceParams, ObstacleAvoidanceQuery,
};
use crate::proximity_grid::ProximityGrid;

/// Number of obstacle avoidance configuration slots
pub const MAX_OBSTACLE_AVOIDANCE_PARAMS: usize = 8;

/// Number of query filter slots
pub const MAX_QUERY_FILTER_TYPE: usize = 16;

const MAX_COMMON_NODES: usize = 512;
const CHECK_LOOKAHEAD: usize = 10;
const TARGET_REPLAN_DELAY: f32 = 1.0;
pub(crate) const RECOVERY_COOLDOWN: f32 = 1.0;
const QUICK_SEARCH_ITERS: usize = 20;
const QUICK_SEARCH_MAX_PATH: usize = 32;
const MAX_QUEUED_REQUESTS_PER_UPDATE: usize = 8;
const MAX_NEIGHBOUR_QUERY: usize = 32;
const COLLISION_ITERATIONS: usize = 4;
const COLLISION_RESOLVE_FACTOR: f32 = 0.7;
const OFF_MESH_TRIGGER_SCALE: f32 = 2.25;
const OFF_MESH_EASE_IN: f32 = 0.15;

/// Which agents may start an off-mesh traversal in one update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum OffMeshTrigger {
    /// Stop looking after the first agent that starts a traversal
    #[default]
    FirstPerUpdate,
    All,
}

/// Crowd construction parameters
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct CrowdConfig {
    pub max_agents: usize,
    /// Largest agent radius. Sizes the proximity grid and the placement search box.
    pub max_agent_radius: f32,
    /// Upper bound on parallel kinematics tasks
    pub max_parallelism: usize,
    /// Maximum number of polygons in an agent corridor
    pub max_path_result: usize,
    /// Search iterations the path queue may spend per update
    pub path_queue_iterations: usize,
    /// Seconds between topology optimizations of an agent
    pub topology_optimization_time: f32,
    pub off_mesh_trigger: OffMeshTrigger,
    /// Node pool size of the path queue search
    pub path_queue_max_nodes: usize,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            max_agents: 128,
            max_agent_radius: 0.6,
            max_parallelism: 4,
            max_path_result: 256,
            path_queue_iterations: 100,
            topology_optimization_time: 0.5,
            off_mesh_trigger: OffMeshTrigger::default(),
            path_queue_max_nodes: 4096,
        }
    }
}

/// Debug output collected for one agent during an update
#[derive(Debug, Clone, Default)]
pub struct CrowdAgentDebugInfo {
    pub agent: Option<AgentHandle>,
    /// Start of the last visibility optimization segment
    pub opt_start: [f32; 3],
    pub opt_end: [f32; 3],
    pub vod: ObstacleAvoidanceDebugData,
}

impl CrowdAgentDebugInfo {
    pub fn new(agent: AgentHandle, max_samples: usize) -> Self {
        Self {
            agent: Some(agent),
            opt_start: [0.0; 3],
            opt_end: [0.0; 3],
            vod: ObstacleAvoidanceDebugData::new(max_samples),
        }
    }
}

/// Agent waiting for a path queue slot, ordered by time since its last replan
#[derive(Debug, Clone, Copy)]
struct QueuedRequest {
    slot: usize,
    replan_time: f32,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.replan_time
            .total_cmp(&other.replan_time)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

/// Kinematic state of an agent as seen by the others during the parallel phase
#[derive(Debug, Clone, Copy)]
struct KinematicSnapshot {
    npos: [f32; 3],
    vel: [f32; 3],
    dvel: [f32; 3],
    radius: f32,
}

impl KinematicSnapshot {
    fn of(ag: &CrowdAgent) -> Self {
        Self {
            npos: ag.npos,
            vel: ag.vel,
            dvel: ag.dvel,
            radius: ag.params.radius,
        }
    }
}

/// A group of agents moving on one navigation mesh
#[derive(Debug)]
pub struct Crowd<'a> {
    nav_mesh: &'a NavMesh,
    config: CrowdConfig,
    agents: Vec<CrowdAgent>,
    slots: HashMap<AgentHandle, usize>,
    next_handle: u32,
    path_queue: PathQueue<'a>,
    nav_query: NavMeshQuery<'a>,
    obstacle_queries: Vec<ObstacleAvoidanceQuery>,
    obstacle_params: [ObstacleAvoidanceParams; MAX_OBSTACLE_AVOIDANCE_PARAMS],
    filters: Vec<QueryFilter>,
    grid: ProximityGrid,
    query_half_extents: [f32; 3],
    velocity_sample_count: usize,
}

impl<'a> Crowd<'a> {
    pub fn new(nav_mesh: &'a NavMesh, config: CrowdConfig) -> Result<Self> {
        if config.max_agents == 0 {
            return Err(Error::InvalidParam("max_agents must be positive".to_string()));
        }
        if !(config.max_agent_radius > 0.0) || !config.max_agent_radius.is_finite() {
            return Err(Error::InvalidParam(format!(
                "max_agent_radius must be positive, got {}",
                config.max_agent_radius
            )));
        }
        if config.max_parallelism == 0 {
            return Err(Error::InvalidParam("max_parallelism must be positive".to_string()));
        }
        if config.max_path_result == 0 {
            return Err(Error::InvalidParam("max_path_result must be positive".to_string()));
        }

        let r = config.max_agent_radius;
        let query_half_extents = [r * 2.0, r * 1.5, r * 2.0];
        let grid = ProximityGrid::new(config.max_agents * 4, r * 3.0);
        let path_queue = PathQueue::new(nav_mesh, config.max_path_result, config.path_queue_max_nodes);
        let obstacle_queries = (0..config.max_parallelism)
            .map(|_| ObstacleAvoidanceQuery::default())
            .collect();

        log::debug!(
            "Created crowd: {} agents max, radius {}, {} workers",
            config.max_agents,
            r,
            config.max_parallelism
        );

        Ok(Self {
            nav_mesh,
            agents: Vec::with_capacity(config.max_agents),
            slots: HashMap::with_capacity(config.max_agents),
            next_handle: 1,
            path_queue,
            nav_query: NavMeshQuery::with_max_nodes(nav_mesh, MAX_COMMON_NODES),
            obstacle_queries,
            obstacle_params: [ObstacleAvoidanceParams::default(); MAX_OBSTACLE_AVOIDANCE_PARAMS],
            filters: vec![QueryFilter::default(); MAX_QUERY_FILTER_TYPE],
            grid,
            query_half_extents,
            velocity_sample_count: 0,
            config,
        })
    }

    /// Adds an agent at the nearest navmesh point to `pos`.
    ///
    /// When no polygon is found the agent is still created, in the `Invalid` state.
    pub fn add_agent(&mut self, pos: &[f32; 3], params: AgentParams) -> Result<AgentHandle> {
        self.validate_agent_params(&params)?;
        if self.agents.len() >= self.config.max_agents {
            return Err(Error::Crowd(format!(
                "crowd is full ({} agents)",
                self.config.max_agents
            )));
        }

        let handle = AgentHandle(self.next_handle);
        self.next_handle += 1;

        let filter = &self.filters[params.query_filter_type as usize];
        let (poly_ref, nearest) = self
            .nav_query
            .find_nearest_poly(pos, &self.query_half_extents, filter)
            .unwrap_or((PolyRef::NULL, *pos));

        let mut ag = CrowdAgent::new(handle, params, self.config.max_path_result);
        ag.corridor.reset(poly_ref, nearest);
        ag.npos = nearest;
        ag.state = if poly_ref.is_valid() {
            CrowdAgentState::Walking
        } else {
            log::debug!("{} added off the navigation mesh at {:?}", handle, pos);
            CrowdAgentState::Invalid
        };

        self.slots.insert(handle, self.agents.len());
        self.agents.push(ag);
        Ok(handle)
    }

    /// Removes the agent. Remaining agents keep their creation order.
    pub fn remove_agent(&mut self, handle: AgentHandle) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        self.agents.remove(slot);
        self.slots.remove(&handle);
        for idx in self.slots.values_mut() {
            if *idx > slot {
                *idx -= 1;
            }
        }
        // Slot indices moved; rebuilt next update
        for ag in &mut self.agents {
            ag.neighbours.clear();
        }
        true
    }

    pub fn update_agent_parameters(&mut self, handle: AgentHandle, params: AgentParams) -> bool {
        if let Err(e) = self.validate_agent_params(&params) {
            log::warn!("Rejected parameters for {}: {}", handle, e);
            return false;
        }
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        self.agents[slot].params = params;
        true
    }

    /// Requests a path to `pos` on polygon `poly_ref`. Fails for a null polygon.
    pub fn request_move_target(&mut self, handle: AgentHandle, poly_ref: PolyRef, pos: &[f32; 3]) -> bool {
        if !poly_ref.is_valid() {
            return false;
        }
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        let ag = &mut self.agents[slot];
        ag.target_ref = poly_ref;
        ag.target_pos = *pos;
        ag.target_path_queue_ref = None;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Requesting;
        true
    }

    /// Slides the target of an agent with a valid path to `pos` along the navmesh
    /// surface, without replanning. Returns false when the agent has no valid path.
    pub fn adjust_move_target(&mut self, handle: AgentHandle, pos: &[f32; 3]) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        let ag = &mut self.agents[slot];
        if ag.target_state != MoveRequestState::Valid {
            return false;
        }
        let filter = &self.filters[ag.params.query_filter_type as usize];
        if let Err(e) = ag.corridor.move_target_position(pos, &mut self.nav_query, filter) {
            log::debug!("{} could not move its target: {}", ag.handle, e);
            return false;
        }
        ag.target_ref = ag.corridor.get_last_poly();
        ag.target_pos = *ag.corridor.get_target();
        true
    }

    /// Makes the agent steer with a fixed velocity instead of following a path
    pub fn request_move_velocity(&mut self, handle: AgentHandle, vel: &[f32; 3]) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        let ag = &mut self.agents[slot];
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = *vel;
        ag.target_path_queue_ref = None;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Velocity;
        true
    }

    pub fn reset_move_target(&mut self, handle: AgentHandle) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        let ag = &mut self.agents[slot];
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = [0.0; 3];
        ag.dvel = [0.0; 3];
        ag.target_path_queue_ref = None;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::None;
        true
    }

    /// Moves an agent directly. Used to drive agents that do not traverse off-mesh
    /// connections automatically.
    pub fn set_agent_position(&mut self, handle: AgentHandle, pos: &[f32; 3]) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        self.agents[slot].npos = *pos;
        true
    }

    pub fn get_agent(&self, handle: AgentHandle) -> Option<&CrowdAgent> {
        self.slots.get(&handle).map(|&slot| &self.agents[slot])
    }

    /// Active agents in creation order
    pub fn get_agents(&self) -> &[CrowdAgent] {
        &self.agents
    }

    pub fn get_agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn get_config(&self) -> &CrowdConfig {
        &self.config
    }

    pub fn get_proximity_grid(&self) -> &ProximityGrid {
        &self.grid
    }

    pub fn get_path_queue(&self) -> &PathQueue<'a> {
        &self.path_queue
    }

    pub fn get_nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    pub fn get_obstacle_avoidance_params(&self, idx: usize) -> Option<&ObstacleAvoidanceParams> {
        self.obstacle_params.get(idx)
    }

    pub fn set_obstacle_avoidance_params(&mut self, idx: usize, params: ObstacleAvoidanceParams) -> bool {
        match self.obstacle_params.get_mut(idx) {
            Some(slot) => {
                *slot = params;
                true
            }
            None => {
                log::warn!("Obstacle avoidance slot {} out of range", idx);
                false
            }
        }
    }

    pub fn get_filter(&self, idx: usize) -> Option<&QueryFilter> {
        self.filters.get(idx)
    }

    pub fn get_filter_mut(&mut self, idx: usize) -> Option<&mut QueryFilter> {
        self.filters.get_mut(idx)
    }

    /// Search box used to place agents and targets on the mesh
    pub fn get_query_half_extents(&self) -> &[f32; 3] {
        &self.query_half_extents
    }

    /// Avoidance samples evaluated during the last update
    pub fn get_velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Per-agent navigation failures are absorbed into agent state. The only error is
    /// `Error::Invariant`, which aborts the update.
    pub fn update(&mut self, dt: f32, mut debug: Option<&mut CrowdAgentDebugInfo>) -> Result<()> {
        self.velocity_sample_count = 0;
        if self.agents.is_empty() {
            return Ok(());
        }

        let debug_slot = debug
            .as_ref()
            .and_then(|d| d.agent)
            .and_then(|h| self.slots.get(&h).copied());

        self.check_path_validity(dt);
        self.update_move_requests()?;
        self.update_topology_optimization(dt)?;
        self.rebuild_grid();
        self.update_neighbours();
        self.update_corners(debug_slot, debug.as_deref_mut())?;
        self.trigger_off_mesh_connections()?;
        self.update_kinematics(dt, debug_slot, debug.map(|d| &mut d.vod));
        self.resolve_collisions();
        self.move_along_surface()?;
        self.update_off_mesh_animations(dt);

        log::trace!(
            "Crowd update: {} agents, {} velocity samples",
            self.agents.len(),
            self.velocity_sample_count
        );
        Ok(())
    }

    /// Agents wider than `max_agent_radius` would outgrow the grid cells and the
    /// placement search box.
    fn validate_agent_params(&self, params: &AgentParams) -> Result<()> {
        validate_params(params)?;
        if params.radius > self.config.max_agent_radius {
            return Err(Error::InvalidParam(format!(
                "agent radius {} exceeds max_agent_radius {}",
                params.radius, self.config.max_agent_radius
            )));
        }
        Ok(())
    }

    fn slot(&self, handle: AgentHandle) -> Option<usize> {
        let slot = self.slots.get(&handle).copied();
        if slot.is_none() {
            log::warn!("Unknown agent handle {}", handle);
        }
        slot
    }

    fn check_path_validity(&mut self, dt: f32) {
        let half_extents = self.query_half_extents;

        for ag in self.agents.iter_mut() {
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            ag.target_replan_time += dt;
            ag.recovery_cooldown = (ag.recovery_cooldown - dt).max(0.0);

            let filter = &self.filters[ag.params.query_filter_type as usize];
            let mut replan = false;

            let mut agent_ref = ag.corridor.get_first_poly();
            let mut agent_pos = ag.npos;
            let drifted = ag.recovery_cooldown <= 0.0
                && vdist_sqr(&ag.npos, ag.corridor.get_pos()) > 4.0 * sqr(ag.params.radius);

            if drifted || !self.nav_query.is_valid_poly_ref(agent_ref, filter) {
                if drifted {
                    ag.recovery_cooldown = RECOVERY_COOLDOWN;
                }
                (agent_ref, agent_pos) = self
                    .nav_query
                    .find_nearest_poly(&ag.npos, &half_extents, filter)
                    .unwrap_or((PolyRef::NULL, ag.npos));

                if !agent_ref.is_valid() {
                    ag.corridor.reset(PolyRef::NULL, ag.npos);
                    ag.partial = false;
                    ag.boundary.reset();
                    ag.state = CrowdAgentState::Invalid;
                    log::debug!("{} is no longer on the navigation mesh", ag.handle);
                    continue;
                }

                ag.corridor.fix_path_start(agent_ref, &agent_pos);
                ag.boundary.reset();
                ag.npos = agent_pos;
                replan = true;
            }

            if !ag.has_path_target() {
                continue;
            }

            if ag.target_state != MoveRequestState::Failed {
                if !self.nav_query.is_valid_poly_ref(ag.target_ref, filter) {
                    let (nearest, pt) = self
                        .nav_query
                        .find_nearest_poly(&ag.target_pos, &half_extents, filter)
                        .unwrap_or((PolyRef::NULL, ag.target_pos));
                    ag.target_ref = nearest;
                    if nearest.is_valid() {
                        ag.target_pos = pt;
                        replan = true;
                    }
                }
                if !ag.target_ref.is_valid() {
                    ag.corridor.reset(agent_ref, agent_pos);
                    ag.partial = false;
                    ag.dvel = [0.0; 3];
                    ag.desired_speed = 0.0;
                    ag.target_state = MoveRequestState::None;
                    log::debug!("{} lost its target", ag.handle);
                }
            }

            if !ag.corridor.is_valid(CHECK_LOOKAHEAD, &self.nav_query, filter) {
                // Keep following the valid prefix until the replan lands
                if let Err(e) =
                    ag.corridor
                        .trim_invalid_path(agent_ref, &agent_pos, &self.nav_query, filter)
                {
                    log::debug!("{} could not trim its corridor: {}", ag.handle, e);
                    ag.corridor.reset(agent_ref, agent_pos);
                }
                replan = true;
            }

            if ag.target_state == MoveRequestState::Valid
                && ag.target_replan_time > TARGET_REPLAN_DELAY
                && ag.corridor.get_path_count() < CHECK_LOOKAHEAD
                && ag.corridor.get_last_poly() != ag.target_ref
            {
                replan = true;
            }

            if replan && ag.target_state != MoveRequestState::None {
                request_move_target_replan(ag);
            }
        }
    }

    fn update_move_requests(&mut self) -> Result<()> {
        let mut queue = BinaryHeap::new();

        for (slot, ag) in self.agents.iter_mut().enumerate() {
            if ag.state == CrowdAgentState::Invalid || !ag.has_path_target() {
                continue;
            }

            if ag.target_state == MoveRequestState::Requesting {
                let filter = &self.filters[ag.params.query_filter_type as usize];
                request_quick_path(ag, &mut self.nav_query, filter)?;
            }

            if ag.target_state == MoveRequestState::WaitingForQueue {
                queue.push(QueuedRequest {
                    slot,
                    replan_time: ag.target_replan_time,
                });
            }
        }

        for _ in 0..MAX_QUEUED_REQUESTS_PER_UPDATE {
            let Some(req) = queue.pop() else {
                break;
            };
            let ag = &mut self.agents[req.slot];
            let filter = &self.filters[ag.params.query_filter_type as usize];
            ag.target_path_queue_ref = self.path_queue.request(
                ag.corridor.get_last_poly(),
                ag.target_ref,
                ag.corridor.get_target(),
                &ag.target_pos,
                filter,
            );
            if ag.target_path_queue_ref.is_some() {
                ag.target_state = MoveRequestState::WaitingForPath;
            }
        }

        self.path_queue.update(self.config.path_queue_iterations);

        for ag in self.agents.iter_mut() {
            if ag.target_state != MoveRequestState::WaitingForPath {
                continue;
            }
            let status = ag
                .target_path_queue_ref
                .map_or(Status::Failure, |r| self.path_queue.request_status(r));

            if status.is_failure() {
                ag.target_path_queue_ref = None;
                ag.target_state = if ag.target_ref.is_valid() {
                    MoveRequestState::Requesting
                } else {
                    MoveRequestState::Failed
                };
                ag.target_replan_time = 0.0;
                log::debug!("{} path request failed: {}", ag.handle, status);
            } else if status.is_success() {
                let Some(req) = ag.target_path_queue_ref.take() else {
                    continue;
                };
                let (status, path) = self.path_queue.path_result(req);
                apply_path_result(ag, status, path, self.config.max_path_result, &self.nav_query)?;
            }
        }

        Ok(())
    }

    fn update_topology_optimization(&mut self, dt: f32) -> Result<()> {
        let threshold = self.config.topology_optimization_time;
        let mut best: Option<(usize, f32)> = None;

        for (slot, ag) in self.agents.iter_mut().enumerate() {
            if ag.state != CrowdAgentState::Walking
                || !ag.has_path_target()
                || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= threshold && best.map_or(true, |(_, t)| ag.topology_opt_time > t) {
                best = Some((slot, ag.topology_opt_time));
            }
        }

        if let Some((slot, _)) = best {
            let ag = &mut self.agents[slot];
            let filter = &self.filters[ag.params.query_filter_type as usize];
            recoverable(
                ag.corridor.optimize_path_topology(&mut self.nav_query, filter),
                "topology optimization",
            )?;
            ag.topology_opt_time = 0.0;
        }
        Ok(())
    }

    pub(crate) fn rebuild_grid(&mut self) {
        self.grid.clear();
        for (slot, ag) in self.agents.iter().enumerate() {
            let p = &ag.npos;
            let r = ag.params.radius;
            self.grid.add_item(slot, p[0] - r, p[2] - r, p[0] + r, p[2] + r);
        }
    }

    pub(crate) fn update_neighbours(&mut self) {
        let mut ids = Vec::with_capacity(MAX_NEIGHBOUR_QUERY);
        let mut found = Vec::with_capacity(MAX_NEIGHBOUR_QUERY);

        for i in 0..self.agents.len() {
            if self.agents[i].state != CrowdAgentState::Walking {
                continue;
            }

            {
                let ag = &mut self.agents[i];
                let filter = &self.filters[ag.params.query_filter_type as usize];
                let range = ag.params.collision_query_range;
                let update_thr = range * 0.25;
                if dist_sqr_2d(&ag.npos, ag.boundary.get_center()) > sqr(update_thr)
                    || !ag.boundary.is_valid(&self.nav_query, filter)
                {
                    let first = ag.corridor.get_first_poly();
                    if let Err(e) = ag.boundary.update(first, &ag.npos, range, &self.nav_query, filter) {
                        log::debug!("{} boundary update failed: {}", ag.handle, e);
                        ag.boundary.reset();
                    }
                }
            }

            let ag = &self.agents[i];
            let pos = ag.npos;
            let height = ag.params.height;
            let range = ag.params.collision_query_range;
            self.grid.query_items(
                pos[0] - range,
                pos[2] - range,
                pos[0] + range,
                pos[2] + range,
                &mut ids,
                MAX_NEIGHBOUR_QUERY,
            );

            found.clear();
            for &j in &ids {
                if j == i {
                    continue;
                }
                let other = &self.agents[j];
                let mut diff = vsub(&pos, &other.npos);
                if diff[1].abs() >= (height + other.params.height) / 2.0 {
                    continue;
                }
                diff[1] = 0.0;
                let dist_sqr = vlen_sqr(&diff);
                if dist_sqr > sqr(range) {
                    continue;
                }
                found.push((j, dist_sqr));
            }

            let ag = &mut self.agents[i];
            ag.neighbours.clear();
            for &(j, dist_sqr) in &found {
                ag.add_neighbour(j, dist_sqr);
            }
        }
    }

    fn update_corners(
        &mut self,
        debug_slot: Option<usize>,
        mut debug: Option<&mut CrowdAgentDebugInfo>,
    ) -> Result<()> {
        for (slot, ag) in self.agents.iter_mut().enumerate() {
            if ag.state != CrowdAgentState::Walking || !ag.has_path_target() {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];

            ag.corners = recoverable(
                ag.corridor.find_corners(MAX_CORNERS, &self.nav_query, filter),
                "corner search",
            )?
            .unwrap_or_default();

            let debug_info = if debug_slot == Some(slot) {
                debug.as_deref_mut()
            } else {
                None
            };

            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !ag.corners.is_empty() {
                let target = ag.corners[1.min(ag.corners.len() - 1)].pos;
                recoverable(
                    ag.corridor.optimize_path_visibility(
                        &target,
                        ag.params.path_optimization_range,
                        &self.nav_query,
                        filter,
                    ),
                    "visibility optimization",
                )?;
                if let Some(d) = debug_info {
                    d.opt_start = *ag.corridor.get_pos();
                    d.opt_end = target;
                }
            } else if let Some(d) = debug_info {
                d.opt_start = [0.0; 3];
                d.opt_end = [0.0; 3];
            }
        }
        Ok(())
    }

    fn trigger_off_mesh_connections(&mut self) -> Result<()> {
        for ag in self.agents.iter_mut() {
            if ag.state != CrowdAgentState::Walking || !ag.has_path_target() {
                continue;
            }

            let trigger_radius = ag.params.radius * OFF_MESH_TRIGGER_SCALE;
            if !ag.over_off_mesh_connection(trigger_radius) {
                continue;
            }
            let Some(con) = ag.corners.last().map(|c| c.poly) else {
                continue;
            };

            // A connection that cannot be entered is replanned by the validity checks
            let Some((start, end)) = recoverable(
                ag.corridor.move_over_off_mesh_connection(con, self.nav_mesh),
                "off-mesh connection",
            )?
            .flatten() else {
                continue;
            };

            ag.anim = CrowdAgentAnimation {
                active: true,
                init_pos: ag.npos,
                start_pos: start,
                end_pos: end,
                prev_pos: ag.npos,
                poly_ref: con,
                t: 0.0,
                tmax: dist_2d(&start, &end) / ag.params.max_speed.max(f32::EPSILON) * 0.5,
            };
            ag.state = CrowdAgentState::OffMesh;
            ag.corners.clear();
            ag.neighbours.clear();
            log::debug!("{} entered off-mesh connection {:?}", ag.handle, con);

            if self.config.off_mesh_trigger == OffMeshTrigger::FirstPerUpdate {
                break;
            }
        }
        Ok(())
    }

    fn update_kinematics(
        &mut self,
        dt: f32,
        debug_slot: Option<usize>,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) {
        let n = self.agents.len();
        let workers = self.config.max_parallelism.min(n + 1).max(1);

        let positions: Vec<[f32; 3]> = self.agents.iter().map(|ag| ag.npos).collect();
        for_each_agent_chunk(&mut self.agents, &mut self.obstacle_queries, workers, |_, ag, _| {
            if ag.state == CrowdAgentState::Walking {
                calc_steering(ag, &positions);
            }
        });

        let snapshot: Vec<KinematicSnapshot> = self.agents.iter().map(KinematicSnapshot::of).collect();
        let obstacle_params = &self.obstacle_params;
        let samples = AtomicUsize::new(0);
        let debug = Mutex::new(debug);

        for_each_agent_chunk(&mut self.agents, &mut self.obstacle_queries, workers, |slot, ag, query| {
            if ag.state != CrowdAgentState::Walking {
                return;
            }

            if ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                let idx = ag.params.obstacle_avoidance_type as usize;
                let params = obstacle_params.get(idx).unwrap_or_else(|| {
                    log::warn!("Obstacle avoidance slot {} out of range for {}", idx, ag.handle);
                    &obstacle_params[0]
                });
                let ns = if debug_slot == Some(slot) {
                    let mut guard = debug.lock().unwrap_or_else(|e| e.into_inner());
                    calc_avoidance(ag, query, &snapshot, params, guard.as_deref_mut())
                } else {
                    calc_avoidance(ag, query, &snapshot, params, None)
                };
                samples.fetch_add(ns, AtomicOrdering::Relaxed);
            } else {
                ag.nvel = ag.dvel;
            }

            ag.integrate(dt);
        });

        self.velocity_sample_count = samples.into_inner();
    }

    fn resolve_collisions(&mut self) {
        for _ in 0..COLLISION_ITERATIONS {
            self.resolve_collision_step();
        }
    }

    /// One collision iteration. All displacements are computed before any is applied.
    pub(crate) fn resolve_collision_step(&mut self) {
        let displacements: Vec<Option<[f32; 3]>> = self
            .agents
            .iter()
            .map(|ag| {
                if ag.state != CrowdAgentState::Walking {
                    return None;
                }
                let mut disp = [0.0; 3];
                let mut w = 0.0;

                for nei in &ag.neighbours {
                    let other = &self.agents[nei.idx];
                    let mut diff = vsub(&ag.npos, &other.npos);
                    diff[1] = 0.0;

                    let rsum = ag.params.radius + other.params.radius;
                    let dist_sqr = vlen_sqr(&diff);
                    if dist_sqr > sqr(rsum) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen;
                    if dist < 0.0001 {
                        // On top of each other, push apart along the desired velocity normal
                        diff = if ag.handle > other.handle {
                            [-ag.dvel[2], 0.0, ag.dvel[0]]
                        } else {
                            [ag.dvel[2], 0.0, -ag.dvel[0]]
                        };
                        pen = 0.01;
                    } else {
                        pen = (1.0 / dist) * ((rsum - dist) * 0.5) * COLLISION_RESOLVE_FACTOR;
                    }

                    disp = vmad(&disp, &diff, pen);
                    w += 1.0;
                }

                if w > 0.0001 {
                    disp = vscale(&disp, 1.0 / w);
                }
                Some(disp)
            })
            .collect();

        for (ag, disp) in self.agents.iter_mut().zip(displacements) {
            if let Some(disp) = disp {
                ag.disp = disp;
                ag.npos = vadd(&ag.npos, &disp);
            }
        }
    }

    fn move_along_surface(&mut self) -> Result<()> {
        for ag in self.agents.iter_mut() {
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];

            recoverable(
                ag.corridor.move_position(&ag.npos, &mut self.nav_query, filter),
                "surface move",
            )?;
            ag.npos = *ag.corridor.get_pos();

            if !ag.has_path_target() {
                let first = ag.corridor.get_first_poly();
                ag.corridor.reset(first, ag.npos);
                ag.partial = false;
            }
        }
        Ok(())
    }

    fn update_off_mesh_animations(&mut self, dt: f32) {
        for ag in self.agents.iter_mut() {
            if !ag.anim.active {
                continue;
            }
            let anim = &mut ag.anim;
            anim.t += dt;

            if anim.t > anim.tmax {
                anim.active = false;
                ag.state = CrowdAgentState::Walking;
                // Manually driven agents stay where the driver left them
                if ag.params.auto_traverse_off_mesh_link {
                    ag.npos = anim.end_pos;
                }
                log::debug!("{} finished off-mesh connection {:?}", ag.handle, anim.poly_ref);
                continue;
            }

            if ag.params.auto_traverse_off_mesh_link {
                let ta = anim.tmax * OFF_MESH_EASE_IN;
                ag.npos = if anim.t < ta {
                    vlerp(&anim.init_pos, &anim.start_pos, tween(anim.t, 0.0, ta))
                } else {
                    vlerp(&anim.start_pos, &anim.end_pos, tween(anim.t, ta, anim.tmax))
                };
                ag.vel = [0.0; 3];
                ag.dvel = [0.0; 3];
            } else if dt > 0.0 {
                ag.vel = vscale(&vsub(&ag.npos, &anim.prev_pos), 1.0 / dt);
                anim.prev_pos = ag.npos;
            }
        }
    }
}

fn validate_params(params: &AgentParams) -> Result<()> {
    if !(params.radius > 0.0) || !params.radius.is_finite() {
        return Err(Error::InvalidParam(format!("agent radius must be positive, got {}", params.radius)));
    }
    if !(params.height > 0.0) {
        return Err(Error::InvalidParam(format!("agent height must be positive, got {}", params.height)));
    }
    if !(params.max_speed >= 0.0) || !(params.max_acceleration >= 0.0) {
        return Err(Error::InvalidParam("agent speed and acceleration must not be negative".to_string()));
    }
    if params.obstacle_avoidance_type as usize >= MAX_OBSTACLE_AVOIDANCE_PARAMS {
        return Err(Error::InvalidParam(format!(
            "obstacle avoidance type {} out of range",
            params.obstacle_avoidance_type
        )));
    }
    if params.query_filter_type as usize >= MAX_QUERY_FILTER_TYPE {
        return Err(Error::InvalidParam(format!(
            "query filter type {} out of range",
            params.query_filter_type
        )));
    }
    Ok(())
}

/// Passes invariant violations through and turns other errors into `None`.
fn recoverable<T>(result: Result<T>, what: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ Error::Invariant(_)) => Err(e),
        Err(e) => {
            log::debug!("{} failed: {}", what, e);
            Ok(None)
        }
    }
}

/// Restarts path planning towards the current target, keeping the existing corridor
/// as a hint for the quick search.
fn request_move_target_replan(ag: &mut CrowdAgent) {
    ag.target_path_queue_ref = None;
    ag.target_replan = true;
    ag.target_state = if ag.target_ref.is_valid() {
        MoveRequestState::Requesting
    } else {
        MoveRequestState::Failed
    };
    log::debug!("{} replanning towards {:?}", ag.handle, ag.target_pos);
}

/// Runs a short search from the corridor start. Reaching the target makes the request
/// valid right away, otherwise the agent waits for the path queue while following the
/// partial result.
fn request_quick_path(ag: &mut CrowdAgent, nav_query: &mut NavMeshQuery, filter: &QueryFilter) -> Result<()> {
    let Some(&start) = ag.corridor.get_path().first() else {
        return Err(Error::Invariant(format!("{} requests a path with an empty corridor", ag.handle)));
    };

    let found = nav_query
        .init_sliced_find_path(start, ag.target_ref, &ag.npos, &ag.target_pos, filter)
        .and_then(|_| nav_query.update_sliced_find_path(QUICK_SEARCH_ITERS))
        .and_then(|_| {
            if ag.target_replan {
                nav_query.finalize_sliced_find_path_partial(ag.corridor.get_path(), QUICK_SEARCH_MAX_PATH)
            } else {
                nav_query.finalize_sliced_find_path(QUICK_SEARCH_MAX_PATH)
            }
        });

    let mut req_path = match found {
        Ok(path) => path,
        Err(e) => {
            log::debug!("{} quick search failed: {}", ag.handle, e);
            Vec::new()
        }
    };

    let mut req_pos = ag.target_pos;
    if let Some(&last) = req_path.last() {
        if last != ag.target_ref {
            match nav_query.closest_point_on_poly(last, &ag.target_pos) {
                Ok((pt, _)) => req_pos = pt,
                Err(_) => req_path.clear(),
            }
        }
    }

    if req_path.is_empty() {
        req_pos = ag.npos;
        req_path.push(start);
    }

    ag.corridor.set_corridor(&req_pos, &req_path);
    ag.boundary.reset();
    ag.partial = false;

    if req_path.last() == Some(&ag.target_ref) {
        ag.target_state = MoveRequestState::Valid;
        ag.target_replan_time = 0.0;
    } else {
        ag.target_state = MoveRequestState::WaitingForQueue;
    }
    Ok(())
}

/// Splices a path queue result onto the corridor the agent followed while waiting.
fn apply_path_result(
    ag: &mut CrowdAgent,
    status: Status,
    mut res: Vec<PolyRef>,
    max_path_result: usize,
    nav_query: &NavMeshQuery,
) -> Result<()> {
    let npath = ag.corridor.get_path_count();
    if npath == 0 {
        return Err(Error::Invariant(format!("{} received a path with an empty corridor", ag.handle)));
    }

    let mut target_pos = ag.target_pos;
    let mut valid = !status.is_failure() && !res.is_empty();
    ag.partial = status.is_partial();

    if valid && res.first() != Some(&ag.corridor.get_last_poly()) {
        valid = false;
    }

    if valid {
        if npath > 1 {
            let mut merged = Vec::with_capacity(npath - 1 + res.len());
            merged.extend_from_slice(&ag.corridor.get_path()[..npath - 1]);
            merged.append(&mut res);
            merged.truncate(max_path_result);
            remove_backtracks(&mut merged);
            res = merged;
        }

        if let Some(&last) = res.last() {
            if last != ag.target_ref {
                match nav_query.closest_point_on_poly(last, &target_pos) {
                    Ok((pt, _)) => target_pos = pt,
                    Err(_) => valid = false,
                }
            }
        }
    }

    if valid {
        ag.corridor.set_corridor(&target_pos, &res);
        ag.boundary.reset();
        ag.target_state = MoveRequestState::Valid;
    } else {
        ag.target_state = MoveRequestState::Failed;
        log::debug!("{} could not use its path result ({})", ag.handle, status);
    }
    ag.target_replan_time = 0.0;
    Ok(())
}

/// Removes `a, b, a` detours left where a queued result meets the old corridor
fn remove_backtracks(path: &mut Vec<PolyRef>) {
    let mut j = 1;
    while j + 1 < path.len() {
        if path[j - 1] == path[j + 1] {
            path.drain(j - 1..j + 1);
            j = j.saturating_sub(1).max(1);
        } else {
            j += 1;
        }
    }
}

fn calc_steering(ag: &mut CrowdAgent, positions: &[[f32; 3]]) {
    let mut dvel = match ag.target_state {
        MoveRequestState::None => return,
        MoveRequestState::Velocity => {
            ag.desired_speed = vlen(&ag.target_pos);
            ag.target_pos
        }
        _ => {
            let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                ag.calc_smooth_steer_direction()
            } else {
                ag.calc_straight_steer_direction()
            };
            ag.desired_speed = ag.calc_desired_speed();
            vscale(&dir, ag.desired_speed)
        }
    };

    if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
        let separation_dist = ag.params.collision_query_range;
        let inv_separation_dist = 1.0 / separation_dist;
        let separation_weight = ag.params.separation_weight;

        let mut w = 0.0;
        let mut disp = [0.0; 3];
        for nei in &ag.neighbours {
            let mut diff = vsub(&ag.npos, &positions[nei.idx]);
            diff[1] = 0.0;
            let dist_sqr = vlen_sqr(&diff);
            if dist_sqr < 0.00001 || dist_sqr > sqr(separation_dist) {
                continue;
            }
            let dist = dist_sqr.sqrt();
            let weight = separation_weight * (1.0 - sqr(dist * inv_separation_dist));
            disp = vmad(&disp, &diff, weight / dist);
            w += 1.0;
        }

        if w > 0.0001 {
            dvel = vmad(&dvel, &disp, 1.0 / w);
            let speed_sqr = vlen_sqr(&dvel);
            let desired_sqr = sqr(ag.desired_speed);
            if speed_sqr > desired_sqr {
                dvel = vscale(&dvel, (desired_sqr / speed_sqr).sqrt());
            }
        }
    }

    ag.dvel = dvel;
}

fn calc_avoidance(
    ag: &mut CrowdAgent,
    query: &mut ObstacleAvoidanceQuery,
    snapshot: &[KinematicSnapshot],
    params: &ObstacleAvoidanceParams,
    debug: Option<&mut ObstacleAvoidanceDebugData>,
) -> usize {
    query.reset();

    for nei in &ag.neighbours {
        let other = &snapshot[nei.idx];
        query.add_circle(&other.npos, other.radius, &other.vel, &other.dvel);
    }

    for j in 0..ag.boundary.get_segment_count() {
        let Some(s) = ag.boundary.get_segment(j) else {
            continue;
        };
        let p = [s[0], s[1], s[2]];
        let q = [s[3], s[4], s[5]];
        // Only walls the agent is in front of
        if tri_area_2d(&ag.npos, &p, &q) < 0.0 {
            continue;
        }
        query.add_segment(&p, &q);
    }

    let (nvel, ns) = query.sample_velocity(
        &ag.npos,
        ag.params.radius,
        ag.desired_speed,
        &ag.vel,
        &ag.dvel,
        params,
        debug,
    );
    ag.nvel = nvel;
    ns
}

/// Runs `f` over the agents split into contiguous chunks, one rayon task per chunk.
/// `f` receives the agent's slot index and the chunk's avoidance query.
fn for_each_agent_chunk<F>(
    agents: &mut [CrowdAgent],
    queries: &mut [ObstacleAvoidanceQuery],
    workers: usize,
    f: F,
) where
    F: Fn(usize, &mut CrowdAgent, &mut ObstacleAvoidanceQuery) + Sync,
{
    if agents.is_empty() {
        return;
    }
    let chunk_size = agents.len().div_ceil(workers.max(1));
    let f = &f;

    rayon::scope(|s| {
        for (ci, (chunk, query)) in agents.chunks_mut(chunk_size).zip(queries.iter_mut()).enumerate() {
            s.spawn(move |_| {
                let base = ci * chunk_size;
                for (k, ag) in chunk.iter_mut().enumerate() {
                    f(base + k, ag, query);
                }
            });
        }
    });
}

fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    let span = t1 - t0;
    if span <= f32::EPSILON {
        return 1.0;
    }
    ((t - t0) / span).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{create_grid_mesh, create_open_square};
    use navcrowd_mesh::PolyFlags;

    fn params() -> AgentParams {
        AgentParams {
            radius: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let mesh = create_open_square(5.0);
        let invalid = [
            CrowdConfig {
                max_agents: 0,
                ..Default::default()
            },
            CrowdConfig {
                max_agent_radius: 0.0,
                ..Default::default()
            },
            CrowdConfig {
                max_parallelism: 0,
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(matches!(Crowd::new(&mesh, config), Err(Error::InvalidParam(_))));
        }
        assert!(Crowd::new(&mesh, CrowdConfig::default()).is_ok());
    }

    #[test]
    fn test_add_agent_snaps_to_mesh() -> Result<()> {
        let mesh = create_open_square(5.0);
        let mut crowd = Crowd::new(&mesh, CrowdConfig::default())?;

        let h = crowd.add_agent(&[1.0, 0.5, 1.0], params())?;
        let ag = crowd.get_agent(h).unwrap();
        assert_eq!(ag.get_state(), CrowdAgentState::Walking);
        assert_eq!(ag.get_position()[1], 0.0);
        assert_eq!(ag.get_corridor().get_path_count(), 1);

        // Far outside the mesh
        let off = crowd.add_agent(&[50.0, 0.0, 50.0], params())?;
        let ag = crowd.get_agent(off).unwrap();
        assert_eq!(ag.get_state(), CrowdAgentState::Invalid);
        assert_eq!(ag.get_corridor().get_path_count(), 0);
        Ok(())
    }

    #[test]
    fn test_capacity_and_param_errors() -> Result<()> {
        let mesh = create_open_square(5.0);
        let config = CrowdConfig {
            max_agents: 2,
            ..Default::default()
        };
        let mut crowd = Crowd::new(&mesh, config)?;
        crowd.add_agent(&[0.0; 3], params())?;
        crowd.add_agent(&[1.0, 0.0, 0.0], params())?;
        assert!(matches!(crowd.add_agent(&[2.0, 0.0, 0.0], params()), Err(Error::Crowd(_))));

        let mesh = create_open_square(5.0);
        let mut crowd = Crowd::new(&mesh, CrowdConfig::default())?;
        let bad = AgentParams {
            radius: -1.0,
            ..Default::default()
        };
        assert!(matches!(crowd.add_agent(&[0.0; 3], bad), Err(Error::InvalidParam(_))));
        let bad = AgentParams {
            query_filter_type: MAX_QUERY_FILTER_TYPE as u8,
            ..Default::default()
        };
        assert!(matches!(crowd.add_agent(&[0.0; 3], bad), Err(Error::InvalidParam(_))));
        Ok(())
    }

    #[test]
    fn test_radius_above_config_limit_is_rejected() -> Result<()> {
        let mesh = create_open_square(5.0);
        let config = CrowdConfig {
            max_agent_radius: 0.5,
            ..Default::default()
        };
        let mut crowd = Crowd::new(&mesh, config)?;
        let wide = AgentParams {
            radius: 0.75,
            ..Default::default()
        };
        assert!(matches!(crowd.add_agent(&[0.0; 3], wide.clone()), Err(Error::InvalidParam(_))));
        assert_eq!(crowd.get_agent_count(), 0);

        // Exactly at the limit is fine
        let h = crowd.add_agent(&[0.0; 3], params())?;
        assert!(!crowd.update_agent_parameters(h, wide));
        assert_eq!(crowd.get_agent(h).unwrap().get_params().radius, 0.5);
        Ok(())
    }

    #[test]
    fn test_failed_queue_request_returns_to_requesting() -> Result<()> {
        let mesh = create_grid_mesh(40, 1, 1.0);
        let config = CrowdConfig {
            path_queue_iterations: 5,
            ..Default::default()
        };
        let mut crowd = Crowd::new(&mesh, config)?;
        let h = crowd.add_agent(&[0.5, 0.0, 0.5], params())?;
        crowd.request_move_target(h, PolyRef::new(40), &[39.5, 0.0, 0.5]);
        crowd.update(1.0 / 60.0, None)?;
        let slot = crowd.slot(h).unwrap();
        assert_eq!(crowd.agents[slot].target_state, MoveRequestState::WaitingForPath);

        // A handle the queue no longer knows reports failure
        crowd.agents[slot].target_path_queue_ref = None;
        crowd.agents[slot].target_replan_time = 3.0;
        crowd.update_move_requests()?;
        let ag = &crowd.agents[slot];
        assert_eq!(ag.target_state, MoveRequestState::Requesting);
        assert_eq!(ag.target_replan_time, 0.0);
        assert!(ag.target_path_queue_ref.is_none());

        // The retry goes through the quick search and the queue again
        for _ in 0..60 {
            crowd.update(1.0 / 60.0, None)?;
        }
        let ag = crowd.get_agent(h).unwrap();
        assert_eq!(ag.get_target_state(), MoveRequestState::Valid);
        assert_eq!(ag.get_corridor().get_last_poly(), PolyRef::new(40));
        Ok(())
    }

    #[test]
    fn test_failed_request_without_target_fails() -> Result<()> {
        let mesh = create_grid_mesh(40, 1, 1.0);
        let config = CrowdConfig {
            path_queue_iterations: 5,
            ..Default::default()
        };
        let mut crowd = Crowd::new(&mesh, config)?;
        let h = crowd.add_agent(&[0.5, 0.0, 0.5], params())?;
        crowd.request_move_target(h, PolyRef::new(40), &[39.5, 0.0, 0.5]);
        crowd.update(1.0 / 60.0, None)?;
        let slot = crowd.slot(h).unwrap();

        crowd.agents[slot].target_path_queue_ref = None;
        crowd.agents[slot].target_ref = PolyRef::NULL;
        crowd.update_move_requests()?;
        assert_eq!(crowd.agents[slot].target_state, MoveRequestState::Failed);
        Ok(())
    }

    #[test]
    fn test_invalid_corridor_is_trimmed_before_replan() -> Result<()> {
        let mut mesh = create_grid_mesh(10, 1, 1.0);
        mesh.set_poly_flags(PolyRef::new(8), PolyFlags::WALK | PolyFlags::SWIM)?;
        let mut crowd = Crowd::new(&mesh, CrowdConfig::default())?;
        let h = crowd.add_agent(&[0.5, 0.0, 0.5], params())?;
        crowd.request_move_target(h, PolyRef::new(10), &[9.5, 0.0, 0.5]);
        crowd.update(1.0 / 60.0, None)?;
        assert_eq!(crowd.get_agent(h).unwrap().get_corridor().get_last_poly(), PolyRef::new(10));

        if let Some(filter) = crowd.get_filter_mut(0) {
            filter.set_exclude_flags(PolyFlags::SWIM | PolyFlags::DISABLED);
        }
        crowd.check_path_validity(1.0 / 60.0);

        let ag = crowd.get_agent(h).unwrap();
        let kept: Vec<PolyRef> = (1..=7).map(PolyRef::new).collect();
        assert_eq!(ag.get_corridor().get_path(), &kept[..]);
        assert!((ag.get_corridor().get_target()[0] - 7.0).abs() < 1e-4);
        assert_eq!(ag.get_target_state(), MoveRequestState::Requesting);
        assert!(ag.target_replan);

        crowd.update(1.0 / 60.0, None)?;
        let ag = crowd.get_agent(h).unwrap();
        assert!(!ag.get_corridor().get_path().contains(&PolyRef::new(8)));
        Ok(())
    }

    #[test]
    fn test_remove_agent_reindexes() -> Result<()> {
        let mesh = create_open_square(5.0);
        let mut crowd = Crowd::new(&mesh, CrowdConfig::default())?;
        let a = crowd.add_agent(&[-2.0, 0.0, 0.0], params())?;
        let b = crowd.add_agent(&[0.0, 0.0, 0.0], params())?;
        let c = crowd.add_agent(&[2.0, 0.0, 0.0], params())?;

        assert!(crowd.remove_agent(b));
        assert!(!crowd.remove_agent(b));
        assert_eq!(crowd.get_agent_count(), 2);
        assert!(crowd.get_agent(b).is_none());
        assert_eq!(crowd.get_agent(a).unwrap().get_position()[0], -2.0);
        assert_eq!(crowd.get_agent(c).unwrap().get_position()[0], 2.0);
        assert_eq!(crowd.get_agents()[1].get_handle(), c);

        // Handles are not reused
        let d = crowd.add_agent(&[0.0; 3], params())?;
        assert_ne!(d, b);
        crowd.update(0.1, None)?;
        Ok(())
    }

    #[test]
    fn test_move_requests() -> Result<()> {
        let mesh = create_grid_mesh(4, 4, 1.0);
        let mut crowd = Crowd::new(&mesh, CrowdConfig::default())?;
        let h = crowd.add_agent(&[0.5, 0.0, 0.5], params())?;

        assert!(!crowd.request_move_target(h, PolyRef::NULL, &[3.5, 0.0, 3.5]));
        assert!(crowd.request_move_target(h, PolyRef::new(16), &[3.5, 0.0, 3.5]));
        assert_eq!(crowd.get_agent(h).unwrap().get_target_state(), MoveRequestState::Requesting);

        assert!(crowd.request_move_velocity(h, &[1.0, 0.0, 0.0]));
        assert_eq!(crowd.get_agent(h).unwrap().get_target_state(), MoveRequestState::Velocity);

        assert!(crowd.reset_move_target(h));
        let ag = crowd.get_agent(h).unwrap();
        assert_eq!(ag.get_target_state(), MoveRequestState::None);
        assert_eq!(ag.get_target_ref(), PolyRef::NULL);

        assert!(crowd.remove_agent(h));
        assert!(!crowd.request_move_velocity(h, &[1.0, 0.0, 0.0]));
        assert!(!crowd.set_agent_position(h, &[0.0; 3]));
        Ok(())
    }

    #[test]
    fn test_quick_search_reaches_nearby_target() -> Result<()> {
        let mesh = create_grid_mesh(4, 1, 1.0);
        let mut crowd = Crowd::new(&mesh, CrowdConfig::default())?;
        let h = crowd.add_agent(&[0.5, 0.0, 0.5], params())?;
        crowd.request_move_target(h, PolyRef::new(4), &[3.5, 0.0, 0.5]);
        crowd.update(1.0 / 60.0, None)?;

        let ag = crowd.get_agent(h).unwrap();
        assert_eq!(ag.get_target_state(), MoveRequestState::Valid);
        assert_eq!(ag.get_corridor().get_last_poly(), PolyRef::new(4));
        assert_eq!(ag.get_corridor().get_target(), &[3.5, 0.0, 0.5]);
        Ok(())
    }

    #[test]
    fn test_slot_accessors() -> Result<()> {
        let mesh = create_open_square(5.0);
        let mut crowd = Crowd::new(&mesh, CrowdConfig::default())?;
        assert!(crowd.get_obstacle_avoidance_params(MAX_OBSTACLE_AVOIDANCE_PARAMS).is_none());
        assert!(!crowd.set_obstacle_avoidance_params(MAX_OBSTACLE_AVOIDANCE_PARAMS, Default::default()));

        let p = ObstacleAvoidanceParams {
            adaptive_depth: 2,
            ..Default::default()
        };
        assert!(crowd.set_obstacle_avoidance_params(3, p));
        assert_eq!(crowd.get_obstacle_avoidance_params(3).unwrap().adaptive_depth, 2);

        assert!(crowd.get_filter(MAX_QUERY_FILTER_TYPE - 1).is_some());
        assert!(crowd.get_filter_mut(MAX_QUERY_FILTER_TYPE).is_none());
        let r = CrowdConfig::default().max_agent_radius;
        assert_eq!(crowd.get_query_half_extents(), &[r * 2.0, r * 1.5, r * 2.0]);
        Ok(())
    }

    #[test]
    fn test_remove_backtracks() {
        let r = PolyRef::new;
        let mut path = vec![r(1), r(2), r(1), r(3)];
        remove_backtracks(&mut path);
        assert_eq!(path, vec![r(1), r(3)]);

        let mut path = vec![r(5), r(1), r(2), r(1), r(2), r(3)];
        remove_backtracks(&mut path);
        assert_eq!(path, vec![r(5), r(1), r(2), r(3)]);

        let mut path = vec![r(1), r(2), r(3)];
        remove_backtracks(&mut path);
        assert_eq!(path, vec![r(1), r(2), r(3)]);
    }

    #[test]
    fn test_queued_requests_prefer_oldest_replan() {
        let mut heap = BinaryHeap::new();
        heap.push(QueuedRequest { slot: 0, replan_time: 0.5 });
        heap.push(QueuedRequest { slot: 1, replan_time: 2.0 });
        heap.push(QueuedRequest { slot: 2, replan_time: 1.0 });
        let order: Vec<usize> = std::iter::from_fn(|| heap.pop().map(|r| r.slot)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_tween() {
        assert_eq!(tween(0.5, 0.0, 1.0), 0.5);
        assert_eq!(tween(2.0, 0.0, 1.0), 1.0);
        assert_eq!(tween(-1.0, 0.0, 1.0), 0.0);
        assert_eq!(tween(0.0, 0.0, 0.0), 1.0);
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_config_from_partial_json() -> std::result::Result<(), serde_json::Error> {
        let config: CrowdConfig =
            serde_json::from_str(r#"{ "max_agents": 32, "off_mesh_trigger": "All" }"#)?;
        assert_eq!(config.max_agents, 32);
        assert_eq!(config.off_mesh_trigger, OffMeshTrigger::All);
        assert_eq!(config.max_path_result, CrowdConfig::default().max_path_result);

        let text = serde_json::to_string(&config)?;
        assert_eq!(serde_json::from_str::<CrowdConfig>(&text)?, config);
        Ok(())
    }
}
