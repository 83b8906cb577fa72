//! Multi-agent crowd simulation on navigation meshes
//!
//! A [`Crowd`] moves many agents across a shared [`NavMesh`](navcrowd_mesh::NavMesh).
//! Every agent follows a [`PathCorridor`] towards its target, steers around its
//! neighbours and nearby walls with velocity-space obstacle avoidance, and can cross
//! off-mesh connections such as jumps or ladders.
//!
//! # Example
//!
//! ```rust,ignore
//! use navcrowd::{AgentParams, Crowd, CrowdConfig};
//!
//! let mut crowd = Crowd::new(&nav_mesh, CrowdConfig::default())?;
//! let agent = crowd.add_agent(&[0.0, 0.0, 0.0], AgentParams::default())?;
//! crowd.request_move_target(agent, target_ref, &target_pos);
//!
//! for _ in 0..600 {
//!     crowd.update(1.0 / 60.0, None)?;
//! }
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: agent storage and the per-tick update pipeline
//! - [`PathCorridor`]: the polygon path an agent follows
//! - [`LocalBoundary`]: cached wall segments around an agent
//! - [`ObstacleAvoidanceQuery`]: sampled velocity selection against circles and walls
//! - [`ProximityGrid`]: spatial hash for neighbour lookups

pub mod crowd;
pub mod crowd_agent;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod proximity_grid;

#[cfg(test)]
mod test_mesh_helpers;

pub use crowd::{
    Crowd, CrowdAgentDebugInfo, CrowdConfig, OffMeshTrigger, MAX_OBSTACLE_AVOIDANCE_PARAMS,
    MAX_QUERY_FILTER_TYPE,
};
pub use crowd_agent::{
    AgentHandle, AgentParams, CrowdAgent, CrowdAgentAnimation, CrowdAgentState, CrowdNeighbour,
    MoveRequestState, UpdateFlags, MAX_CORNERS, MAX_NEIGHBOURS,
};
pub use local_boundary::LocalBoundary;
pub use obstacle_avoidance::{
    ObstacleAvoidanceDebugData, ObstacleAvoidanceParams, ObstacleAvoidanceQuery, ObstacleCircle,
    ObstacleSegment, SampleMode,
};
pub use path_corridor::{Corner, PathCorridor};
pub use proximity_grid::ProximityGrid;
