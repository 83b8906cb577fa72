//! JSON scenario files: a grid navmesh, crowd settings and a list of agents

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use navcrowd::{AgentHandle, AgentParams, Crowd, CrowdAgentState, CrowdConfig, UpdateFlags};
use navcrowd_mesh::{NavMesh, NavMeshBuilder, NavMeshQuery, PolyFlags, QueryFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub mesh: MeshSpec,
    #[serde(default)]
    pub config: CrowdConfig,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// Flat grid of square cells with optional off-mesh links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSpec {
    #[serde(default)]
    pub origin: [f32; 3],
    #[serde(default = "default_cell_size")]
    pub cell_size: f32,
    pub cols: usize,
    pub rows: usize,
    #[serde(default)]
    pub off_mesh_links: Vec<OffMeshSpec>,
}

fn default_cell_size() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffMeshSpec {
    pub start: [f32; 3],
    pub end: [f32; 3],
    #[serde(default = "default_link_radius")]
    pub radius: f32,
    #[serde(default)]
    pub bidirectional: bool,
}

fn default_link_radius() -> f32 {
    0.5
}

/// One agent. A `target` starts a path request, a `velocity` steers it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    pub position: [f32; 3],
    pub target: Option<[f32; 3]>,
    pub velocity: Option<[f32; 3]>,
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    pub collision_query_range: f32,
    pub path_optimization_range: f32,
    pub separation_weight: f32,
    /// Raw `UpdateFlags` bits, all behaviours when absent
    pub update_flags: Option<u8>,
    pub obstacle_avoidance_type: u8,
    pub query_filter_type: u8,
    pub auto_traverse_off_mesh_link: bool,
}

impl Default for AgentSpec {
    fn default() -> Self {
        let params = AgentParams::default();
        Self {
            position: [0.0; 3],
            target: None,
            velocity: None,
            radius: params.radius,
            height: params.height,
            max_acceleration: params.max_acceleration,
            max_speed: params.max_speed,
            collision_query_range: params.collision_query_range,
            path_optimization_range: params.path_optimization_range,
            separation_weight: params.separation_weight,
            update_flags: None,
            obstacle_avoidance_type: params.obstacle_avoidance_type,
            query_filter_type: params.query_filter_type,
            auto_traverse_off_mesh_link: params.auto_traverse_off_mesh_link,
        }
    }
}

impl AgentSpec {
    pub fn params(&self) -> AgentParams {
        AgentParams {
            radius: self.radius,
            height: self.height,
            max_acceleration: self.max_acceleration,
            max_speed: self.max_speed,
            collision_query_range: self.collision_query_range,
            path_optimization_range: self.path_optimization_range,
            separation_weight: self.separation_weight,
            update_flags: self
                .update_flags
                .map(UpdateFlags::from_bits_truncate)
                .unwrap_or_default(),
            obstacle_avoidance_type: self.obstacle_avoidance_type,
            query_filter_type: self.query_filter_type,
            auto_traverse_off_mesh_link: self.auto_traverse_off_mesh_link,
        }
    }
}

/// Agent state captured after a tick
#[derive(Debug, Clone, Serialize)]
pub struct AgentFrame {
    pub id: u32,
    pub state: String,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
}

#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub tick: usize,
    pub time: f32,
    pub agents: Vec<AgentFrame>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario: {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid scenario: {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(text)?;
        if scenario.mesh.cols == 0 || scenario.mesh.rows == 0 {
            bail!("mesh needs at least one cell");
        }
        if scenario.mesh.cell_size <= 0.0 {
            bail!("mesh cell size must be positive");
        }
        Ok(scenario)
    }

    pub fn build_mesh(&self) -> Result<NavMesh> {
        let m = &self.mesh;
        let mut builder = NavMeshBuilder::grid(m.origin, m.cell_size, m.cols, m.rows);
        for link in &m.off_mesh_links {
            builder.add_off_mesh_connection(
                link.start,
                link.end,
                link.radius,
                link.bidirectional,
                PolyFlags::JUMP,
                0,
            );
        }
        builder.build().map_err(|e| anyhow!("Failed to build navigation mesh: {e}"))
    }

    /// Adds every agent to `crowd` and issues its initial move request.
    pub fn populate(&self, crowd: &mut Crowd) -> Result<Vec<AgentHandle>> {
        let query = NavMeshQuery::new(crowd.get_nav_mesh());
        let filter = QueryFilter::default();
        let half_extents = *crowd.get_query_half_extents();

        let mut handles = Vec::with_capacity(self.agents.len());
        for (i, spec) in self.agents.iter().enumerate() {
            let handle = crowd
                .add_agent(&spec.position, spec.params())
                .map_err(|e| anyhow!("Agent {i}: {e}"))?;

            if let Some(target) = spec.target {
                let (target_ref, target_pos) = query
                    .find_nearest_poly(&target, &half_extents, &filter)
                    .map_err(|e| anyhow!("Agent {i} target: {e}"))?;
                if !crowd.request_move_target(handle, target_ref, &target_pos) {
                    log::warn!("Agent {i} target {:?} is not on the mesh", target);
                }
            } else if let Some(vel) = spec.velocity {
                crowd.request_move_velocity(handle, &vel);
            }
            handles.push(handle);
        }
        Ok(handles)
    }
}

pub fn capture_frame(crowd: &Crowd, tick: usize, time: f32) -> Frame {
    let agents = crowd
        .get_agents()
        .iter()
        .map(|ag| AgentFrame {
            id: ag.get_handle().id(),
            state: state_name(ag.get_state()).to_string(),
            position: *ag.get_position(),
            velocity: *ag.get_velocity(),
        })
        .collect();
    Frame { tick, time, agents }
}

fn state_name(state: CrowdAgentState) -> &'static str {
    match state {
        CrowdAgentState::Invalid => "invalid",
        CrowdAgentState::Walking => "walking",
        CrowdAgentState::OffMesh => "offmesh",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "mesh": { "cols": 8, "rows": 4 },
        "config": { "max_agents": 8 },
        "agents": [
            { "position": [0.5, 0.0, 2.0], "target": [7.5, 0.0, 2.0] },
            { "position": [7.5, 0.0, 2.2], "target": [0.5, 0.0, 2.0], "max_speed": 2.0 },
            { "position": [4.0, 0.0, 0.5], "velocity": [0.0, 0.0, 1.0], "update_flags": 3 }
        ]
    }"#;

    #[test]
    fn test_parse_defaults() -> Result<()> {
        let scenario = Scenario::from_json(SCENARIO)?;
        assert_eq!(scenario.mesh.cell_size, 1.0);
        assert_eq!(scenario.config.max_agents, 8);
        assert_eq!(scenario.config.max_path_result, CrowdConfig::default().max_path_result);
        assert_eq!(scenario.agents.len(), 3);

        let second = scenario.agents[1].params();
        assert_eq!(second.max_speed, 2.0);
        assert_eq!(second.radius, AgentParams::default().radius);
        assert_eq!(second.update_flags, UpdateFlags::all());

        let third = scenario.agents[2].params();
        assert_eq!(
            third.update_flags,
            UpdateFlags::ANTICIPATE_TURNS | UpdateFlags::OBSTACLE_AVOIDANCE
        );
        Ok(())
    }

    #[test]
    fn test_rejects_empty_mesh() {
        let err = Scenario::from_json(r#"{ "mesh": { "cols": 0, "rows": 3 } }"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_populate_and_step() -> Result<()> {
        let scenario = Scenario::from_json(SCENARIO)?;
        let mesh = scenario.build_mesh()?;
        let mut crowd = Crowd::new(&mesh, scenario.config.clone())?;
        let handles = scenario.populate(&mut crowd)?;
        assert_eq!(handles.len(), 3);

        for _ in 0..30 {
            crowd.update(1.0 / 30.0, None)?;
        }
        let frame = capture_frame(&crowd, 30, 1.0);
        assert_eq!(frame.agents.len(), 3);
        assert!(frame.agents.iter().all(|a| a.state == "walking"));
        assert!(frame.agents[0].position[0] > 0.5);
        Ok(())
    }
}
