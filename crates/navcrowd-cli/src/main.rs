//! Command line driver for navcrowd: runs scenario files and quick demos

mod scenario;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use glam::Vec3;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use navcrowd::{Crowd, CrowdConfig};
use navcrowd_mesh::{NavMeshBuilder, NavMeshQuery, QueryFilter};

use scenario::{capture_frame, AgentSpec, Frame, MeshSpec, Scenario};

/// Crowd simulation on polygon navigation meshes
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario file and report where the agents ended up
    Simulate {
        /// Scenario file (JSON)
        #[clap(long, value_parser)]
        scenario: PathBuf,

        /// Number of updates to run
        #[clap(long, default_value = "600")]
        ticks: usize,

        /// Time step in seconds
        #[clap(long, default_value = "0.016666668")]
        dt: f32,

        /// Write recorded frames to this file as JSON
        #[clap(long, value_parser)]
        output: Option<PathBuf>,

        /// Record a frame every N ticks
        #[clap(long, default_value = "10")]
        record_every: usize,
    },

    /// Two groups of agents swapping sides on an open grid
    Demo {
        /// Agents per group
        #[clap(long, default_value = "8")]
        agents: usize,

        /// Number of updates to run
        #[clap(long, default_value = "900")]
        ticks: usize,

        /// Worker count for the kinematics phase
        #[clap(long, default_value = "4")]
        parallelism: usize,
    },

    /// Find a path on a square grid mesh
    Path {
        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        start: Vec3,

        /// End position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        end: Vec3,

        /// Grid cells per side
        #[clap(long, default_value = "16")]
        size: usize,
    },
}

/// Parse a comma-separated vector
fn parse_vector(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();

    if parts.len() != 3 {
        return Err(format!("Vector must have 3 components, got {}", parts.len()));
    }

    let x = parts[0].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let y = parts[1].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let z = parts[2].trim().parse::<f32>().map_err(|e| e.to_string())?;

    Ok(Vec3::new(x, y, z))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Commands::Simulate {
            scenario,
            ticks,
            dt,
            output,
            record_every,
        } => simulate(&scenario, ticks, dt, output.as_deref(), record_every),
        Commands::Demo {
            agents,
            ticks,
            parallelism,
        } => demo(agents, ticks, parallelism),
        Commands::Path { start, end, size } => find_path(start, end, size),
    }
}

/// Run a scenario file
fn simulate(path: &Path, ticks: usize, dt: f32, output: Option<&Path>, record_every: usize) -> Result<()> {
    if dt <= 0.0 {
        bail!("Time step must be positive");
    }

    let scenario = Scenario::load(path)?;
    let frames = run(&scenario, ticks, dt, record_every.max(1))?;

    if let Some(output_path) = output {
        let file = File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &frames)?;
        writer.flush()?;
        log::info!("Wrote {} frames to {}", frames.len(), output_path.display());
    }

    if let Some(last) = frames.last() {
        print_frame(last);
    }
    Ok(())
}

fn run(scenario: &Scenario, ticks: usize, dt: f32, record_every: usize) -> Result<Vec<Frame>> {
    let mesh = scenario.build_mesh()?;
    log::info!(
        "Navigation mesh: {} polygons, {} agents",
        mesh.poly_count(),
        scenario.agents.len()
    );

    let mut crowd = Crowd::new(&mesh, scenario.config.clone())
        .map_err(|e| anyhow!("Failed to create crowd: {e}"))?;
    scenario.populate(&mut crowd)?;

    let mut frames = vec![capture_frame(&crowd, 0, 0.0)];
    for tick in 1..=ticks {
        crowd.update(dt, None).map_err(|e| anyhow!("Update {tick} failed: {e}"))?;
        if tick % record_every == 0 || tick == ticks {
            frames.push(capture_frame(&crowd, tick, tick as f32 * dt));
        }
    }
    Ok(frames)
}

fn print_frame(frame: &Frame) {
    println!("After {} ticks ({:.2}s):", frame.tick, frame.time);
    for agent in &frame.agents {
        println!(
            "  agent#{} {:<8} pos {:>7.2},{:>7.2},{:>7.2}  vel {:>6.2},{:>6.2},{:>6.2}",
            agent.id,
            agent.state,
            agent.position[0],
            agent.position[1],
            agent.position[2],
            agent.velocity[0],
            agent.velocity[1],
            agent.velocity[2]
        );
    }
}

/// Run the built-in crossing demo
fn demo(agents: usize, ticks: usize, parallelism: usize) -> Result<()> {
    let rows = (agents as f32 * 1.5 + 2.0).ceil() as usize;
    let mut specs = Vec::with_capacity(agents * 2);
    for i in 0..agents {
        let z = 1.0 + i as f32 * 1.5;
        specs.push(AgentSpec {
            position: [1.0, 0.0, z],
            target: Some([19.0, 0.0, z]),
            ..Default::default()
        });
        specs.push(AgentSpec {
            position: [19.0, 0.0, z + 0.5],
            target: Some([1.0, 0.0, z]),
            ..Default::default()
        });
    }

    let scenario = Scenario {
        mesh: MeshSpec {
            origin: [0.0; 3],
            cell_size: 1.0,
            cols: 20,
            rows,
            off_mesh_links: Vec::new(),
        },
        config: CrowdConfig {
            max_agents: specs.len().max(1),
            max_parallelism: parallelism.max(1),
            ..Default::default()
        },
        agents: specs,
    };

    let frames = run(&scenario, ticks, 1.0 / 60.0, ticks.max(1))?;
    if let Some(last) = frames.last() {
        print_frame(last);
    }
    Ok(())
}

/// Find a path on a grid mesh
fn find_path(start: Vec3, end: Vec3, size: usize) -> Result<()> {
    if size == 0 {
        bail!("Grid size must be at least 1");
    }
    let mesh = NavMeshBuilder::grid([0.0; 3], 1.0, size, size)
        .build()
        .map_err(|e| anyhow!("Failed to build navigation mesh: {e}"))?;

    let mut query = NavMeshQuery::new(&mesh);
    let filter = QueryFilter::default();
    let ext = [2.0, 4.0, 2.0];

    let start_pos = start.to_array();
    let end_pos = end.to_array();

    let (start_ref, closest_start) = query
        .find_nearest_poly(&start_pos, &ext, &filter)
        .map_err(|e| anyhow!("Failed to find start polygon: {e}"))?;
    let (end_ref, closest_end) = query
        .find_nearest_poly(&end_pos, &ext, &filter)
        .map_err(|e| anyhow!("Failed to find end polygon: {e}"))?;
    if !start_ref.is_valid() || !end_ref.is_valid() {
        bail!("Start or end position is off the mesh");
    }

    let path = query
        .find_path(start_ref, end_ref, &closest_start, &closest_end, &filter, 256)
        .map_err(|e| anyhow!("Failed to find path: {e}"))?;
    log::info!("Found path with {} polygons", path.len());

    let straight = query
        .find_straight_path(&closest_start, &closest_end, &path, 64)
        .map_err(|e| anyhow!("Failed to find straight path: {e}"))?;

    println!("Path:");
    for (i, point) in straight.iter().enumerate() {
        println!("{}: {},{},{}", i, point.pos[0], point.pos[1], point.pos[2]);
    }
    Ok(())
}
