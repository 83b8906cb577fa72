//! Velocity-space obstacle avoidance
//!
//! `ObstacleAvoidanceQuery` scores candidate velocities against nearby agents
//! (circles) and walls (segments) and returns the candidate with the lowest penalty.
//! The obstacle lists are rebuilt before every query.

use navcrowd_common::{
    dist_2d, dist_point_segment_sqr_2d, perp_2d, sqr, tri_area_2d, vdot_2d, vnormalize,
    vnormalize_2d, vrotate_2d, vscale, vsub,
};

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

pub const MAX_PATTERN_DIVS: usize = 32;
pub const MAX_PATTERN_RINGS: usize = 4;

/// An agent treated as an obstacle
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleCircle {
    /// Position of the obstacle
    pub p: [f32; 3],
    /// Velocity of the obstacle
    pub vel: [f32; 3],
    /// Desired velocity of the obstacle
    pub dvel: [f32; 3],
    pub rad: f32,
    /// Direction from the querying agent to the obstacle, used for side selection
    pub dp: [f32; 3],
    /// Preferred passing side, perpendicular to `dp`
    pub np: [f32; 3],
}

/// A wall segment treated as an obstacle
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleSegment {
    pub p: [f32; 3],
    pub q: [f32; 3],
    /// The querying agent is touching the segment
    pub touch: bool,
}

/// Velocity sampling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum SampleMode {
    /// Regular grid of candidates
    Grid,
    /// Ring pattern refined around the best candidate
    #[default]
    Adaptive,
}

/// Obstacle avoidance weights and sampling resolution
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct ObstacleAvoidanceParams {
    /// How far the sampling centre is shifted towards the desired velocity [0, 1]
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    /// Time horizon for impact checks, in seconds
    pub horiz_time: f32,
    pub grid_size: u8,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
    pub sample_mode: SampleMode,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
            sample_mode: SampleMode::Adaptive,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    vel: [f32; 3],
    size: f32,
    pen: f32,
    vpen: f32,
    vcpen: f32,
    spen: f32,
    tpen: f32,
}

/// Per-sample penalties recorded during a query
#[derive(Debug, Clone, Default)]
pub struct ObstacleAvoidanceDebugData {
    samples: Vec<Sample>,
    max_samples: usize,
}

impl ObstacleAvoidanceDebugData {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_sample(
        &mut self,
        vel: &[f32; 3],
        size: f32,
        pen: f32,
        vpen: f32,
        vcpen: f32,
        spen: f32,
        tpen: f32,
    ) {
        if self.samples.len() >= self.max_samples {
            return;
        }
        self.samples.push(Sample {
            vel: *vel,
            size,
            pen,
            vpen,
            vcpen,
            spen,
            tpen,
        });
    }

    /// Rescales every penalty channel to [0, 1]
    pub fn normalize_samples(&mut self) {
        normalize_channel(&mut self.samples, |s| &mut s.pen);
        normalize_channel(&mut self.samples, |s| &mut s.vpen);
        normalize_channel(&mut self.samples, |s| &mut s.vcpen);
        normalize_channel(&mut self.samples, |s| &mut s.spen);
        normalize_channel(&mut self.samples, |s| &mut s.tpen);
    }

    pub fn get_sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn get_sample_velocity(&self, i: usize) -> Option<[f32; 3]> {
        self.samples.get(i).map(|s| s.vel)
    }

    pub fn get_sample_size(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.size)
    }

    pub fn get_sample_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.pen)
    }

    pub fn get_sample_desired_velocity_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.vpen)
    }

    pub fn get_sample_current_velocity_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.vcpen)
    }

    pub fn get_sample_preferred_side_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.spen)
    }

    pub fn get_sample_collision_time_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.tpen)
    }
}

fn normalize_channel(samples: &mut [Sample], channel: impl Fn(&mut Sample) -> &mut f32) {
    if samples.is_empty() {
        return;
    }
    let mut min_pen = f32::MAX;
    let mut max_pen = f32::MIN;
    for s in samples.iter_mut() {
        let v = *channel(s);
        min_pen = min_pen.min(v);
        max_pen = max_pen.max(v);
    }
    let pen_range = max_pen - min_pen;
    let s = if pen_range > 0.001 { 1.0 / pen_range } else { 1.0 };
    for sample in samples.iter_mut() {
        let v = channel(sample);
        *v = ((*v - min_pen) * s).clamp(0.0, 1.0);
    }
}

/// Obstacle avoidance query. One instance per worker thread.
#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,
    max_circles: usize,
    circles: Vec<ObstacleCircle>,
    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    pub fn add_circle(&mut self, pos: &[f32; 3], rad: f32, vel: &[f32; 3], dvel: &[f32; 3]) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: *pos,
            vel: *vel,
            dvel: *dvel,
            rad,
            dp: [0.0; 3],
            np: [0.0; 3],
        });
    }

    pub fn add_segment(&mut self, p: &[f32; 3], q: &[f32; 3]) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment {
            p: *p,
            q: *q,
            touch: false,
        });
    }

    pub fn get_obstacle_circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn get_obstacle_circle(&self, i: usize) -> Option<&ObstacleCircle> {
        self.circles.get(i)
    }

    pub fn get_obstacle_segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn get_obstacle_segment(&self, i: usize) -> Option<&ObstacleSegment> {
        self.segments.get(i)
    }

    /// Samples with the strategy selected in `params`
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> ([f32; 3], usize) {
        match params.sample_mode {
            SampleMode::Grid => self.sample_velocity_grid(pos, rad, vmax, vel, dvel, params, debug),
            SampleMode::Adaptive => {
                self.sample_velocity_adaptive(pos, rad, vmax, vel, dvel, params, debug)
            }
        }
    }

    /// Evaluates a regular grid of candidates around the biased desired velocity.
    /// Returns the best velocity and the number of samples evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_grid(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> ([f32; 3], usize) {
        self.prepare(pos, dvel);
        self.set_params(params, vmax);

        if let Some(d) = debug.as_deref_mut() {
            d.reset();
        }

        let grid_size = params.grid_size.max(2) as f32;
        let cvx = dvel[0] * params.vel_bias;
        let cvz = dvel[2] * params.vel_bias;
        let cs = vmax * 2.0 * (1.0 - params.vel_bias) / (grid_size - 1.0);
        let half = (grid_size - 1.0) * cs * 0.5;

        let mut nvel = [0.0; 3];
        let mut min_penalty = f32::MAX;
        let mut ns = 0;

        for y in 0..params.grid_size.max(2) {
            for x in 0..params.grid_size.max(2) {
                let vcand = [cvx + x as f32 * cs - half, 0.0, cvz + y as f32 * cs - half];
                if sqr(vcand[0]) + sqr(vcand[2]) > sqr(vmax + cs / 2.0) {
                    continue;
                }

                let penalty =
                    self.process_sample(&vcand, cs, pos, rad, vel, dvel, min_penalty, debug.as_deref_mut());
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    nvel = vcand;
                }
            }
        }

        (nvel, ns)
    }

    /// Refines a ring pattern aligned with the desired velocity around the best candidate,
    /// halving the pattern radius every round.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> ([f32; 3], usize) {
        self.prepare(pos, dvel);
        self.set_params(params, vmax);

        if let Some(d) = debug.as_deref_mut() {
            d.reset();
        }

        let pattern = build_pattern(dvel, params.adaptive_divs, params.adaptive_rings);

        let mut cr = vmax * (1.0 - params.vel_bias);
        let mut res = [dvel[0] * params.vel_bias, 0.0, dvel[2] * params.vel_bias];
        let mut ns = 0;

        for _ in 0..params.adaptive_depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = [0.0; 3];

            for p in &pattern {
                let vcand = [res[0] + p[0] * cr, 0.0, res[2] + p[1] * cr];
                if sqr(vcand[0]) + sqr(vcand[2]) > sqr(vmax + 0.001) {
                    continue;
                }

                let penalty = self.process_sample(
                    &vcand,
                    cr / 10.0,
                    pos,
                    rad,
                    vel,
                    dvel,
                    min_penalty,
                    debug.as_deref_mut(),
                );
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }

            res = bvel;
            cr *= 0.5;
        }

        (res, ns)
    }

    fn set_params(&mut self, params: &ObstacleAvoidanceParams, vmax: f32) {
        self.params = *params;
        self.inv_horiz_time = 1.0 / params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
    }

    fn prepare(&mut self, pos: &[f32; 3], dvel: &[f32; 3]) {
        let orig = [0.0; 3];
        for cir in &mut self.circles {
            cir.dp = vnormalize(&vsub(&cir.p, pos));
            let dv = vsub(&cir.dvel, dvel);
            cir.np = if tri_area_2d(&orig, &cir.dp, &dv) < 0.01 {
                [-cir.dp[2], 0.0, cir.dp[0]]
            } else {
                [cir.dp[2], 0.0, -cir.dp[0]]
            };
        }

        for seg in &mut self.segments {
            let (d, _) = dist_point_segment_sqr_2d(pos, &seg.p, &seg.q);
            seg.touch = d < sqr(0.01);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_sample(
        &self,
        vcand: &[f32; 3],
        cs: f32,
        pos: &[f32; 3],
        rad: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        min_penalty: f32,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> f32 {
        let params = &self.params;

        // Penalty for straying from the desired and current velocities
        let vpen = params.weight_des_vel * (dist_2d(vcand, dvel) * self.inv_vmax);
        let vcpen = params.weight_cur_vel * (dist_2d(vcand, vel) * self.inv_vmax);

        // Hit time below which this sample cannot beat the current best
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (params.weight_toi / min_pen - 0.1) * params.horiz_time;
        if t_threshold - params.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = params.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // Reciprocal relative velocity
            let vab = vsub(&vsub(&vscale(vcand, 2.0), vel), &cir.vel);

            side += (vdot_2d(&cir.dp, &vab) * 0.5 + 0.5)
                .min(vdot_2d(&cir.np, &vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, &vab, &cir.p, cir.rad) else {
                continue;
            };

            // Avoid more when already overlapping
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let mut htmin = if seg.touch {
                let sdir = vsub(&seg.q, &seg.p);
                let snorm = [-sdir[2], 0.0, sdir[0]];
                // Moving away from the wall
                if vdot_2d(&snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match intersect_ray_segment(pos, vcand, &seg.p, &seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Avoid less when facing walls
            htmin *= 2.0;

            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        // Normalize side bias so it does not dominate
        if nside > 0 {
            side /= nside as f32;
        }

        let spen = params.weight_side * side;
        let tpen = params.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));
        let penalty = vpen + vcpen + spen + tpen;

        if let Some(d) = debug {
            d.add_sample(vcand, cs, penalty, vpen, vcpen, spen, tpen);
        }

        penalty
    }
}

impl Default for ObstacleAvoidanceQuery {
    fn default() -> Self {
        Self::new(6, 8)
    }
}

/// Sample pattern: a zero sample, then `rings` rings of `divs` points, each ring
/// starting on the desired direction and alternately offset by half a division.
fn build_pattern(dvel: &[f32; 3], divs: u8, rings: u8) -> Vec<[f32; 2]> {
    let nd = (divs as usize).clamp(1, MAX_PATTERN_DIVS);
    let nr = (rings as usize).clamp(1, MAX_PATTERN_RINGS);
    let da = std::f32::consts::TAU / nd as f32;
    let (sa, ca) = da.sin_cos();

    let ddir = vnormalize_2d(dvel);
    let ddir_rotated = vrotate_2d(&ddir, da * 0.5);

    let rotate_cw = |v: [f32; 2]| [v[0] * ca + v[1] * sa, -v[0] * sa + v[1] * ca];
    let rotate_ccw = |v: [f32; 2]| [v[0] * ca - v[1] * sa, v[0] * sa + v[1] * ca];

    let mut pattern = Vec::with_capacity(nd * nr + 1);
    pattern.push([0.0, 0.0]);

    for j in 0..nr {
        let r = (nr - j) as f32 / nr as f32;
        let d = if j % 2 == 0 { ddir } else { ddir_rotated };
        let first = [d[0] * r, d[2] * r];
        pattern.push(first);

        let mut last_cw = first;
        let mut last_ccw = first;
        let mut i = 1;
        while i + 1 < nd {
            last_cw = rotate_cw(last_cw);
            last_ccw = rotate_ccw(last_ccw);
            pattern.push(last_cw);
            pattern.push(last_ccw);
            i += 2;
        }

        if nd % 2 == 0 {
            pattern.push(rotate_ccw(last_ccw));
        }
    }

    pattern
}

/// Sweep of circle `c0` moving with `v` against static circle `c1`. Returns the entry
/// and exit times in units of `v`.
fn sweep_circle_circle(c0: &[f32; 3], r0: f32, v: &[f32; 3], c1: &[f32; 3], r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;

    let s = vsub(c1, c0);
    let r = r0 + r1;
    let c = vdot_2d(&s, &s) - r * r;
    let a = vdot_2d(v, v);
    if a < EPS {
        // Not moving
        return None;
    }

    let b = vdot_2d(v, &s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }

    let inv_a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * inv_a, (b + rd) * inv_a))
}

/// Ray from `ap` along `u` against segment `bp..bq`. Returns the ray parameter.
fn intersect_ray_segment(ap: &[f32; 3], u: &[f32; 3], bp: &[f32; 3], bq: &[f32; 3]) -> Option<f32> {
    let v = vsub(bq, bp);
    let w = vsub(ap, bp);
    let d = perp_2d(u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(&v, &w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, &w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_on_query() -> ObstacleAvoidanceQuery {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        query.add_circle(&[2.0, 0.0, 0.0], 0.5, &[-1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]);
        query
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut query = ObstacleAvoidanceQuery::new(1, 1);
        query.add_circle(&[1.0, 0.0, 0.0], 0.5, &[0.0; 3], &[0.0; 3]);
        query.add_circle(&[2.0, 0.0, 0.0], 0.5, &[0.0; 3], &[0.0; 3]);
        query.add_segment(&[0.0; 3], &[1.0, 0.0, 0.0]);
        query.add_segment(&[0.0; 3], &[0.0, 0.0, 1.0]);
        assert_eq!(query.get_obstacle_circle_count(), 1);
        assert_eq!(query.get_obstacle_segment_count(), 1);
        query.reset();
        assert_eq!(query.get_obstacle_circle_count(), 0);
        assert_eq!(query.get_obstacle_segment_count(), 0);
    }

    #[test]
    fn test_free_space_keeps_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::default();
        let params = ObstacleAvoidanceParams::default();
        let dvel = [1.0, 0.0, 0.0];
        let (nvel, ns) = query.sample_velocity_grid(&[0.0; 3], 0.5, 1.0, &dvel, &dvel, &params, None);
        assert!(ns > 0);
        assert!(dist_2d(&nvel, &dvel) < 0.05);
    }

    #[test]
    fn test_grid_avoids_head_on_agent() {
        let mut query = head_on_query();
        let params = ObstacleAvoidanceParams::default();
        let dvel = [1.0, 0.0, 0.0];
        let (nvel, ns) = query.sample_velocity_grid(&[0.0; 3], 0.5, 1.0, &dvel, &dvel, &params, None);
        assert!(ns > 0);
        assert!(dist_2d(&nvel, &dvel) > 0.1);
    }

    #[test]
    fn test_adaptive_avoids_head_on_agent() {
        let mut query = head_on_query();
        let params = ObstacleAvoidanceParams::default();
        let dvel = [1.0, 0.0, 0.0];
        let (nvel, ns) =
            query.sample_velocity_adaptive(&[0.0; 3], 0.5, 1.0, &dvel, &dvel, &params, None);
        let max_samples = params.adaptive_depth as usize
            * (1 + params.adaptive_rings as usize * params.adaptive_divs as usize);
        assert!(ns > 0 && ns <= max_samples);
        assert!(dist_2d(&nvel, &dvel) > 0.1);
    }

    #[test]
    fn test_touching_wall_blocks_velocity_into_it() {
        let mut query = ObstacleAvoidanceQuery::default();
        query.add_segment(&[0.0, 0.0, -5.0], &[0.0, 0.0, 5.0]);
        let params = ObstacleAvoidanceParams {
            sample_mode: SampleMode::Grid,
            ..Default::default()
        };
        let dvel = [-1.0, 0.0, 0.0];
        let (nvel, _) = query.sample_velocity(&[0.0; 3], 0.5, 1.0, &dvel, &dvel, &params, None);
        assert!(query.get_obstacle_segment(0).unwrap().touch);
        assert!(nvel[0] > 0.0);
    }

    #[test]
    fn test_pattern_sizes() {
        let dvel = [1.0, 0.0, 0.0];
        assert_eq!(build_pattern(&dvel, 7, 2).len(), 1 + 2 * 7);
        assert_eq!(build_pattern(&dvel, 8, 2).len(), 1 + 2 * 8);
        assert_eq!(build_pattern(&dvel, 1, 1).len(), 2);

        // Every ring point lies on its ring radius
        for p in build_pattern(&dvel, 8, 2).iter().skip(1).take(8) {
            assert!(((p[0] * p[0] + p[1] * p[1]).sqrt() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_debug_samples_are_normalized() {
        let mut query = head_on_query();
        let params = ObstacleAvoidanceParams::default();
        let mut debug = ObstacleAvoidanceDebugData::new(512);
        let dvel = [1.0, 0.0, 0.0];
        query.sample_velocity_adaptive(&[0.0; 3], 0.5, 1.0, &dvel, &dvel, &params, Some(&mut debug));
        assert!(debug.get_sample_count() > 0);

        debug.normalize_samples();
        for i in 0..debug.get_sample_count() {
            let pen = debug.get_sample_penalty(i).unwrap();
            assert!((0.0..=1.0).contains(&pen));
            assert!(debug.get_sample_velocity(i).is_some());
        }
        assert!(debug.get_sample_penalty(debug.get_sample_count()).is_none());
    }
}
