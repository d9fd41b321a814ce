//! Fluid scene: one compute context driving the particle simulation and the
//! surface extraction it feeds.
//!
//! A frame is `compute()` followed by any number of `draw(view_proj)` calls.
//! `release_resources()` tears every buffer down; it also runs on drop.

use kernel::{
    ComputeContext, ComputeDevice, ContextStats, Material, Particle, ParticleArena, ParticleSimulation,
    ParticleSnapshot, SurfaceExtraction, SurfaceSnapshot,
};

use crate::config::{ConfigError, SceneConfig};

/// Errors raised by a scene.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The compute layer failed.
    #[error(transparent)]
    Compute(#[from] kernel::Error),
    /// `release_resources` already ran.
    #[error("scene resources have been released")]
    Released,
}

/// Result alias for scene operations.
pub type Result<T> = std::result::Result<T, SceneError>;

struct Resources {
    simulation: ParticleSimulation,
    surface: SurfaceExtraction,
}

/// Statistics of one scene, for logs and the headless driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FrameStats {
    /// Frames computed so far.
    pub frame: u64,
    /// Live particles.
    pub particles: u32,
    /// Compacted surface vertices.
    pub surface_vertices: u32,
    /// Particles the surface grid dropped from full cells.
    pub cell_overflow: u32,
    /// Bin entries dropped from full bins.
    pub bukkit_overflow: u32,
    /// Batches submitted so far.
    pub submissions: u64,
    /// Dispatches and draws sized on the device so far.
    pub indirect_dispatches: u64,
}

/// Scene over a compute device.
pub struct FluidScene<D: ComputeDevice> {
    ctx: ComputeContext<D>,
    resources: Option<Resources>,
    frame: u64,
}

impl<D: ComputeDevice> FluidScene<D> {
    /// Build the scene described by `config` on `device`.
    pub fn new(device: D, config: &SceneConfig) -> Result<Self> {
        config.validate()?;
        let mut ctx =
            ComputeContext::new(device).with_policy(config.submit_policy, config.max_frames_in_flight);

        let params = config.simulation_params();
        let mut initial = ParticleArena::with_capacity(params.max_particles as usize);
        for block in &config.particles {
            for p in block.lattice() {
                initial.spawn(p, Particle::new(block.mass, block.material));
            }
        }
        let shapes = config.sim_shapes();
        tracing::info!(
            "Scene {}: {} initial particles, {} shapes",
            config.name,
            initial.enabled_count(),
            shapes.len()
        );

        let simulation = ParticleSimulation::new(&mut ctx, params, &initial, &shapes)?;
        let surface = SurfaceExtraction::new(&mut ctx, config.grid_constants())?;
        // Upload and pipeline creation finish before the first frame.
        ctx.flush()?;

        Ok(Self {
            ctx,
            resources: Some(Resources { simulation, surface }),
            frame: 0,
        })
    }

    /// Advance one frame: simulate, then extract the surface of the new
    /// particle positions.
    pub fn compute(&mut self) -> Result<()> {
        let res = self.resources.as_mut().ok_or(SceneError::Released)?;
        res.simulation.compute(&mut self.ctx)?;
        let max = res.simulation.params().max_particles;
        res.surface
            .compute(&mut self.ctx, res.simulation.positions(), max)?;
        self.ctx.end_frame()?;
        self.frame += 1;
        tracing::debug!("frame {} recorded", self.frame);
        Ok(())
    }

    /// Draw the current surface with `view_proj` and submit. Returns the
    /// fence value of the draw.
    pub fn draw(&mut self, view_proj: [[f32; 4]; 4]) -> Result<u64> {
        let res = self.resources.as_ref().ok_or(SceneError::Released)?;
        res.surface.draw(&mut self.ctx, view_proj)?;
        Ok(self.ctx.submit()?)
    }

    /// Queue a particle for the next frame.
    pub fn spawn(&mut self, position: [f32; 3], material: Material) -> Result<()> {
        let res = self.resources.as_mut().ok_or(SceneError::Released)?;
        res.simulation.spawn(position, material);
        Ok(())
    }

    /// Queue the particle in `slot` for release in the next frame.
    pub fn destroy(&mut self, slot: u32) -> Result<()> {
        let res = self.resources.as_mut().ok_or(SceneError::Released)?;
        res.simulation.destroy(slot);
        Ok(())
    }

    /// Block until every submitted frame has completed, then tear down
    /// every buffer. Later calls do nothing.
    pub fn release_resources(&mut self) -> Result<()> {
        let Some(res) = self.resources.take() else {
            return Ok(());
        };
        self.ctx.flush()?;
        res.simulation.release(&mut self.ctx)?;
        res.surface.release(&mut self.ctx)?;
        tracing::info!("Scene released after {} frames", self.frame);
        Ok(())
    }

    /// Whether `release_resources` has run.
    pub fn is_released(&self) -> bool {
        self.resources.is_none()
    }

    /// Frames computed so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Compute context of the scene.
    pub fn context(&self) -> &ComputeContext<D> {
        &self.ctx
    }

    /// Counters of recorded and submitted work.
    pub fn context_stats(&self) -> ContextStats {
        self.ctx.stats()
    }

    /// Read the particle arrays back.
    pub fn particle_snapshot(&mut self) -> Result<ParticleSnapshot> {
        let res = self.resources.as_ref().ok_or(SceneError::Released)?;
        Ok(res.simulation.snapshot(&mut self.ctx)?)
    }

    /// Read the surface outputs back.
    pub fn surface_snapshot(&mut self) -> Result<SurfaceSnapshot> {
        let res = self.resources.as_ref().ok_or(SceneError::Released)?;
        Ok(res.surface.snapshot(&mut self.ctx)?)
    }

    /// Read back the counts the headless driver reports.
    pub fn frame_stats(&mut self) -> Result<FrameStats> {
        let particles = self.particle_snapshot()?.enabled_slots().len() as u32;
        let surface = self.surface_snapshot()?;
        let res = self.resources.as_ref().ok_or(SceneError::Released)?;
        let bukkit = res.simulation.bukkit_snapshot(&mut self.ctx)?;
        let stats = self.ctx.stats();
        Ok(FrameStats {
            frame: self.frame,
            particles,
            surface_vertices: surface.vertex_indices.len() as u32,
            cell_overflow: surface.overflow,
            bukkit_overflow: bukkit.overflow,
            submissions: stats.submissions,
            indirect_dispatches: stats.indirect_dispatches,
        })
    }
}

impl<D: ComputeDevice> Drop for FluidScene<D> {
    fn drop(&mut self) {
        if let Err(e) = self.release_resources() {
            tracing::warn!("Scene teardown failed: {e}");
        }
    }
}

/// Orthographic camera looking down -z that fits the box `[min, min + extent]`
/// into clip space, depth in `[0, 1]`. Column-major.
pub fn overview_camera(min: [f32; 3], extent: [f32; 3]) -> [[f32; 4]; 4] {
    let half = 0.5 * extent[0].max(extent[1]).max(f32::EPSILON);
    let center = [min[0] + 0.5 * extent[0], min[1] + 0.5 * extent[1]];
    let depth = extent[2].max(f32::EPSILON);
    [
        [1.0 / half, 0.0, 0.0, 0.0],
        [0.0, 1.0 / half, 0.0, 0.0],
        [0.0, 0.0, -1.0 / depth, 0.0],
        [-center[0] / half, -center[1] / half, (min[2] + depth) / depth, 1.0],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: [[f32; 4]; 4], p: [f32; 3]) -> [f32; 4] {
        let p = [p[0], p[1], p[2], 1.0];
        std::array::from_fn(|row| (0..4).map(|col| m[col][row] * p[col]).sum())
    }

    #[test]
    fn test_overview_camera_fits_the_box() {
        let m = overview_camera([0.0, 0.0, 0.0], [16.0, 8.0, 4.0]);
        let lo = apply(m, [0.0, 4.0, 4.0]);
        let hi = apply(m, [16.0, 4.0, 0.0]);
        assert!((lo[0] + 1.0).abs() < 1e-6 && (hi[0] - 1.0).abs() < 1e-6);
        assert!(lo[1].abs() < 1e-6);
        assert!(lo[2].abs() < 1e-6, "near face at depth 0: {lo:?}");
        assert!((hi[2] - 1.0).abs() < 1e-6, "far face at depth 1: {hi:?}");
        assert_eq!(lo[3], 1.0);
    }
}
