//! Particle simulation driven entirely by device-side counts.
//!
//! The host queues spawn and kill requests between frames. Each
//! [`ParticleSimulation::compute`] uploads them, releases and emits on the
//! device, then runs `substeps` rounds of binning and the `G2P2G` step over
//! a ping-pong pair of position buffers. The live particle count never
//! travels back to the host.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::batch::Pass;
use crate::bukkit::{bukkit_dim, BukkitSnapshot, BukkitSystem, GUARDIAN_SIZE, PARTICLE_DISPATCH_SIZE};
use crate::buffer::GpuBuffer;
use crate::context::ComputeContext;
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::kernels::{KernelId, SimConstants};
use crate::particle::{
    Material, Particle, ParticleArena, ShapeFunction, ShapeType, SimShape, DISABLED_POSITION,
};

/// Host-side simulation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParams {
    /// Simulation grid size in cells.
    pub grid: [u32; 3],
    /// Capacity of every particle array.
    pub max_particles: u32,
    /// Substeps per [`ParticleSimulation::compute`].
    pub substeps: u32,
    /// Frame length in seconds, split evenly over the substeps.
    pub frame_dt: f32,
    /// Gravity in cells per second squared.
    pub gravity: [f32; 3],
    /// Fraction of particle overlap resolved per substep.
    pub liquid_relaxation: f32,
    /// Displacement damping per substep.
    pub liquid_viscosity: f32,
    /// Tangential damping in the guardian band.
    pub border_friction: f32,
    /// Particle rest distance in cells.
    pub particle_radius: f32,
    /// Maximum particles stored per bin.
    pub bukkit_capacity: u32,
    /// Seed of the emitter jitter.
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            grid: [64, 64, 64],
            max_particles: 1 << 16,
            substeps: 2,
            frame_dt: 1.0 / 60.0,
            gravity: [0.0, -9.81 * 8.0, 0.0],
            liquid_relaxation: 1.0,
            liquid_viscosity: 0.02,
            border_friction: 0.5,
            particle_radius: 0.5,
            bukkit_capacity: 512,
            seed: 0x5eed,
        }
    }
}

impl SimulationParams {
    /// Constant block for substep `substep` with `shape_count` shapes.
    pub fn constants(&self, shape_count: u32, substep: u32) -> SimConstants {
        let bins = bukkit_dim(self.grid);
        let steps = self.substeps.max(1);
        SimConstants {
            grid_x: self.grid[0],
            grid_y: self.grid[1],
            grid_z: self.grid[2],
            max_particles: self.max_particles,
            bukkit_x: bins[0],
            bukkit_y: bins[1],
            bukkit_z: bins[2],
            bukkit_capacity: self.bukkit_capacity,
            dt: self.frame_dt / steps as f32,
            gravity_x: self.gravity[0],
            gravity_y: self.gravity[1],
            gravity_z: self.gravity[2],
            liquid_relaxation: self.liquid_relaxation,
            liquid_viscosity: self.liquid_viscosity,
            border_friction: self.border_friction,
            particle_radius: self.particle_radius,
            shape_count,
            guardian_size: GUARDIAN_SIZE,
            substep,
            _pad0: 0,
        }
    }
}

/// Host readback of the particle arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleSnapshot {
    /// Every slot below the slot counter.
    pub particles: Vec<Particle>,
    /// Current positions of those slots.
    pub positions: Vec<[f32; 4]>,
    /// Free stack, bottom first.
    pub free: Vec<u32>,
    /// Slots handed out so far.
    pub slot_count: u32,
    /// Spawn requests dropped for lack of a slot.
    pub dropped_spawns: u32,
}

impl ParticleSnapshot {
    /// Slots of live particles.
    pub fn enabled_slots(&self) -> Vec<u32> {
        (0..self.particles.len() as u32)
            .filter(|&i| self.particles[i as usize].is_enabled())
            .collect()
    }
}

/// Device particle state plus the binning pipeline that feeds the step.
pub struct ParticleSimulation {
    params: SimulationParams,
    particles: GpuBuffer,
    positions: [GpuBuffer; 2],
    front: usize,
    free_count: GpuBuffer,
    free_indices: GpuBuffer,
    slot_count: GpuBuffer,
    shapes: GpuBuffer,
    shape_list: Vec<SimShape>,
    emitter_carry: Vec<f32>,
    request_counts: GpuBuffer,
    spawn_requests: GpuBuffer,
    kill_requests: GpuBuffer,
    counters: GpuBuffer,
    bukkit: BukkitSystem,
    pending_spawns: Vec<[f32; 4]>,
    pending_kills: Vec<u32>,
    rng: StdRng,
}

impl ParticleSimulation {
    /// Kernels this simulation launches besides the binning pipeline.
    pub const KERNELS: [KernelId; 3] = [KernelId::ParticleRelease, KernelId::Emission, KernelId::G2P2G];

    /// Upload `initial` and allocate every buffer.
    pub fn new<D: ComputeDevice>(
        ctx: &mut ComputeContext<D>,
        params: SimulationParams,
        initial: &ParticleArena,
        shapes: &[SimShape],
    ) -> Result<Self> {
        let max = params.max_particles as usize;
        if initial.slot_count() > max {
            return Err(Error::Validation(format!(
                "{} initial particles exceed capacity {max}",
                initial.slot_count()
            )));
        }
        let mut particles = initial.particles().to_vec();
        particles.resize(max, Particle::disabled());
        let mut positions = initial.positions().to_vec();
        positions.resize(max, DISABLED_POSITION);
        let mut free = initial.free_indices().to_vec();
        free.resize(max, 0);
        let constants = params.constants(shapes.len() as u32, 0);

        let sim = Self {
            particles: ctx.create_buffer_init("sim.particles", &particles)?,
            positions: [
                ctx.create_buffer_init("sim.positions.0", &positions)?,
                ctx.create_buffer_init("sim.positions.1", &positions)?,
            ],
            front: 0,
            free_count: ctx.create_buffer_init("sim.free_count", &[initial.free_indices().len() as u32])?,
            free_indices: ctx.create_buffer_init("sim.free_indices", &free)?,
            slot_count: ctx.create_buffer_init("sim.slot_count", &[initial.slot_count() as u32])?,
            shapes: if shapes.is_empty() {
                ctx.create_buffer_zeroed::<SimShape>("sim.shapes", 1)?
            } else {
                ctx.create_buffer_init("sim.shapes", shapes)?
            },
            shape_list: shapes.to_vec(),
            emitter_carry: vec![0.0; shapes.len()],
            request_counts: ctx.create_buffer_zeroed::<u32>("sim.request_counts", 2)?,
            spawn_requests: ctx.create_buffer_zeroed::<[f32; 4]>("sim.spawn_requests", max as u64)?,
            kill_requests: ctx.create_buffer_zeroed::<u32>("sim.kill_requests", max as u64)?,
            counters: ctx.create_buffer_zeroed::<u32>("sim.counters", 4)?,
            bukkit: BukkitSystem::new(ctx, &constants)?,
            pending_spawns: Vec::new(),
            pending_kills: Vec::new(),
            rng: StdRng::seed_from_u64(params.seed),
            params,
        };
        ctx.prepare_kernels(&Self::KERNELS)?;
        tracing::info!(
            "particle simulation: {} of {} slots live, {} shapes, {} substeps",
            initial.enabled_count(),
            max,
            shapes.len(),
            params.substeps
        );
        Ok(sim)
    }

    /// Parameters in use.
    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Current position buffer (`[x, y, z, 1]` per slot, sentinel when free).
    pub fn positions(&self) -> &GpuBuffer {
        &self.positions[self.front]
    }

    /// Particle record buffer.
    pub fn particles(&self) -> &GpuBuffer {
        &self.particles
    }

    /// Binning pipeline.
    pub fn bukkit(&self) -> &BukkitSystem {
        &self.bukkit
    }

    /// Queue a particle for the next [`ParticleSimulation::compute`].
    /// Requests beyond the array capacity are dropped.
    pub fn spawn(&mut self, position: [f32; 3], material: Material) {
        if self.pending_spawns.len() < self.params.max_particles as usize {
            self.pending_spawns.push([position[0], position[1], position[2], material.as_f32()]);
        }
    }

    /// Queue the destruction of `slot`. Invalid or already free slots are
    /// skipped on the device.
    pub fn destroy(&mut self, slot: u32) {
        if self.pending_kills.len() < self.params.max_particles as usize {
            self.pending_kills.push(slot);
        }
    }

    /// Record one frame: release, emission, then every substep.
    pub fn compute<D: ComputeDevice>(&mut self, ctx: &mut ComputeContext<D>) -> Result<()> {
        self.queue_emitters();
        // Host uploads land before the next submitted batch, so hand over
        // everything recorded against the previous requests first.
        ctx.submit()?;
        let spawns = std::mem::take(&mut self.pending_spawns);
        let kills = std::mem::take(&mut self.pending_kills);
        let constants = self.params.constants(self.shape_list.len() as u32, 0);

        if !spawns.is_empty() || !kills.is_empty() {
            ctx.write_buffer(&self.request_counts, 0, &[spawns.len() as u32, kills.len() as u32])?;
        }
        if !kills.is_empty() {
            ctx.write_buffer(&self.kill_requests, 0, &kills)?;
            ctx.dispatch(
                Pass::new(KernelId::ParticleRelease)
                    .bind(self.request_counts.read_view())
                    .bind(self.kill_requests.read_view())
                    .bind(self.slot_count.read_view())
                    .bind(self.particles.write_view())
                    .bind(self.positions().write_view())
                    .bind(self.free_count.write_view())
                    .bind(self.free_indices.write_view())
                    .constants(&constants)
                    .groups((kills.len() as u32).div_ceil(PARTICLE_DISPATCH_SIZE)),
            )?;
            ctx.end_stage()?;
        }
        if !spawns.is_empty() {
            ctx.write_buffer(&self.spawn_requests, 0, &spawns)?;
            ctx.dispatch(
                Pass::new(KernelId::Emission)
                    .bind(self.request_counts.read_view())
                    .bind(self.spawn_requests.read_view())
                    .bind(self.particles.write_view())
                    .bind(self.positions().write_view())
                    .bind(self.free_count.write_view())
                    .bind(self.free_indices.write_view())
                    .bind(self.slot_count.write_view())
                    .bind(self.counters.write_view())
                    .constants(&constants)
                    .groups((spawns.len() as u32).div_ceil(PARTICLE_DISPATCH_SIZE)),
            )?;
            ctx.end_stage()?;
        }

        for substep in 0..self.params.substeps {
            self.substep(ctx, substep)?;
        }
        Ok(())
    }

    fn substep<D: ComputeDevice>(&mut self, ctx: &mut ComputeContext<D>, substep: u32) -> Result<()> {
        let constants = self.params.constants(self.shape_list.len() as u32, substep);
        let (front, back) = (&self.positions[self.front], &self.positions[1 - self.front]);
        self.bukkit
            .bin(ctx, &constants, &self.slot_count, &self.particles, front, back)?;
        ctx.dispatch(
            Pass::new(KernelId::G2P2G)
                .bind(front.read_view())
                .bind(self.bukkit.counts().read_view())
                .bind(self.bukkit.index_start().read_view())
                .bind(self.bukkit.indices().read_view())
                .bind(self.bukkit.thread_data().read_view())
                .bind(self.shapes.read_view())
                .bind(self.particles.write_view())
                .bind(back.write_view())
                .bind(self.free_count.write_view())
                .bind(self.free_indices.write_view())
                .constants(&constants)
                .indirect(self.bukkit.sim_dispatch().raw_address()),
        )?;
        ctx.end_stage()?;
        self.front = 1 - self.front;
        Ok(())
    }

    /// Turn emitter shapes into spawn requests at jittered positions.
    fn queue_emitters(&mut self) {
        for i in 0..self.shape_list.len() {
            let shape = self.shape_list[i];
            if shape.function() != Some(ShapeFunction::Emitter) {
                continue;
            }
            self.emitter_carry[i] += shape.emission_rate.max(0.0);
            let n = self.emitter_carry[i].floor();
            self.emitter_carry[i] -= n;
            for _ in 0..n as u32 {
                let p = self.sample(&shape);
                let material = match shape.material {
                    1 => Material::Elastic,
                    2 => Material::Sand,
                    3 => Material::Visco,
                    _ => Material::Liquid,
                };
                self.spawn(p, material);
            }
        }
    }

    fn sample(&mut self, shape: &SimShape) -> [f32; 3] {
        let local = if shape.shape_type == ShapeType::Sphere as u32 {
            // Rejection sample the unit ball.
            let mut d = [0.0f32; 3];
            loop {
                for v in d.iter_mut() {
                    *v = self.rng.gen_range(-1.0f32..=1.0);
                }
                let len2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                if len2 <= 1.0 {
                    break;
                }
            }
            d.map(|v| v * shape.radius)
        } else {
            let h = shape.half_size;
            let l = [
                self.rng.gen_range(-1.0f32..=1.0) * h[0],
                self.rng.gen_range(-1.0f32..=1.0) * h[1],
                self.rng.gen_range(-1.0f32..=1.0) * h[2],
            ];
            // Inverse of the rotation in `SimShape::contains`.
            let (s, c) = shape.rotation.sin_cos();
            [c * l[0] + s * l[2], l[1], -s * l[0] + c * l[2]]
        };
        [
            shape.position[0] + local[0],
            shape.position[1] + local[1],
            shape.position[2] + local[2],
        ]
    }

    /// Read the particle arrays back. Submits pending work first.
    pub fn snapshot<D: ComputeDevice>(&self, ctx: &mut ComputeContext<D>) -> Result<ParticleSnapshot> {
        let slot_count = ctx.read_buffer::<u32>(&self.slot_count)?.first().copied().unwrap_or(0);
        let free_count = ctx.read_buffer::<u32>(&self.free_count)?.first().copied().unwrap_or(0);
        let mut particles: Vec<Particle> = ctx.read_buffer(&self.particles)?;
        let mut positions: Vec<[f32; 4]> = ctx.read_buffer(self.positions())?;
        let mut free: Vec<u32> = ctx.read_buffer(&self.free_indices)?;
        particles.truncate(slot_count as usize);
        positions.truncate(slot_count as usize);
        free.truncate(free_count as usize);
        let dropped_spawns = ctx.read_buffer::<u32>(&self.counters)?.first().copied().unwrap_or(0);
        if dropped_spawns > 0 {
            tracing::warn!("emission dropped {dropped_spawns} spawn requests for lack of free slots");
        }
        Ok(ParticleSnapshot {
            particles,
            positions,
            free,
            slot_count,
            dropped_spawns,
        })
    }

    /// Read the binning buffers of the last substep back.
    pub fn bukkit_snapshot<D: ComputeDevice>(&self, ctx: &mut ComputeContext<D>) -> Result<BukkitSnapshot> {
        self.bukkit.snapshot(ctx)
    }

    /// Release every buffer.
    pub fn release<D: ComputeDevice>(self, ctx: &mut ComputeContext<D>) -> Result<()> {
        let [p0, p1] = self.positions;
        for buffer in [
            self.particles,
            p0,
            p1,
            self.free_count,
            self.free_indices,
            self.slot_count,
            self.shapes,
            self.request_counts,
            self.spawn_requests,
            self.kill_requests,
            self.counters,
        ] {
            ctx.release_buffer(buffer)?;
        }
        self.bukkit.release(ctx)
    }
}
