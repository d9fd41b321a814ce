//! Spatial binning ("bukkit") pipeline.
//!
//! A GPU-resident counting sort that rebuilds every substep:
//!
//! 1. `SetIndirectArgs` sizes the per-particle launches from the device-side
//!    slot counter, so the host never needs the live particle count.
//! 2. `BukkitCount` bumps one counter per bin for every enabled particle.
//! 3. `BukkitAllocate` runs an exclusive prefix sum over the counts into
//!    `index_start`, zeroes the insert counters and emits one
//!    [`BukkitThreadData`] entry per chunk of a bin and the simulation
//!    dispatch record sized by the entry count. The record folds onto y for
//!    long launches; entries up to the folded size are written empty.
//! 4. `BukkitInsert` claims a slot in the particle's bin range with an atomic
//!    increment and writes the particle index there.
//!
//! Bins hold at most `bukkit_capacity` particles. Counts keep the true
//! population, but only the first `capacity` inserts are stored; the rest are
//! dropped and counted in the overflow buffer, so a full bin never writes
//! into its neighbor's range.

use crate::batch::{DispatchArgs, Pass};
use crate::buffer::GpuBuffer;
use crate::context::ComputeContext;
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::kernels::{KernelId, SimConstants, PARTICLE_THREADS};

/// Grid cells per bin edge.
pub const BUKKIT_SIZE: u32 = 2;
/// Bins gathered on each side of the home bin by the simulation step.
pub const BUKKIT_HALO_SIZE: u32 = 1;
/// Width of the border band where particles are clamped, in cells.
pub const GUARDIAN_SIZE: u32 = 3;
/// Threads per group of the per-particle binning launches.
pub const PARTICLE_DISPATCH_SIZE: u32 = PARTICLE_THREADS;
/// Particles handled by one simulation work group.
pub const PARTICLES_PER_THREAD_DATA: u32 = 64;

/// Bins per axis covering a grid of `grid` cells.
pub fn bukkit_dim(grid: [u32; 3]) -> [u32; 3] {
    grid.map(|g| g.div_ceil(BUKKIT_SIZE).max(1))
}

/// Bin coordinate of a position in cells, clamped into the bin grid.
pub fn bukkit_coord(p: [f32; 3], c: &SimConstants) -> [u32; 3] {
    let dim = [c.bukkit_x, c.bukkit_y, c.bukkit_z];
    let mut out = [0u32; 3];
    for axis in 0..3 {
        let b = (p[axis] / BUKKIT_SIZE as f32).floor().max(0.0) as u32;
        out[axis] = b.min(dim[axis].saturating_sub(1));
    }
    out
}

/// Linear bin index of a position, x fastest.
pub fn bukkit_of(p: [f32; 3], c: &SimConstants) -> u32 {
    let b = bukkit_coord(p, c);
    b[0] + c.bukkit_x * (b[1] + c.bukkit_y * b[2])
}

/// One simulation work group's slice of a bin.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BukkitThreadData {
    /// First entry in the particle index array.
    pub range_start: u32,
    /// Number of entries, at most [`PARTICLES_PER_THREAD_DATA`].
    pub range_count: u32,
    /// Bin coordinate.
    pub bukkit_x: u32,
    #[allow(missing_docs)]
    pub bukkit_y: u32,
    #[allow(missing_docs)]
    pub bukkit_z: u32,
}

/// Host readback of the binning buffers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BukkitSnapshot {
    /// Particles counted per bin, dropped ones included.
    pub counts: Vec<u32>,
    /// First index array entry of each bin.
    pub index_start: Vec<u32>,
    /// Bin-grouped particle indices.
    pub indices: Vec<u32>,
    /// Simulation work items, without the empty entries of a folded launch.
    pub thread_data: Vec<BukkitThreadData>,
    /// Simulation launch record.
    pub sim_dispatch: DispatchArgs,
    /// Inserts dropped by full bins.
    pub overflow: u32,
    /// Bin capacity used for the snapshot.
    pub capacity: u32,
}

impl BukkitSnapshot {
    /// Particle indices stored in bin `b`.
    pub fn bin(&self, b: usize) -> &[u32] {
        let start = self.index_start.get(b).copied().unwrap_or(0) as usize;
        let stored = self.counts.get(b).copied().unwrap_or(0).min(self.capacity) as usize;
        let end = (start + stored).min(self.indices.len());
        &self.indices[start.min(end)..end]
    }

    /// Total particles counted.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

/// Buffers and launches of the binning pipeline.
pub struct BukkitSystem {
    counts: GpuBuffer,
    insert_counters: GpuBuffer,
    index_start: GpuBuffer,
    indices: GpuBuffer,
    thread_data: GpuBuffer,
    /// Record 0 sizes the count pass, record 1 the insert pass.
    particle_dispatch: GpuBuffer,
    sim_dispatch: GpuBuffer,
    overflow: GpuBuffer,
    capacity: u32,
}

impl BukkitSystem {
    /// Kernels this pipeline launches.
    pub const KERNELS: [KernelId; 5] = [
        KernelId::BufferClear,
        KernelId::SetIndirectArgs,
        KernelId::BukkitCount,
        KernelId::BukkitAllocate,
        KernelId::BukkitInsert,
    ];

    /// Allocate the bins described by `constants`.
    pub fn new<D: ComputeDevice>(ctx: &mut ComputeContext<D>, constants: &SimConstants) -> Result<Self> {
        let bins = constants.bukkit_count();
        if bins == 0 || constants.bukkit_capacity == 0 || constants.max_particles == 0 {
            return Err(Error::Validation(format!(
                "bin grid {}x{}x{} of capacity {} for {} particles is empty",
                constants.bukkit_x,
                constants.bukkit_y,
                constants.bukkit_z,
                constants.bukkit_capacity,
                constants.max_particles
            )));
        }
        let bins = bins as u64;
        let max = constants.max_particles as u64;
        let entries = bins + max.div_ceil(PARTICLES_PER_THREAD_DATA as u64);
        let entries = u32::try_from(entries)
            .map(|e| DispatchArgs::folded(e).groups())
            .map_err(|_| Error::Validation(format!("{entries} thread-data entries overflow the launch index")))?;
        let system = Self {
            counts: ctx.create_buffer_zeroed::<u32>("bukkit.counts", bins)?,
            insert_counters: ctx.create_buffer_zeroed::<u32>("bukkit.insert_counters", bins)?,
            index_start: ctx.create_buffer_zeroed::<u32>("bukkit.index_start", bins)?,
            indices: ctx.create_buffer_zeroed::<u32>("bukkit.indices", max)?,
            thread_data: ctx.create_buffer_zeroed::<BukkitThreadData>("bukkit.thread_data", entries)?,
            particle_dispatch: ctx.create_buffer_zeroed::<DispatchArgs>("bukkit.particle_dispatch", 2)?,
            sim_dispatch: ctx.create_buffer_zeroed::<DispatchArgs>("bukkit.sim_dispatch", 1)?,
            overflow: ctx.create_buffer_zeroed::<u32>("bukkit.overflow", 1)?,
            capacity: constants.bukkit_capacity,
        };
        ctx.prepare_kernels(&Self::KERNELS)?;
        tracing::info!(
            "bukkit grid {}x{}x{}, capacity {}, {} thread-data entries",
            constants.bukkit_x,
            constants.bukkit_y,
            constants.bukkit_z,
            constants.bukkit_capacity,
            entries
        );
        Ok(system)
    }

    /// Record one full binning pass.
    ///
    /// `positions` is read for the bin lookup and copied to `positions_out`
    /// for every slot, so the simulation step only writes the particles it
    /// moves.
    pub fn bin<D: ComputeDevice>(
        &self,
        ctx: &mut ComputeContext<D>,
        constants: &SimConstants,
        slot_count: &GpuBuffer,
        particles: &GpuBuffer,
        positions: &GpuBuffer,
        positions_out: &GpuBuffer,
    ) -> Result<()> {
        for buffer in [&self.counts, &self.particle_dispatch, &self.sim_dispatch, &self.overflow] {
            ctx.clear_buffer(buffer, 0)?;
        }
        ctx.dispatch(
            Pass::new(KernelId::SetIndirectArgs)
                .bind(slot_count.read_view())
                .bind(self.particle_dispatch.write_view())
                .constants(constants)
                .groups(1),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::BukkitCount)
                .bind(slot_count.read_view())
                .bind(particles.read_view())
                .bind(positions.read_view())
                .bind(self.counts.write_view())
                .constants(constants)
                .indirect(self.particle_dispatch.raw_address()),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::BukkitAllocate)
                .bind(self.counts.read_view())
                .bind(self.index_start.write_view())
                .bind(self.insert_counters.write_view())
                .bind(self.thread_data.write_view())
                .bind(self.sim_dispatch.write_view())
                .constants(constants)
                .groups(1),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::BukkitInsert)
                .bind(slot_count.read_view())
                .bind(particles.read_view())
                .bind(positions.read_view())
                .bind(self.counts.read_view())
                .bind(self.index_start.read_view())
                .bind(self.insert_counters.write_view())
                .bind(self.indices.write_view())
                .bind(self.overflow.write_view())
                .bind(positions_out.write_view())
                .constants(constants)
                .indirect(self.particle_dispatch.raw_address().offset(DispatchArgs::SIZE)),
        )?;
        ctx.end_stage()
    }

    /// Per-bin particle counts.
    pub fn counts(&self) -> &GpuBuffer {
        &self.counts
    }

    /// Per-bin range starts.
    pub fn index_start(&self) -> &GpuBuffer {
        &self.index_start
    }

    /// Bin-grouped particle indices.
    pub fn indices(&self) -> &GpuBuffer {
        &self.indices
    }

    /// Simulation work items.
    pub fn thread_data(&self) -> &GpuBuffer {
        &self.thread_data
    }

    /// Simulation launch record, valid after [`BukkitSystem::bin`].
    pub fn sim_dispatch(&self) -> &GpuBuffer {
        &self.sim_dispatch
    }

    /// Read the binning buffers back.
    pub fn snapshot<D: ComputeDevice>(&self, ctx: &mut ComputeContext<D>) -> Result<BukkitSnapshot> {
        let sim_dispatch = ctx
            .read_buffer::<DispatchArgs>(&self.sim_dispatch)?
            .first()
            .copied()
            .unwrap_or_default();
        let mut thread_data: Vec<BukkitThreadData> = ctx.read_buffer(&self.thread_data)?;
        thread_data.truncate(sim_dispatch.groups() as usize);
        while thread_data.last().is_some_and(|e| e.range_count == 0) {
            thread_data.pop();
        }
        let overflow = ctx.read_buffer::<u32>(&self.overflow)?.first().copied().unwrap_or(0);
        if overflow > 0 {
            tracing::warn!("bins dropped {overflow} particles over capacity {}", self.capacity);
        }
        Ok(BukkitSnapshot {
            counts: ctx.read_buffer(&self.counts)?,
            index_start: ctx.read_buffer(&self.index_start)?,
            indices: ctx.read_buffer(&self.indices)?,
            thread_data,
            sim_dispatch,
            overflow,
            capacity: self.capacity,
        })
    }

    /// Release every buffer.
    pub fn release<D: ComputeDevice>(self, ctx: &mut ComputeContext<D>) -> Result<()> {
        for buffer in [
            self.counts,
            self.insert_counters,
            self.index_start,
            self.indices,
            self.thread_data,
            self.particle_dispatch,
            self.sim_dispatch,
            self.overflow,
        ] {
            ctx.release_buffer(buffer)?;
        }
        Ok(())
    }
}
