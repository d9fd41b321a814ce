//! Surface extraction pipeline.
//!
//! Six chained kernels turn a particle position array into a sparse set of
//! isosurface vertices with a density and a normal each:
//!
//! 1. bilevel grid build (direct, one thread per particle)
//! 2. surface block detection (direct, one thread per block)
//! 3. surface cell detection (indirect, one group per surface block)
//! 4. vertex compaction (indirect, two groups per surface block)
//! 5. vertex density (indirect, sized by `DispatchArgDivide`)
//! 6. vertex normal (indirect, same)
//!
//! Every launch after stage 2 is shaped by a record the previous stage wrote
//! on the device, so the workload shrinks from all particles to surface
//! blocks to surface vertices without a host readback. Records fold onto y
//! past [`MAX_GROUPS_PER_AXIS`](crate::kernels::MAX_GROUPS_PER_AXIS) groups;
//! the tail groups check the surface block or vertex count and exit.

use crate::batch::{DispatchArgs, DrawArgs, Pass};
use crate::buffer::GpuBuffer;
use crate::context::ComputeContext;
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::kernels::{
    CameraConstants, DivideConstants, GridConstants, KernelId, BLOCK_THREADS, PARTICLE_THREADS,
    VERTEX_THREADS,
};

/// Cells per block edge.
pub const CELLS_PER_BLOCK_EDGE: u32 = 4;
/// Cells per block.
pub const CELLS_PER_BLOCK: u32 = CELLS_PER_BLOCK_EDGE * CELLS_PER_BLOCK_EDGE * CELLS_PER_BLOCK_EDGE;
/// Particle indices stored per cell. Further particles are dropped.
pub const MAX_PARTICLES_PER_CELL: u32 = 8;

/// The 26 offsets of a 3x3x3 neighborhood without its center.
pub const NEIGHBOR_OFFSETS: [[i32; 3]; 26] = {
    let mut out = [[0i32; 3]; 26];
    let mut n = 0;
    let mut i = 0;
    while i < 27 {
        let d = [i % 3 - 1, (i / 3) % 3 - 1, i / 9 - 1];
        if d[0] != 0 || d[1] != 0 || d[2] != 0 {
            out[n] = d;
            n += 1;
        }
        i += 1;
    }
    out
};

/// Index arithmetic of the cell grid, its block grid and its vertex
/// lattice. Cell `c` spans `[min + c * resolution, min + (c + 1) * resolution)`
/// and vertex `v` sits at `min + v * resolution`, so the lattice has one more
/// vertex than cells along each axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceGrid {
    /// Cells per axis.
    pub dim: [u32; 3],
    /// World-space origin.
    pub min: [f32; 3],
    /// Cell edge length.
    pub resolution: f32,
}

impl SurfaceGrid {
    /// Grid described by a constant block.
    pub fn from_constants(c: &GridConstants) -> Self {
        Self {
            dim: c.grid_dim(),
            min: c.min_bounds(),
            resolution: c.resolution,
        }
    }

    /// Number of cells.
    pub fn cell_count(&self) -> u32 {
        self.dim[0] * self.dim[1] * self.dim[2]
    }

    /// Blocks per axis, rounding partial blocks up.
    pub fn block_dim(&self) -> [u32; 3] {
        self.dim.map(|d| d.div_ceil(CELLS_PER_BLOCK_EDGE))
    }

    /// Number of blocks.
    pub fn block_count(&self) -> u32 {
        let b = self.block_dim();
        b[0] * b[1] * b[2]
    }

    /// Lattice vertices per axis.
    pub fn vertex_dim(&self) -> [u32; 3] {
        self.dim.map(|d| d + 1)
    }

    /// Number of lattice vertices.
    pub fn vertex_count(&self) -> u32 {
        let v = self.vertex_dim();
        v[0] * v[1] * v[2]
    }

    /// Cell containing `p`, or `None` outside the grid (NaN included).
    pub fn cell_of(&self, p: [f32; 3]) -> Option<[u32; 3]> {
        let mut cell = [0u32; 3];
        for axis in 0..3 {
            let t = ((p[axis] - self.min[axis]) / self.resolution).floor();
            if !(t >= 0.0 && t < self.dim[axis] as f32) {
                return None;
            }
            cell[axis] = t as u32;
        }
        Some(cell)
    }

    /// Linear cell index, x fastest.
    pub fn cell_index(&self, c: [u32; 3]) -> u32 {
        c[0] + self.dim[0] * (c[1] + self.dim[1] * c[2])
    }

    /// Block holding a cell.
    pub fn block_of_cell(&self, c: [u32; 3]) -> [u32; 3] {
        c.map(|v| v / CELLS_PER_BLOCK_EDGE)
    }

    /// Linear block index, x fastest.
    pub fn block_index(&self, b: [u32; 3]) -> u32 {
        let d = self.block_dim();
        b[0] + d[0] * (b[1] + d[1] * b[2])
    }

    /// Inverse of [`SurfaceGrid::block_index`].
    pub fn block_coord(&self, index: u32) -> [u32; 3] {
        let d = self.block_dim();
        [index % d[0], (index / d[0]) % d[1], index / (d[0] * d[1])]
    }

    /// Cell `local` (x fastest within the block) of a block, or `None` for
    /// the missing cells of a partial block at the grid edge.
    pub fn block_cell(&self, block: [u32; 3], local: u32) -> Option<[u32; 3]> {
        if local >= CELLS_PER_BLOCK {
            return None;
        }
        let e = CELLS_PER_BLOCK_EDGE;
        let cell = [
            block[0] * e + local % e,
            block[1] * e + (local / e) % e,
            block[2] * e + local / (e * e),
        ];
        (0..3).all(|a| cell[a] < self.dim[a]).then_some(cell)
    }

    fn offset(coord: [u32; 3], d: [i32; 3], dim: [u32; 3]) -> Option<[u32; 3]> {
        let mut out = [0u32; 3];
        for axis in 0..3 {
            let v = coord[axis] as i64 + d[axis] as i64;
            if v < 0 || v >= dim[axis] as i64 {
                return None;
            }
            out[axis] = v as u32;
        }
        Some(out)
    }

    /// Neighbor of a cell, or `None` past the grid border.
    pub fn neighbor_cell(&self, cell: [u32; 3], d: [i32; 3]) -> Option<[u32; 3]> {
        Self::offset(cell, d, self.dim)
    }

    /// Neighbor of a block, or `None` past the block grid border.
    pub fn neighbor_block(&self, block: [u32; 3], d: [i32; 3]) -> Option<[u32; 3]> {
        Self::offset(block, d, self.block_dim())
    }

    /// Linear lattice vertex index, x fastest.
    pub fn vertex_index(&self, v: [u32; 3]) -> u32 {
        let d = self.vertex_dim();
        v[0] + d[0] * (v[1] + d[1] * v[2])
    }

    /// Inverse of [`SurfaceGrid::vertex_index`].
    pub fn vertex_coord(&self, index: u32) -> [u32; 3] {
        let d = self.vertex_dim();
        [index % d[0], (index / d[0]) % d[1], index / (d[0] * d[1])]
    }

    /// World position of a lattice vertex.
    pub fn vertex_position(&self, index: u32) -> [f32; 3] {
        let v = self.vertex_coord(index);
        [
            self.min[0] + v[0] as f32 * self.resolution,
            self.min[1] + v[1] as f32 * self.resolution,
            self.min[2] + v[2] as f32 * self.resolution,
        ]
    }
}

/// Device buffers of the pipeline.
struct SurfaceBuffers {
    cell_counts: GpuBuffer,
    cell_indices: GpuBuffer,
    block_cells: GpuBuffer,
    surface_blocks: GpuBuffer,
    surface_block_count: GpuBuffer,
    /// Record 0 sizes cell detection, record 1 vertex compaction.
    surface_dispatch: GpuBuffer,
    vertex_flags: GpuBuffer,
    vertex_indices: GpuBuffer,
    vertex_count: GpuBuffer,
    /// Record 0 sizes the density pass, record 1 the normal pass.
    vertex_dispatch: GpuBuffer,
    draw_args: GpuBuffer,
    vertex_density: GpuBuffer,
    vertex_normals: GpuBuffer,
    overflow: GpuBuffer,
}

impl SurfaceBuffers {
    fn all(&self) -> [&GpuBuffer; 14] {
        [
            &self.cell_counts,
            &self.cell_indices,
            &self.block_cells,
            &self.surface_blocks,
            &self.surface_block_count,
            &self.surface_dispatch,
            &self.vertex_flags,
            &self.vertex_indices,
            &self.vertex_count,
            &self.vertex_dispatch,
            &self.draw_args,
            &self.vertex_density,
            &self.vertex_normals,
            &self.overflow,
        ]
    }

    /// Per-frame scratch that must start from zero.
    fn scratch(&self) -> [&GpuBuffer; 9] {
        [
            &self.cell_counts,
            &self.block_cells,
            &self.surface_block_count,
            &self.surface_dispatch,
            &self.vertex_flags,
            &self.vertex_count,
            &self.vertex_dispatch,
            &self.draw_args,
            &self.overflow,
        ]
    }
}

/// Host readback of the pipeline outputs, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceSnapshot {
    /// Compacted lattice vertex indices, in compaction order.
    pub vertex_indices: Vec<u32>,
    /// Density per compacted vertex.
    pub densities: Vec<f32>,
    /// `[nx, ny, nz, offset]` per compacted vertex.
    pub normals: Vec<[f32; 4]>,
    /// Compacted surface block indices.
    pub surface_blocks: Vec<u32>,
    /// Cell detection launch record.
    pub block_dispatch: DispatchArgs,
    /// Vertex compaction launch record.
    pub half_block_dispatch: DispatchArgs,
    /// Density and normal launch records.
    pub vertex_dispatch: [DispatchArgs; 2],
    /// Draw record.
    pub draw: DrawArgs,
    /// Particle count per cell (settles at capacity on overflow).
    pub cell_counts: Vec<u32>,
    /// Particles dropped by full cells.
    pub overflow: u32,
}

impl SurfaceSnapshot {
    /// Density keyed by lattice vertex, independent of compaction order.
    pub fn density_by_vertex(&self) -> std::collections::BTreeMap<u32, f32> {
        self.vertex_indices
            .iter()
            .copied()
            .zip(self.densities.iter().copied())
            .collect()
    }
}

/// The surface extraction pipeline and the buffers it owns.
pub struct SurfaceExtraction {
    grid: GridConstants,
    buffers: SurfaceBuffers,
}

impl SurfaceExtraction {
    /// Kernels this pipeline launches.
    pub const KERNELS: [KernelId; 9] = [
        KernelId::BufferClear,
        KernelId::BilevelGrid,
        KernelId::SurfaceBlockDetection,
        KernelId::SurfaceCellDetection,
        KernelId::SurfaceVertexCompaction,
        KernelId::DispatchArgDivide,
        KernelId::SurfaceVertexDensity,
        KernelId::SurfaceVertexNormal,
        KernelId::SurfaceDraw,
    ];

    /// Allocate every buffer for `grid` and build the pipelines. Fails on an
    /// empty grid, a non-positive resolution or any allocation failure.
    pub fn new<D: ComputeDevice>(ctx: &mut ComputeContext<D>, grid: GridConstants) -> Result<Self> {
        if grid.grid_dim().contains(&0) || !(grid.resolution > 0.0) || !(grid.kernel_radius > 0.0) {
            return Err(Error::Validation(format!(
                "surface grid {:?} at resolution {} with radius {} is empty",
                grid.grid_dim(),
                grid.resolution,
                grid.kernel_radius
            )));
        }
        let g = SurfaceGrid::from_constants(&grid);
        let cells = g.cell_count() as u64;
        let blocks = g.block_count() as u64;
        let vertices = g.vertex_count() as u64;
        let buffers = SurfaceBuffers {
            cell_counts: ctx.create_buffer_zeroed::<u32>("surface.cell_counts", cells)?,
            cell_indices: ctx
                .create_buffer_zeroed::<u32>("surface.cell_indices", cells * MAX_PARTICLES_PER_CELL as u64)?,
            block_cells: ctx.create_buffer_zeroed::<u32>("surface.block_cells", blocks)?,
            surface_blocks: ctx.create_buffer_zeroed::<u32>("surface.surface_blocks", blocks)?,
            surface_block_count: ctx.create_buffer_zeroed::<u32>("surface.surface_block_count", 1)?,
            surface_dispatch: ctx.create_buffer_zeroed::<DispatchArgs>("surface.surface_dispatch", 2)?,
            vertex_flags: ctx.create_buffer_zeroed::<u32>("surface.vertex_flags", vertices)?,
            vertex_indices: ctx.create_buffer_zeroed::<u32>("surface.vertex_indices", vertices)?,
            vertex_count: ctx.create_buffer_zeroed::<u32>("surface.vertex_count", 1)?,
            vertex_dispatch: ctx.create_buffer_zeroed::<DispatchArgs>("surface.vertex_dispatch", 2)?,
            draw_args: ctx.create_buffer_zeroed::<DrawArgs>("surface.draw_args", 1)?,
            vertex_density: ctx.create_buffer_zeroed::<f32>("surface.vertex_density", vertices)?,
            vertex_normals: ctx.create_buffer_zeroed::<[f32; 4]>("surface.vertex_normals", vertices)?,
            overflow: ctx.create_buffer_zeroed::<u32>("surface.overflow", 1)?,
        };
        ctx.prepare_kernels(&Self::KERNELS)?;
        tracing::info!(
            "surface extraction: {:?} cells, {} blocks, {} lattice vertices",
            grid.grid_dim(),
            blocks,
            vertices
        );
        Ok(Self { grid, buffers })
    }

    /// Grid parameters.
    pub fn grid(&self) -> SurfaceGrid {
        SurfaceGrid::from_constants(&self.grid)
    }

    /// Record one extraction over the first `num_particles` entries of
    /// `positions` (`[x, y, z, w]` per particle).
    pub fn compute<D: ComputeDevice>(
        &self,
        ctx: &mut ComputeContext<D>,
        positions: &GpuBuffer,
        num_particles: u32,
    ) -> Result<()> {
        let b = &self.buffers;
        let g = self.grid();
        let num_particles = num_particles.min(positions.count() as u32);
        let constants = GridConstants {
            num_particles,
            ..self.grid
        };

        for buffer in b.scratch() {
            ctx.clear_buffer(buffer, 0)?;
        }
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::BilevelGrid)
                .bind(positions.read_view())
                .bind(b.cell_counts.write_view())
                .bind(b.cell_indices.write_view())
                .bind(b.block_cells.write_view())
                .bind(b.overflow.write_view())
                .constants(&constants)
                .groups(num_particles.div_ceil(PARTICLE_THREADS)),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::SurfaceBlockDetection)
                .bind(b.block_cells.read_view())
                .bind(b.surface_blocks.write_view())
                .bind(b.surface_block_count.write_view())
                .bind(b.surface_dispatch.write_view())
                .constants(&constants)
                .groups(g.block_count().div_ceil(BLOCK_THREADS)),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::SurfaceCellDetection)
                .bind(b.cell_counts.read_view())
                .bind(b.surface_blocks.read_view())
                .bind(b.surface_block_count.read_view())
                .bind(b.vertex_flags.write_view())
                .constants(&constants)
                .indirect(b.surface_dispatch.raw_address()),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::SurfaceVertexCompaction)
                .bind(b.surface_blocks.read_view())
                .bind(b.surface_block_count.read_view())
                .bind(b.vertex_flags.write_view())
                .bind(b.vertex_indices.write_view())
                .bind(b.vertex_count.write_view())
                .constants(&constants)
                .indirect(b.surface_dispatch.raw_address().offset(DispatchArgs::SIZE)),
        )?;
        ctx.dispatch(
            Pass::new(KernelId::DispatchArgDivide)
                .bind(b.vertex_count.read_view())
                .bind(b.vertex_dispatch.write_view())
                .bind(b.draw_args.write_view())
                .constants(&DivideConstants {
                    divisor: VERTEX_THREADS,
                    ..Default::default()
                })
                .groups(1),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::SurfaceVertexDensity)
                .bind(positions.read_view())
                .bind(b.cell_counts.read_view())
                .bind(b.cell_indices.read_view())
                .bind(b.vertex_indices.read_view())
                .bind(b.vertex_count.read_view())
                .bind(b.vertex_density.write_view())
                .constants(&constants)
                .indirect(b.vertex_dispatch.raw_address()),
        )?;
        ctx.end_stage()?;

        ctx.dispatch(
            Pass::new(KernelId::SurfaceVertexNormal)
                .bind(positions.read_view())
                .bind(b.cell_counts.read_view())
                .bind(b.cell_indices.read_view())
                .bind(b.vertex_indices.read_view())
                .bind(b.vertex_count.read_view())
                .bind(b.vertex_density.read_view())
                .bind(b.vertex_normals.write_view())
                .constants(&constants)
                .indirect(b.vertex_dispatch.raw_address().offset(DispatchArgs::SIZE)),
        )?;
        ctx.end_stage()
    }

    /// Record the indirect point draw of the compacted vertices.
    pub fn draw<D: ComputeDevice>(&self, ctx: &mut ComputeContext<D>, view_proj: [[f32; 4]; 4]) -> Result<()> {
        let b = &self.buffers;
        let camera = CameraConstants {
            view_proj,
            min_x: self.grid.min_x,
            min_y: self.grid.min_y,
            min_z: self.grid.min_z,
            resolution: self.grid.resolution,
            grid_dim_x: self.grid.grid_dim_x,
            grid_dim_y: self.grid.grid_dim_y,
            grid_dim_z: self.grid.grid_dim_z,
            _pad0: 0,
        };
        ctx.dispatch(
            Pass::new(KernelId::SurfaceDraw)
                .bind(b.vertex_indices.read_view())
                .bind(b.vertex_normals.read_view())
                .constants(&camera)
                .draw_indirect(b.draw_args.raw_address()),
        )?;
        ctx.end_stage()
    }

    /// Read every output back. Submits pending work first.
    pub fn snapshot<D: ComputeDevice>(&self, ctx: &mut ComputeContext<D>) -> Result<SurfaceSnapshot> {
        let b = &self.buffers;
        let count = ctx.read_buffer::<u32>(&b.vertex_count)?.first().copied().unwrap_or(0) as usize;
        let mut vertex_indices: Vec<u32> = ctx.read_buffer(&b.vertex_indices)?;
        let mut densities: Vec<f32> = ctx.read_buffer(&b.vertex_density)?;
        let mut normals: Vec<[f32; 4]> = ctx.read_buffer(&b.vertex_normals)?;
        vertex_indices.truncate(count);
        densities.truncate(count);
        normals.truncate(count);

        let surface: Vec<DispatchArgs> = ctx.read_buffer(&b.surface_dispatch)?;
        let vertex: Vec<DispatchArgs> = ctx.read_buffer(&b.vertex_dispatch)?;
        let block_dispatch = surface.first().copied().unwrap_or_default();
        let block_count = ctx
            .read_buffer::<u32>(&b.surface_block_count)?
            .first()
            .copied()
            .unwrap_or(0);
        let mut surface_blocks: Vec<u32> = ctx.read_buffer(&b.surface_blocks)?;
        surface_blocks.truncate(block_count as usize);

        let overflow = ctx.read_buffer::<u32>(&b.overflow)?.first().copied().unwrap_or(0);
        if overflow > 0 {
            tracing::warn!("surface grid dropped {overflow} particles from full cells");
        }
        Ok(SurfaceSnapshot {
            vertex_indices,
            densities,
            normals,
            surface_blocks,
            block_dispatch,
            half_block_dispatch: surface.get(1).copied().unwrap_or_default(),
            vertex_dispatch: [
                vertex.first().copied().unwrap_or_default(),
                vertex.get(1).copied().unwrap_or_default(),
            ],
            draw: ctx.read_buffer::<DrawArgs>(&b.draw_args)?.first().copied().unwrap_or_default(),
            cell_counts: ctx.read_buffer(&b.cell_counts)?,
            overflow,
        })
    }

    /// Release every buffer.
    pub fn release<D: ComputeDevice>(self, ctx: &mut ComputeContext<D>) -> Result<()> {
        for buffer in self.buffers.all() {
            ctx.release_buffer(buffer.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> SurfaceGrid {
        SurfaceGrid {
            dim: [6, 4, 5],
            min: [-1.0, 0.0, 0.0],
            resolution: 0.5,
        }
    }

    #[test]
    fn neighbor_offsets_cover_the_shell() {
        assert_eq!(NEIGHBOR_OFFSETS.len(), 26);
        assert!(!NEIGHBOR_OFFSETS.contains(&[0, 0, 0]));
        assert!(NEIGHBOR_OFFSETS.contains(&[-1, -1, -1]));
        assert!(NEIGHBOR_OFFSETS.contains(&[1, 1, 1]));
    }

    #[test]
    fn cell_lookup_rejects_outside_points() {
        let g = grid();
        assert_eq!(g.cell_of([-1.0, 0.0, 0.0]), Some([0, 0, 0]));
        assert_eq!(g.cell_of([1.9, 1.9, 2.4]), Some([5, 3, 4]));
        assert_eq!(g.cell_of([2.0, 0.0, 0.0]), None);
        assert_eq!(g.cell_of([-1.01, 0.0, 0.0]), None);
        assert_eq!(g.cell_of([f32::NAN, 0.0, 0.0]), None);
        assert_eq!(g.cell_of([-1.0e30, -1.0e30, -1.0e30]), None);
    }

    #[test]
    fn partial_blocks_are_clipped() {
        let g = grid();
        assert_eq!(g.block_dim(), [2, 1, 2]);
        // Block (1, 0, 1) covers cells x 4..8, z 4..8 of a 6 x 4 x 5 grid.
        let present = (0..CELLS_PER_BLOCK)
            .filter(|&t| g.block_cell([1, 0, 1], t).is_some())
            .count();
        assert_eq!(present, 2 * 4 * 1);
        for b in 0..g.block_count() {
            assert_eq!(g.block_index(g.block_coord(b)), b);
        }
    }

    #[test]
    fn vertex_lattice_round_trips() {
        let g = grid();
        assert_eq!(g.vertex_count(), 7 * 5 * 6);
        let v = g.vertex_index([6, 4, 5]);
        assert_eq!(v, g.vertex_count() - 1);
        assert_eq!(g.vertex_coord(v), [6, 4, 5]);
        assert_eq!(g.vertex_position(v), [2.0, 2.0, 2.5]);
    }
}
