//! Kernel table.
//!
//! Each kernel is a tagged record: entry point, work-group size, ordered
//! binding list and constant-block size. The binding order is the kernel's
//! ABI and must match the WGSL declarations (`@binding(i)` in order, constant
//! block last) and the CPU implementation's argument indices. Recording a
//! pass checks it against this table so an out-of-order binding is caught on
//! the host instead of corrupting memory on the device.

use crate::batch::{DispatchShape, Pass};
use crate::buffer::Access;
use crate::error::{Error, Result};

/// Threads per group for per-particle kernels.
pub const PARTICLE_THREADS: u32 = 64;
/// Threads per group for per-block surface detection.
pub const BLOCK_THREADS: u32 = 64;
/// Threads per group for per-vertex kernels.
pub const VERTEX_THREADS: u32 = 64;
/// Threads per group for vertex compaction (half a block of cells).
pub const HALF_BLOCK_THREADS: u32 = 32;
/// Threads per group for buffer clears.
pub const CLEAR_THREADS: u32 = 64;
/// Threads in the single bin-allocation group.
pub const ALLOCATE_THREADS: u32 = 256;
/// Largest work-group count per launch axis
/// (`max_compute_workgroups_per_dimension` of the default wgpu limits).
/// Longer 1D launches fold onto y and rebuild the linear group index.
pub const MAX_GROUPS_PER_AXIS: u32 = 65_535;

/// Every kernel the pipelines launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelId {
    /// Fill a word range with a value.
    BufferClear,
    /// Turn the compacted vertex count into per-vertex dispatch and draw records.
    DispatchArgDivide,
    /// Scatter particles into cells and mark non-empty blocks.
    BilevelGrid,
    /// Compact surface blocks and emit the cell/half-block dispatch records.
    SurfaceBlockDetection,
    /// Flag grid vertices of boundary cells.
    SurfaceCellDetection,
    /// Compact flagged vertices into a dense list.
    SurfaceVertexCompaction,
    /// Evaluate the density field at compacted vertices.
    SurfaceVertexDensity,
    /// Evaluate the normal and surface offset at compacted vertices.
    SurfaceVertexNormal,
    /// Point draw of the compacted surface vertices.
    SurfaceDraw,
    /// Size the per-particle binning dispatches from the slot counter.
    SetIndirectArgs,
    /// Count particles per bin.
    BukkitCount,
    /// Exclusive prefix sum over bin counts and thread-data emission.
    BukkitAllocate,
    /// Insert particle indices into their bin's reserved range.
    BukkitInsert,
    /// Spawn requested particles, reusing free slots first.
    Emission,
    /// Destroy requested particles and push their slots on the free list.
    ParticleRelease,
    /// Simulation step over binned particles.
    G2P2G,
}

/// Pipeline stage a kernel runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Compute dispatch.
    Compute,
    /// Render pass (vertex pulling from storage buffers).
    Render,
}

/// One entry of a kernel's binding list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDecl {
    /// Name used in the WGSL source.
    pub name: &'static str,
    /// Declared access.
    pub access: Access,
}

/// Static description of a kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelDesc {
    /// Debug label.
    pub label: &'static str,
    /// WGSL entry point.
    pub entry_point: &'static str,
    /// Stage the kernel runs in.
    pub stage: Stage,
    /// Threads per work group (x only, all kernels are 1D).
    pub workgroup_size: u32,
    /// Ordered storage bindings.
    pub bindings: &'static [BindingDecl],
    /// Constant block size in bytes, 0 for none.
    pub constants_size: usize,
}

const fn ro(name: &'static str) -> BindingDecl {
    BindingDecl {
        name,
        access: Access::Read,
    }
}

const fn rw(name: &'static str) -> BindingDecl {
    BindingDecl {
        name,
        access: Access::ReadWrite,
    }
}

const GRID_SIZE: usize = std::mem::size_of::<GridConstants>();
const SIM_SIZE: usize = std::mem::size_of::<SimConstants>();

impl KernelId {
    /// All kernels, in pipeline order.
    pub const ALL: [KernelId; 16] = [
        KernelId::BufferClear,
        KernelId::DispatchArgDivide,
        KernelId::BilevelGrid,
        KernelId::SurfaceBlockDetection,
        KernelId::SurfaceCellDetection,
        KernelId::SurfaceVertexCompaction,
        KernelId::SurfaceVertexDensity,
        KernelId::SurfaceVertexNormal,
        KernelId::SurfaceDraw,
        KernelId::SetIndirectArgs,
        KernelId::BukkitCount,
        KernelId::BukkitAllocate,
        KernelId::BukkitInsert,
        KernelId::Emission,
        KernelId::ParticleRelease,
        KernelId::G2P2G,
    ];

    /// Static description of this kernel.
    pub fn desc(self) -> &'static KernelDesc {
        match self {
            KernelId::BufferClear => &BUFFER_CLEAR,
            KernelId::DispatchArgDivide => &DISPATCH_ARG_DIVIDE,
            KernelId::BilevelGrid => &BILEVEL_GRID,
            KernelId::SurfaceBlockDetection => &SURFACE_BLOCK_DETECTION,
            KernelId::SurfaceCellDetection => &SURFACE_CELL_DETECTION,
            KernelId::SurfaceVertexCompaction => &SURFACE_VERTEX_COMPACTION,
            KernelId::SurfaceVertexDensity => &SURFACE_VERTEX_DENSITY,
            KernelId::SurfaceVertexNormal => &SURFACE_VERTEX_NORMAL,
            KernelId::SurfaceDraw => &SURFACE_DRAW,
            KernelId::SetIndirectArgs => &SET_INDIRECT_ARGS,
            KernelId::BukkitCount => &BUKKIT_COUNT,
            KernelId::BukkitAllocate => &BUKKIT_ALLOCATE,
            KernelId::BukkitInsert => &BUKKIT_INSERT,
            KernelId::Emission => &EMISSION,
            KernelId::ParticleRelease => &PARTICLE_RELEASE,
            KernelId::G2P2G => &G2P2G,
        }
    }
}

impl KernelDesc {
    /// Check a recorded pass against this description.
    pub fn check(&self, pass: &Pass) -> Result<()> {
        let mismatch = |reason: String| Error::BindingMismatch {
            kernel: self.label,
            reason,
        };
        if pass.bindings.len() != self.bindings.len() {
            return Err(mismatch(format!(
                "expected {} bindings, got {}",
                self.bindings.len(),
                pass.bindings.len()
            )));
        }
        for (slot, (decl, view)) in self.bindings.iter().zip(&pass.bindings).enumerate() {
            if decl.access != view.access {
                return Err(mismatch(format!(
                    "binding {slot} (`{}`) declared {:?}, bound {:?}",
                    decl.name, decl.access, view.access
                )));
            }
            if view.size == 0 {
                return Err(mismatch(format!("binding {slot} (`{}`) is empty", decl.name)));
            }
        }
        if pass.constants.len() != self.constants_size {
            return Err(mismatch(format!(
                "constant block is {} bytes, expected {}",
                pass.constants.len(),
                self.constants_size
            )));
        }
        let shape_ok = match (self.stage, &pass.shape) {
            (Stage::Compute, DispatchShape::Direct(_) | DispatchShape::Indirect(_)) => true,
            (Stage::Render, DispatchShape::DrawIndirect(_)) => true,
            _ => false,
        };
        if !shape_ok {
            return Err(mismatch(format!(
                "{:?} kernel cannot launch with {:?}",
                self.stage, pass.shape
            )));
        }
        if let DispatchShape::Direct(groups) = pass.shape {
            if groups.iter().any(|&g| g > MAX_GROUPS_PER_AXIS) {
                return Err(mismatch(format!(
                    "launch of {groups:?} groups exceeds {MAX_GROUPS_PER_AXIS} per axis"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Binding tables
// ---------------------------------------------------------------------------

static BUFFER_CLEAR: KernelDesc = KernelDesc {
    label: "buffer_clear",
    entry_point: "buffer_clear",
    stage: Stage::Compute,
    workgroup_size: CLEAR_THREADS,
    bindings: &[rw("target")],
    constants_size: std::mem::size_of::<ClearConstants>(),
};

static DISPATCH_ARG_DIVIDE: KernelDesc = KernelDesc {
    label: "dispatch_arg_divide",
    entry_point: "dispatch_arg_divide",
    stage: Stage::Compute,
    workgroup_size: 1,
    bindings: &[ro("vertex_count"), rw("vertex_dispatch"), rw("draw_args")],
    constants_size: std::mem::size_of::<DivideConstants>(),
};

static BILEVEL_GRID: KernelDesc = KernelDesc {
    label: "bilevel_grid",
    entry_point: "bilevel_grid",
    stage: Stage::Compute,
    workgroup_size: PARTICLE_THREADS,
    bindings: &[
        ro("positions"),
        rw("cell_counts"),
        rw("cell_indices"),
        rw("block_cells"),
        rw("overflow"),
    ],
    constants_size: GRID_SIZE,
};

static SURFACE_BLOCK_DETECTION: KernelDesc = KernelDesc {
    label: "surface_block_detection",
    entry_point: "surface_block_detection",
    stage: Stage::Compute,
    workgroup_size: BLOCK_THREADS,
    bindings: &[
        ro("block_cells"),
        rw("surface_blocks"),
        rw("surface_block_count"),
        rw("surface_dispatch"),
    ],
    constants_size: GRID_SIZE,
};

static SURFACE_CELL_DETECTION: KernelDesc = KernelDesc {
    label: "surface_cell_detection",
    entry_point: "surface_cell_detection",
    stage: Stage::Compute,
    workgroup_size: crate::surface::CELLS_PER_BLOCK,
    bindings: &[
        ro("cell_counts"),
        ro("surface_blocks"),
        ro("surface_block_count"),
        rw("vertex_flags"),
    ],
    constants_size: GRID_SIZE,
};

static SURFACE_VERTEX_COMPACTION: KernelDesc = KernelDesc {
    label: "surface_vertex_compaction",
    entry_point: "surface_vertex_compaction",
    stage: Stage::Compute,
    workgroup_size: HALF_BLOCK_THREADS,
    bindings: &[
        ro("surface_blocks"),
        ro("surface_block_count"),
        rw("vertex_flags"),
        rw("vertex_indices"),
        rw("vertex_count"),
    ],
    constants_size: GRID_SIZE,
};

static SURFACE_VERTEX_DENSITY: KernelDesc = KernelDesc {
    label: "surface_vertex_density",
    entry_point: "surface_vertex_density",
    stage: Stage::Compute,
    workgroup_size: VERTEX_THREADS,
    bindings: &[
        ro("positions"),
        ro("cell_counts"),
        ro("cell_indices"),
        ro("vertex_indices"),
        ro("vertex_count"),
        rw("vertex_density"),
    ],
    constants_size: GRID_SIZE,
};

static SURFACE_VERTEX_NORMAL: KernelDesc = KernelDesc {
    label: "surface_vertex_normal",
    entry_point: "surface_vertex_normal",
    stage: Stage::Compute,
    workgroup_size: VERTEX_THREADS,
    bindings: &[
        ro("positions"),
        ro("cell_counts"),
        ro("cell_indices"),
        ro("vertex_indices"),
        ro("vertex_count"),
        ro("vertex_density"),
        rw("vertex_normals"),
    ],
    constants_size: GRID_SIZE,
};

static SURFACE_DRAW: KernelDesc = KernelDesc {
    label: "surface_draw",
    entry_point: "surface_draw",
    stage: Stage::Render,
    workgroup_size: 1,
    bindings: &[ro("vertex_indices"), ro("vertex_normals")],
    constants_size: std::mem::size_of::<CameraConstants>(),
};

static SET_INDIRECT_ARGS: KernelDesc = KernelDesc {
    label: "set_indirect_args",
    entry_point: "set_indirect_args",
    stage: Stage::Compute,
    workgroup_size: 1,
    bindings: &[ro("slot_count"), rw("particle_dispatch")],
    constants_size: SIM_SIZE,
};

static BUKKIT_COUNT: KernelDesc = KernelDesc {
    label: "bukkit_count",
    entry_point: "bukkit_count",
    stage: Stage::Compute,
    workgroup_size: PARTICLE_THREADS,
    bindings: &[
        ro("slot_count"),
        ro("particles"),
        ro("positions"),
        rw("bukkit_counts"),
    ],
    constants_size: SIM_SIZE,
};

static BUKKIT_ALLOCATE: KernelDesc = KernelDesc {
    label: "bukkit_allocate",
    entry_point: "bukkit_allocate",
    stage: Stage::Compute,
    workgroup_size: ALLOCATE_THREADS,
    bindings: &[
        ro("bukkit_counts"),
        rw("index_start"),
        rw("insert_counters"),
        rw("thread_data"),
        rw("sim_dispatch"),
    ],
    constants_size: SIM_SIZE,
};

static BUKKIT_INSERT: KernelDesc = KernelDesc {
    label: "bukkit_insert",
    entry_point: "bukkit_insert",
    stage: Stage::Compute,
    workgroup_size: PARTICLE_THREADS,
    bindings: &[
        ro("slot_count"),
        ro("particles"),
        ro("positions"),
        ro("bukkit_counts"),
        ro("index_start"),
        rw("insert_counters"),
        rw("bukkit_indices"),
        rw("overflow"),
        rw("positions_out"),
    ],
    constants_size: SIM_SIZE,
};

static EMISSION: KernelDesc = KernelDesc {
    label: "emission",
    entry_point: "emission",
    stage: Stage::Compute,
    workgroup_size: PARTICLE_THREADS,
    bindings: &[
        ro("request_counts"),
        ro("spawn_requests"),
        rw("particles"),
        rw("positions"),
        rw("free_count"),
        rw("free_indices"),
        rw("slot_count"),
        rw("counters"),
    ],
    constants_size: SIM_SIZE,
};

static PARTICLE_RELEASE: KernelDesc = KernelDesc {
    label: "particle_release",
    entry_point: "particle_release",
    stage: Stage::Compute,
    workgroup_size: PARTICLE_THREADS,
    bindings: &[
        ro("request_counts"),
        ro("kill_requests"),
        ro("slot_count"),
        rw("particles"),
        rw("positions"),
        rw("free_count"),
        rw("free_indices"),
    ],
    constants_size: SIM_SIZE,
};

static G2P2G: KernelDesc = KernelDesc {
    label: "g2p2g",
    entry_point: "g2p2g",
    stage: Stage::Compute,
    workgroup_size: crate::bukkit::PARTICLES_PER_THREAD_DATA,
    bindings: &[
        ro("positions"),
        ro("bukkit_counts"),
        ro("index_start"),
        ro("bukkit_indices"),
        ro("thread_data"),
        ro("shapes"),
        rw("particles"),
        rw("positions_out"),
        rw("free_count"),
        rw("free_indices"),
    ],
    constants_size: SIM_SIZE,
};

// ---------------------------------------------------------------------------
// Constant blocks. Field order must match the WGSL structs exactly.
// ---------------------------------------------------------------------------

/// Constants of [`KernelId::BufferClear`].
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClearConstants {
    /// Number of 32-bit words to fill.
    pub count: u32,
    /// Fill value.
    pub value: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

/// Constants of [`KernelId::DispatchArgDivide`].
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DivideConstants {
    /// Threads per group of the consuming kernels.
    pub divisor: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

/// Surface extraction grid parameters, shared by the six surface stages.
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GridConstants {
    /// Number of entries in the position array.
    pub num_particles: u32,
    /// Cells along x.
    pub grid_dim_x: u32,
    /// Cells along y.
    pub grid_dim_y: u32,
    /// Cells along z.
    pub grid_dim_z: u32,
    /// World-space grid origin.
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    /// Cell edge length.
    pub resolution: f32,
    /// Density contributed by one particle at the kernel peak, relative.
    pub kernel_scale: f32,
    /// Support radius of the density kernel.
    pub kernel_radius: f32,
    /// Density value of the extracted isosurface.
    pub isovalue: f32,
    pub _pad0: u32,
}

impl GridConstants {
    /// Cell counts per axis.
    pub fn grid_dim(&self) -> [u32; 3] {
        [self.grid_dim_x, self.grid_dim_y, self.grid_dim_z]
    }

    /// Grid origin.
    pub fn min_bounds(&self) -> [f32; 3] {
        [self.min_x, self.min_y, self.min_z]
    }
}

/// Simulation parameters, shared by the particle lifecycle and binning
/// kernels. Positions are in grid units: cell `c` spans `[c, c + 1)`.
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SimConstants {
    /// Simulation grid cells along x.
    pub grid_x: u32,
    pub grid_y: u32,
    pub grid_z: u32,
    /// Capacity of the particle arrays.
    pub max_particles: u32,
    /// Bins along x.
    pub bukkit_x: u32,
    pub bukkit_y: u32,
    pub bukkit_z: u32,
    /// Maximum particles stored per bin.
    pub bukkit_capacity: u32,
    /// Substep length in seconds.
    pub dt: f32,
    /// Gravity in grid cells per second squared.
    pub gravity_x: f32,
    pub gravity_y: f32,
    pub gravity_z: f32,
    /// Fraction of the overlap resolved per substep.
    pub liquid_relaxation: f32,
    /// Velocity damping per substep.
    pub liquid_viscosity: f32,
    /// Tangential damping inside the guardian band.
    pub border_friction: f32,
    /// Rest distance between neighboring particles, in cells.
    pub particle_radius: f32,
    /// Number of entries in the shape buffer.
    pub shape_count: u32,
    /// Width of the guardian band along the grid border, in cells.
    pub guardian_size: u32,
    /// Current substep index.
    pub substep: u32,
    pub _pad0: u32,
}

impl SimConstants {
    /// Total number of bins.
    pub fn bukkit_count(&self) -> u32 {
        self.bukkit_x * self.bukkit_y * self.bukkit_z
    }
}

/// Camera and lattice parameters of [`KernelId::SurfaceDraw`].
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraConstants {
    /// Column-major view-projection matrix.
    pub view_proj: [[f32; 4]; 4],
    /// Grid origin.
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    /// Cell edge length.
    pub resolution: f32,
    /// Cells along x (the vertex lattice has one more per axis).
    pub grid_dim_x: u32,
    pub grid_dim_y: u32,
    pub grid_dim_z: u32,
    pub _pad0: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferDesc, BufferId, GpuBuffer};

    #[test]
    fn constant_blocks_are_sixteen_byte_multiples() {
        for id in KernelId::ALL {
            assert_eq!(id.desc().constants_size % 16, 0, "{:?}", id);
        }
        assert_eq!(std::mem::size_of::<GridConstants>(), 48);
        assert_eq!(std::mem::size_of::<SimConstants>(), 80);
        assert_eq!(std::mem::size_of::<CameraConstants>(), 96);
    }

    #[test]
    fn entry_points_are_unique() {
        let mut names: Vec<_> = KernelId::ALL.iter().map(|k| k.desc().entry_point).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), KernelId::ALL.len());
    }

    #[test]
    fn check_rejects_swapped_bindings() {
        let a = GpuBuffer::new(BufferId(0), &BufferDesc::of::<u32>("a", 4));
        let b = GpuBuffer::new(BufferId(1), &BufferDesc::of::<u32>("b", 4));
        let good = Pass::new(KernelId::DispatchArgDivide)
            .bind(a.read_view())
            .bind(b.write_view())
            .bind(b.write_view())
            .constants(&DivideConstants::default())
            .groups(1);
        assert!(KernelId::DispatchArgDivide.desc().check(&good).is_ok());

        let swapped = Pass::new(KernelId::DispatchArgDivide)
            .bind(b.write_view())
            .bind(a.read_view())
            .bind(b.write_view())
            .constants(&DivideConstants::default())
            .groups(1);
        assert!(matches!(
            KernelId::DispatchArgDivide.desc().check(&swapped),
            Err(Error::BindingMismatch { .. })
        ));
    }

    #[test]
    fn check_rejects_wrong_constant_size() {
        let a = GpuBuffer::new(BufferId(0), &BufferDesc::of::<u32>("a", 4));
        let pass = Pass::new(KernelId::BufferClear)
            .bind(a.write_view())
            .constants(&DivideConstants::default())
            .groups(1);
        assert!(KernelId::BufferClear.desc().check(&pass).is_ok());
        let pass = Pass::new(KernelId::BufferClear)
            .bind(a.write_view())
            .constants(&GridConstants::default())
            .groups(1);
        assert!(KernelId::BufferClear.desc().check(&pass).is_err());
    }

    #[test]
    fn check_rejects_unfolded_direct_launches() {
        let a = GpuBuffer::new(BufferId(0), &BufferDesc::of::<u32>("a", 4));
        let clear = Pass::new(KernelId::BufferClear)
            .bind(a.write_view())
            .constants(&ClearConstants::default());
        let long = clear.clone().direct([MAX_GROUPS_PER_AXIS + 1, 1, 1]);
        assert!(matches!(
            KernelId::BufferClear.desc().check(&long),
            Err(Error::BindingMismatch { .. })
        ));
        let folded = clear.groups(MAX_GROUPS_PER_AXIS + 1);
        assert!(KernelId::BufferClear.desc().check(&folded).is_ok());
    }
}
