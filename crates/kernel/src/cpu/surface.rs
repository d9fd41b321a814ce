//! CPU bodies of the surface extraction kernels. Binding indices follow the
//! tables in `kernels.rs`.

use super::{KernelArgs, Workgroup};
use crate::batch::{DispatchArgs, DrawArgs};
use crate::kernels::{CameraConstants, DivideConstants, GridConstants};
use crate::smoothing::{surface_normal, DensityField};
use crate::surface::{SurfaceGrid, CELLS_PER_BLOCK, MAX_PARTICLES_PER_CELL, NEIGHBOR_OFFSETS};

const CORNERS: [[u32; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

fn vec3(p: [f32; 4]) -> [f32; 3] {
    [p[0], p[1], p[2]]
}

/// positions, cell_counts, cell_indices, block_cells, overflow
pub(super) fn bilevel_grid(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: GridConstants = args.constants();
    let grid = SurfaceGrid::from_constants(&c);
    let cap = MAX_PARTICLES_PER_CELL;
    for i in wg.invocations() {
        if i >= c.num_particles {
            return;
        }
        let p: [f32; 4] = args.read(0, i as usize);
        let Some(cell) = grid.cell_of(vec3(p)) else {
            continue;
        };
        let ci = grid.cell_index(cell) as usize;
        let slot = args.atomic_add(1, ci, 1);
        if slot >= cap {
            args.atomic_sub(1, ci, 1);
            args.atomic_add(4, 0, 1);
            continue;
        }
        args.store(2, ci * cap as usize + slot as usize, i);
        if slot == 0 {
            let block = grid.block_index(grid.block_of_cell(cell)) as usize;
            args.atomic_add(3, block, 1);
        }
    }
}

/// Raise the folded launch record at word `record` of `binding` so it
/// covers at least `groups` groups. Monotonic, so concurrent raises settle
/// on the largest.
fn raise_record(args: &KernelArgs<'_>, binding: usize, record: usize, groups: u32) {
    let shape = DispatchArgs::folded(groups);
    args.atomic_max(binding, record, shape.x);
    args.atomic_max(binding, record + 1, shape.y);
    args.atomic_max(binding, record + 2, shape.z);
}

/// block_cells, surface_blocks, surface_block_count, surface_dispatch
pub(super) fn block_detection(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: GridConstants = args.constants();
    let grid = SurfaceGrid::from_constants(&c);
    for b in wg.invocations() {
        if b == 0 {
            raise_record(args, 3, 0, 0);
            raise_record(args, 3, 3, 0);
        }
        if b >= grid.block_count() {
            return;
        }
        let filled = args.load(0, b as usize);
        if filled == 0 {
            continue;
        }
        let coord = grid.block_coord(b);
        let surface = filled < CELLS_PER_BLOCK
            || NEIGHBOR_OFFSETS.iter().any(|&d| {
                match grid.neighbor_block(coord, d) {
                    Some(n) => args.load(0, grid.block_index(n) as usize) < CELLS_PER_BLOCK,
                    None => true,
                }
            });
        if surface {
            let slot = args.atomic_add(2, 0, 1);
            args.store(1, slot as usize, b);
            raise_record(args, 3, 0, slot + 1);
            raise_record(args, 3, 3, 2 * (slot + 1));
        }
    }
}

/// cell_counts, surface_blocks, surface_block_count, vertex_flags; one group
/// per surface block.
pub(super) fn cell_detection(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: GridConstants = args.constants();
    let grid = SurfaceGrid::from_constants(&c);
    let slot = wg.index();
    if slot >= args.load(2, 0) {
        return;
    }
    let block = grid.block_coord(args.load(1, slot as usize));
    for local in wg.locals() {
        let Some(cell) = grid.block_cell(block, local) else {
            continue;
        };
        if args.load(0, grid.cell_index(cell) as usize) == 0 {
            continue;
        }
        let boundary = NEIGHBOR_OFFSETS.iter().any(|&d| match grid.neighbor_cell(cell, d) {
            Some(n) => args.load(0, grid.cell_index(n) as usize) == 0,
            None => true,
        });
        if boundary {
            for corner in CORNERS {
                let v = [cell[0] + corner[0], cell[1] + corner[1], cell[2] + corner[2]];
                args.store(3, grid.vertex_index(v) as usize, 1);
            }
        }
    }
}

/// surface_blocks, surface_block_count, vertex_flags, vertex_indices,
/// vertex_count; two groups per surface block, each covering half of its
/// cells.
pub(super) fn vertex_compaction(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: GridConstants = args.constants();
    let grid = SurfaceGrid::from_constants(&c);
    let group = wg.index();
    if group / 2 >= args.load(1, 0) {
        return;
    }
    let half = group % 2;
    let block = grid.block_coord(args.load(0, (group / 2) as usize));
    for local in wg.locals() {
        let Some(cell) = grid.block_cell(block, half * wg.size + local) else {
            continue;
        };
        for corner in CORNERS {
            let v = [cell[0] + corner[0], cell[1] + corner[1], cell[2] + corner[2]];
            let v = grid.vertex_index(v);
            if args.compare_exchange(2, v as usize, 1, 2) {
                let slot = args.atomic_add(4, 0, 1);
                args.store(3, slot as usize, v);
            }
        }
    }
}

/// vertex_count, vertex_dispatch, draw_args
pub(super) fn dispatch_arg_divide(wg: Workgroup, args: &KernelArgs<'_>) {
    if wg.index() != 0 {
        return;
    }
    let c: DivideConstants = args.constants();
    let count = args.load(0, 0);
    let shape = DispatchArgs::folded(count.div_ceil(c.divisor.max(1)));
    for record in 0..2 {
        args.write(1, record, &shape);
    }
    args.write(
        2,
        0,
        &DrawArgs {
            vertex_count: count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        },
    );
}

/// Visit every particle whose cell may lie within the kernel support of
/// lattice vertex `v`.
fn for_each_neighbor(
    grid: &SurfaceGrid,
    c: &GridConstants,
    args: &KernelArgs<'_>,
    v: [u32; 3],
    mut visit: impl FnMut([f32; 3]),
) {
    let reach = (c.kernel_radius / c.resolution).ceil().max(1.0) as i64;
    let dim = grid.dim;
    let range = |axis: usize| {
        let lo = (v[axis] as i64 - reach).max(0);
        let hi = (v[axis] as i64 + reach - 1).min(dim[axis] as i64 - 1);
        lo..=hi
    };
    for z in range(2) {
        for y in range(1) {
            for x in range(0) {
                let ci = grid.cell_index([x as u32, y as u32, z as u32]) as usize;
                let n = args.load(1, ci).min(MAX_PARTICLES_PER_CELL);
                for s in 0..n as usize {
                    let idx = args.load(2, ci * MAX_PARTICLES_PER_CELL as usize + s);
                    let p: [f32; 4] = args.read(0, idx as usize);
                    visit(vec3(p));
                }
            }
        }
    }
}

fn field(c: &GridConstants) -> DensityField {
    DensityField {
        radius: c.kernel_radius,
        scale: c.kernel_scale,
    }
}

/// positions, cell_counts, cell_indices, vertex_indices, vertex_count,
/// vertex_density
pub(super) fn vertex_density(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: GridConstants = args.constants();
    let grid = SurfaceGrid::from_constants(&c);
    let field = field(&c);
    let count = args.load(4, 0);
    for i in wg.invocations() {
        if i >= count {
            return;
        }
        let v = args.load(3, i as usize);
        let at = grid.vertex_position(v);
        let mut density = 0.0;
        for_each_neighbor(&grid, &c, args, grid.vertex_coord(v), |p| {
            let d = [at[0] - p[0], at[1] - p[1], at[2] - p[2]];
            density += field.density((d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt());
        });
        args.store_f32(5, i as usize, density);
    }
}

/// positions, cell_counts, cell_indices, vertex_indices, vertex_count,
/// vertex_density, vertex_normals
pub(super) fn vertex_normal(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: GridConstants = args.constants();
    let grid = SurfaceGrid::from_constants(&c);
    let field = field(&c);
    let count = args.load(4, 0);
    for i in wg.invocations() {
        if i >= count {
            return;
        }
        let v = args.load(3, i as usize);
        let at = grid.vertex_position(v);
        let mut gradient = [0.0f32; 3];
        for_each_neighbor(&grid, &c, args, grid.vertex_coord(v), |p| {
            let d = [at[0] - p[0], at[1] - p[1], at[2] - p[2]];
            let g = field.gradient(d, (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt());
            gradient = [gradient[0] + g[0], gradient[1] + g[1], gradient[2] + g[2]];
        });
        let density = args.load_f32(5, i as usize);
        let normal = surface_normal(density, gradient, c.isovalue, c.resolution);
        args.write(6, i as usize, &normal);
    }
}

/// Vertex stage of the surface point draw: vertex_indices, vertex_normals.
pub(super) fn draw(args: &KernelArgs<'_>, record: &DrawArgs) -> Vec<[f32; 4]> {
    let c: CameraConstants = args.constants();
    let grid = SurfaceGrid {
        dim: [c.grid_dim_x, c.grid_dim_y, c.grid_dim_z],
        min: [c.min_x, c.min_y, c.min_z],
        resolution: c.resolution,
    };
    let m = c.view_proj;
    let first = record.first_vertex;
    let instances = record.instance_count.min(1);
    (first..first + record.vertex_count * instances)
        .map(|i| {
            let v = args.load(0, i as usize);
            let n: [f32; 4] = args.read(1, i as usize);
            let p = grid.vertex_position(v);
            let world = [
                p[0] + n[0] * n[3],
                p[1] + n[1] * n[3],
                p[2] + n[2] * n[3],
                1.0,
            ];
            let mut clip = [0.0f32; 4];
            for (row, out) in clip.iter_mut().enumerate() {
                *out = (0..4).map(|col| m[col][row] * world[col]).sum();
            }
            clip
        })
        .collect()
}
