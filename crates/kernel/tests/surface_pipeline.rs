//! Surface extraction over a cube of fluid.
//!
//! A 12^3 grid whose central 9^3 cells hold 4 particles each (2916 in all).
//! Checks the compacted vertex set, the chained launch records and the
//! point draw against what the data says they must be.

use std::collections::HashSet;

use kernel::{ComputeContext, CpuDevice, GridConstants, SubmitPolicy, SurfaceExtraction, SurfaceSnapshot};

const DIM: u32 = 12;
const FILLED: std::ops::Range<u32> = 1..10;

fn grid() -> GridConstants {
    GridConstants {
        grid_dim_x: DIM,
        grid_dim_y: DIM,
        grid_dim_z: DIM,
        resolution: 1.0,
        kernel_scale: 1.0,
        kernel_radius: 2.0,
        isovalue: 0.5,
        ..Default::default()
    }
}

fn fluid_cube() -> Vec<[f32; 4]> {
    const OFFSETS: [[f32; 3]; 4] = [
        [0.25, 0.25, 0.25],
        [0.75, 0.75, 0.25],
        [0.75, 0.25, 0.75],
        [0.25, 0.75, 0.75],
    ];
    let mut positions = Vec::new();
    for z in FILLED {
        for y in FILLED {
            for x in FILLED {
                for o in OFFSETS {
                    positions.push([x as f32 + o[0], y as f32 + o[1], z as f32 + o[2], 1.0]);
                }
            }
        }
    }
    positions
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn extract(ctx: &mut ComputeContext<CpuDevice>, positions: &[[f32; 4]]) -> (SurfaceExtraction, SurfaceSnapshot) {
    init_tracing();
    let buffer = ctx.create_buffer_init("positions", positions).unwrap();
    let surface = SurfaceExtraction::new(ctx, grid()).unwrap();
    surface.compute(ctx, &buffer, positions.len() as u32).unwrap();
    let snap = surface.snapshot(ctx).unwrap();
    (surface, snap)
}

fn vertex(x: u32, y: u32, z: u32) -> u32 {
    x + (DIM + 1) * (y + (DIM + 1) * z)
}

#[test]
fn cube_produces_a_closed_vertex_shell() {
    let positions = fluid_cube();
    assert_eq!(positions.len(), 2916);
    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let (_, snap) = extract(&mut ctx, &positions);

    assert_eq!(snap.overflow, 0);
    assert_eq!(snap.cell_counts.iter().map(|&c| c as usize).sum::<usize>(), 2916);

    let count = snap.vertex_indices.len();
    assert!(count > 0);
    assert!(count <= 13 * 13 * 13);
    let unique: HashSet<u32> = snap.vertex_indices.iter().copied().collect();
    assert_eq!(unique.len(), count, "a vertex was compacted twice");

    // Corners of boundary cells are in, vertices deep inside are not.
    assert!(unique.contains(&vertex(1, 1, 1)));
    assert!(unique.contains(&vertex(10, 10, 10)));
    assert!(unique.contains(&vertex(1, 6, 6)));
    assert!(!unique.contains(&vertex(6, 6, 6)));
    assert!(!unique.contains(&vertex(0, 0, 0)));
}

#[test]
fn launch_records_match_the_data_they_size() {
    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let (_, snap) = extract(&mut ctx, &fluid_cube());

    let blocks = snap.surface_blocks.len() as u32;
    assert!(blocks > 0);
    assert_eq!(snap.block_dispatch.x, blocks);
    assert_eq!([snap.block_dispatch.y, snap.block_dispatch.z], [1, 1]);
    assert_eq!(snap.half_block_dispatch.x, 2 * blocks);

    let count = snap.vertex_indices.len() as u32;
    for record in snap.vertex_dispatch {
        assert_eq!(record.x, count.div_ceil(64));
        assert_eq!([record.y, record.z], [1, 1]);
    }
    assert_eq!(snap.draw.vertex_count, count);
    assert_eq!(snap.draw.instance_count, 1);
}

#[test]
fn extraction_is_repeatable() {
    let positions = fluid_cube();
    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let buffer = ctx.create_buffer_init("positions", &positions).unwrap();
    let surface = SurfaceExtraction::new(&mut ctx, grid()).unwrap();

    surface.compute(&mut ctx, &buffer, positions.len() as u32).unwrap();
    let first = surface.snapshot(&mut ctx).unwrap().density_by_vertex();
    surface.compute(&mut ctx, &buffer, positions.len() as u32).unwrap();
    let second = surface.snapshot(&mut ctx).unwrap().density_by_vertex();

    assert_eq!(first.len(), second.len());
    for (v, a) in &first {
        let b = second[v];
        assert!((a - b).abs() <= 1.0e-4 * a.abs().max(1.0), "vertex {v}: {a} vs {b}");
    }
}

#[test]
fn per_stage_submission_matches_per_frame() {
    let positions = fluid_cube();
    let mut frame = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let mut stage = ComputeContext::new(CpuDevice::with_validation().unwrap()).with_policy(SubmitPolicy::PerStage, 2);
    let (_, a) = extract(&mut frame, &positions);
    let (_, b) = extract(&mut stage, &positions);
    assert!(stage.stats().submissions > frame.stats().submissions);

    let a: HashSet<u32> = a.vertex_indices.into_iter().collect();
    let b: HashSet<u32> = b.vertex_indices.into_iter().collect();
    assert_eq!(a, b);
}

#[test]
fn normals_point_out_of_the_fluid() {
    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let (_, snap) = extract(&mut ctx, &fluid_cube());
    let at = snap
        .vertex_indices
        .iter()
        .position(|&v| v == vertex(1, 6, 6))
        .unwrap();
    let n = snap.normals[at];
    assert!(n[0] < -0.7, "normal {n:?}");
    assert!(n[0].abs() > n[1].abs() && n[0].abs() > n[2].abs(), "normal {n:?}");
    assert!(n[3].abs() <= 0.5);
    assert!(snap.densities[at] > 0.0);
}

#[test]
fn empty_input_yields_empty_launches() {
    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let (_, snap) = extract(&mut ctx, &[[-5.0, -5.0, -5.0, 1.0]]);
    assert!(snap.vertex_indices.is_empty());
    assert!(snap.surface_blocks.is_empty());
    assert_eq!(snap.block_dispatch.x, 0);
    assert_eq!(snap.vertex_dispatch[0].x, 0);
    assert_eq!(snap.draw.vertex_count, 0);
}

#[test]
fn draw_consumes_the_device_written_record() {
    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let (surface, snap) = extract(&mut ctx, &fluid_cube());
    let identity = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];
    surface.draw(&mut ctx, identity).unwrap();
    ctx.submit_and_wait().unwrap();
    assert_eq!(ctx.stats().draws, 1);

    let draws = ctx.device().take_draws();
    assert_eq!(draws.len(), 1);
    let draw = &draws[0];
    assert_eq!(draw.args.vertex_count as usize, snap.vertex_indices.len());
    assert_eq!(draw.clip_positions.len(), snap.vertex_indices.len());
    for (clip, n) in draw.clip_positions.iter().zip(&snap.normals) {
        assert_eq!(clip[3], 1.0);
        assert!(clip[0] >= -0.5 - 1.0e-4 && clip[0] <= 12.5 + 1.0e-4, "{clip:?} {n:?}");
    }
    surface.release(&mut ctx).unwrap();
}

#[test]
fn full_cells_keep_eight_particles_and_count_the_rest() {
    let cell = 5 + DIM * (5 + DIM * 5);
    let crowded = vec![[5.5, 5.5, 5.5, 1.0]; 12];
    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let (_, snap) = extract(&mut ctx, &crowded);

    assert_eq!(snap.cell_counts[cell as usize], 8);
    assert_eq!(snap.overflow, 4);
    for (i, &c) in snap.cell_counts.iter().enumerate() {
        if i != cell as usize {
            assert_eq!(c, 0, "cell {i} picked up a dropped particle");
        }
    }

    // The lone cell is all boundary: its eight corners, one surface block.
    let unique: HashSet<u32> = snap.vertex_indices.iter().copied().collect();
    let corners: HashSet<u32> = (0..8u32)
        .map(|k| vertex(5 + (k & 1), 5 + ((k >> 1) & 1), 5 + ((k >> 2) & 1)))
        .collect();
    assert_eq!(unique, corners);
    assert_eq!(snap.surface_blocks.len(), 1);
    assert_eq!(snap.block_dispatch.x, 1);
    assert_eq!(snap.half_block_dispatch.x, 2);
    for record in snap.vertex_dispatch {
        assert_eq!([record.x, record.y, record.z], [1, 1, 1]);
    }
    assert_eq!(snap.draw.vertex_count, 8);

    // Densities only see the stored particles.
    let mut reference = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let (_, capped) = extract(&mut reference, &crowded[..8]);
    assert_eq!(capped.overflow, 0);
    let expected = capped.density_by_vertex();
    for (v, d) in snap.density_by_vertex() {
        let e = expected[&v];
        assert!(d > 0.0);
        assert!((d - e).abs() <= 1.0e-5 * e.abs().max(1.0), "vertex {v}: {d} vs {e}");
    }
}
