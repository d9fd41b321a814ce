//! Launches longer than one axis of work groups.
//!
//! Device-written records fold onto y once x reaches the per-axis limit, and
//! the consuming kernels still reach every logical group.

use kernel::bukkit::GUARDIAN_SIZE;
use kernel::kernels::{BLOCK_THREADS, MAX_GROUPS_PER_AXIS};
use kernel::{
    ComputeContext, CpuDevice, DispatchArgs, GridConstants, KernelId, Material, Particle, ParticleArena,
    ParticleSimulation, Pass, SimulationParams,
};

#[test]
fn surface_block_records_fold_past_one_axis() {
    // 256 x 1 x 256 blocks, each holding one filled cell: all are surface blocks.
    let dim = [1024u32, 4, 1024];
    let blocks = 256 * 256u64;
    let grid = GridConstants {
        grid_dim_x: dim[0],
        grid_dim_y: dim[1],
        grid_dim_z: dim[2],
        resolution: 1.0,
        kernel_scale: 1.0,
        kernel_radius: 2.0,
        isovalue: 0.5,
        ..Default::default()
    };
    let cells = dim.iter().map(|&d| d as u64).product::<u64>();
    let vertices = dim.iter().map(|&d| d as u64 + 1).product::<u64>();
    let cell_index = |x: u32, y: u32, z: u32| (x + dim[0] * (y + dim[1] * z)) as usize;
    let vertex_index = |x: u32, y: u32, z: u32| (x + (dim[0] + 1) * (y + (dim[1] + 1) * z)) as usize;

    let mut counts = vec![0u32; cells as usize];
    counts[cell_index(0, 0, 0)] = 1;
    counts[cell_index(1023, 3, 1023)] = 1;

    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let block_cells = ctx.create_buffer_init("block_cells", &vec![1u32; blocks as usize]).unwrap();
    let cell_counts = ctx.create_buffer_init("cell_counts", &counts).unwrap();
    let surface_blocks = ctx.create_buffer_zeroed::<u32>("surface_blocks", blocks).unwrap();
    let surface_block_count = ctx.create_buffer_zeroed::<u32>("surface_block_count", 1).unwrap();
    let records = ctx.create_buffer_zeroed::<DispatchArgs>("surface_dispatch", 2).unwrap();
    let flags = ctx.create_buffer_zeroed::<u32>("vertex_flags", vertices).unwrap();

    ctx.dispatch(
        Pass::new(KernelId::SurfaceBlockDetection)
            .bind(block_cells.read_view())
            .bind(surface_blocks.write_view())
            .bind(surface_block_count.write_view())
            .bind(records.write_view())
            .constants(&grid)
            .groups((blocks as u32).div_ceil(BLOCK_THREADS)),
    )
    .unwrap();
    ctx.dispatch(
        Pass::new(KernelId::SurfaceCellDetection)
            .bind(cell_counts.read_view())
            .bind(surface_blocks.read_view())
            .bind(surface_block_count.read_view())
            .bind(flags.write_view())
            .constants(&grid)
            .indirect(records.raw_address()),
    )
    .unwrap();
    ctx.flush().unwrap();

    assert_eq!(ctx.read_buffer::<u32>(&surface_block_count).unwrap(), vec![blocks as u32]);
    let records = ctx.read_buffer::<DispatchArgs>(&records).unwrap();
    assert_eq!(records[0], DispatchArgs { x: MAX_GROUPS_PER_AXIS, y: 2, z: 1 });
    assert_eq!(records[1], DispatchArgs { x: MAX_GROUPS_PER_AXIS, y: 3, z: 1 });
    assert!(records[0].groups() >= blocks);
    assert!(records[1].groups() >= 2 * blocks);

    let mut listed = ctx.read_buffer::<u32>(&surface_blocks).unwrap();
    listed.sort_unstable();
    assert!(listed.iter().copied().eq(0..blocks as u32), "every block listed once");

    // Both filled cells were reached, wherever their blocks were compacted.
    let flags = ctx.read_buffer::<u32>(&flags).unwrap();
    assert_eq!(flags[vertex_index(0, 0, 0)], 1);
    assert_eq!(flags[vertex_index(1024, 4, 1024)], 1);
    assert_eq!(flags.iter().filter(|&&f| f != 0).count(), 16);
}

#[test]
fn simulation_steps_every_particle_past_one_axis_of_entries() {
    const COUNT: usize = 70_000;
    let params = SimulationParams {
        grid: [128, 64, 128],
        max_particles: COUNT as u32,
        substeps: 1,
        gravity: [0.0, -1000.0, 0.0],
        ..Default::default()
    };

    // One particle per bin, clear of the guardian band, so every bin is
    // its own thread-data entry.
    let mut arena = ParticleArena::with_capacity(COUNT);
    'fill: for by in 2..30u32 {
        for bz in 2..62u32 {
            for bx in 2..62u32 {
                if arena.slot_count() == COUNT {
                    break 'fill;
                }
                let p = [2.0 * bx as f32 + 1.0, 2.0 * by as f32 + 1.0, 2.0 * bz as f32 + 1.0];
                arena.spawn(p, Particle::new(1.0, Material::Liquid));
            }
        }
    }
    assert_eq!(arena.slot_count(), COUNT);
    let before: Vec<[f32; 4]> = arena.positions().to_vec();

    let mut ctx = ComputeContext::new(CpuDevice::with_validation().unwrap());
    let mut sim = ParticleSimulation::new(&mut ctx, params, &arena, &[]).unwrap();
    sim.compute(&mut ctx).unwrap();

    let bins = sim.bukkit_snapshot(&mut ctx).unwrap();
    assert_eq!(bins.sim_dispatch, DispatchArgs { x: MAX_GROUPS_PER_AXIS, y: 2, z: 1 });
    assert_eq!(bins.thread_data.len(), COUNT);

    let snap = sim.snapshot(&mut ctx).unwrap();
    assert_eq!(snap.positions.len(), COUNT);
    for (slot, (a, b)) in before.iter().zip(&snap.positions).enumerate() {
        assert!(b[1] < a[1], "slot {slot} did not fall: {a:?} -> {b:?}");
        assert!(b[1] >= GUARDIAN_SIZE as f32);
    }
}
