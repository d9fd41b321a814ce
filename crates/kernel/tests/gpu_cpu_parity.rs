//! GPU vs CPU parity.
//!
//! Runs the same binning and surface extraction on the CPU reference device
//! and on the wgpu device, then compares the outputs. Compaction order and
//! float summation order differ between the two, so vertex sets are
//! compared as sets and densities within a tolerance.
//!
//! Gated behind `#[cfg(feature = "gpu")]`; skipped when no adapter exists.

#![cfg(feature = "gpu")]

use std::collections::BTreeSet;

use kernel::gpu::gpu_available;
use kernel::{
    ComputeContext, ComputeDevice, CpuDevice, GridConstants, Material, Particle, ParticleArena, ParticleSimulation,
    SimulationParams, SurfaceExtraction, SurfaceSnapshot, WgpuDevice,
};

fn blob() -> Vec<[f32; 4]> {
    let mut positions = Vec::new();
    for z in 0..10 {
        for y in 0..8 {
            for x in 0..10 {
                let r = ((x * 7 + y * 3 + z * 5) % 11) as f32 / 11.0;
                positions.push([2.0 + x as f32 * 0.6 + 0.1 * r, 2.0 + y as f32 * 0.6, 2.0 + z as f32 * 0.6 - 0.1 * r, 1.0]);
            }
        }
    }
    positions
}

fn surface<D: ComputeDevice>(device: D, positions: &[[f32; 4]]) -> SurfaceSnapshot {
    let mut ctx = ComputeContext::new(device);
    let grid = GridConstants {
        grid_dim_x: 12,
        grid_dim_y: 12,
        grid_dim_z: 12,
        resolution: 0.75,
        kernel_scale: 1.0,
        kernel_radius: 1.5,
        isovalue: 0.5,
        ..Default::default()
    };
    let buffer = ctx.create_buffer_init("positions", positions).unwrap();
    let surface = SurfaceExtraction::new(&mut ctx, grid).unwrap();
    surface.compute(&mut ctx, &buffer, positions.len() as u32).unwrap();
    let snap = surface.snapshot(&mut ctx).unwrap();
    surface.release(&mut ctx).unwrap();
    snap
}

#[test]
fn surface_extraction_matches_cpu() {
    if !gpu_available() {
        eprintln!("no GPU adapter, skipping");
        return;
    }
    let positions = blob();
    let cpu = surface(CpuDevice::with_validation().unwrap(), &positions);
    let gpu = surface(WgpuDevice::new().unwrap(), &positions);

    assert_eq!(cpu.cell_counts, gpu.cell_counts);
    assert_eq!(cpu.overflow, gpu.overflow);
    let a: BTreeSet<u32> = cpu.surface_blocks.iter().copied().collect();
    let b: BTreeSet<u32> = gpu.surface_blocks.iter().copied().collect();
    assert_eq!(a, b);
    assert_eq!(cpu.draw, gpu.draw);
    assert_eq!(cpu.vertex_dispatch, gpu.vertex_dispatch);

    let cpu_density = cpu.density_by_vertex();
    let gpu_density = gpu.density_by_vertex();
    assert_eq!(
        cpu_density.keys().collect::<Vec<_>>(),
        gpu_density.keys().collect::<Vec<_>>()
    );
    for (v, a) in &cpu_density {
        let b = gpu_density[v];
        assert!((a - b).abs() <= 1.0e-3 * a.abs().max(1.0), "vertex {v}: cpu {a} gpu {b}");
    }
}

#[test]
fn binned_simulation_matches_cpu() {
    if !gpu_available() {
        eprintln!("no GPU adapter, skipping");
        return;
    }
    let params = SimulationParams {
        grid: [24, 24, 24],
        max_particles: 1024,
        substeps: 1,
        ..Default::default()
    };
    let mut arena = ParticleArena::with_capacity(1024);
    for p in blob() {
        arena.spawn([p[0] * 2.0, p[1] * 2.0, p[2] * 2.0], Particle::new(1.0, Material::Liquid));
    }

    fn run<D: ComputeDevice>(device: D, params: SimulationParams, arena: &ParticleArena) -> (Vec<u32>, u32) {
        let mut ctx = ComputeContext::new(device);
        let mut sim = ParticleSimulation::new(&mut ctx, params, arena, &[]).unwrap();
        sim.destroy(3);
        sim.spawn([12.0, 12.0, 12.0], Material::Liquid);
        sim.compute(&mut ctx).unwrap();
        let bins = sim.bukkit_snapshot(&mut ctx).unwrap();
        let snap = sim.snapshot(&mut ctx).unwrap();
        (bins.counts, snap.slot_count)
    }

    let (cpu_counts, cpu_slots) = run(CpuDevice::with_validation().unwrap(), params, &arena);
    let (gpu_counts, gpu_slots) = run(WgpuDevice::new().unwrap(), params, &arena);
    assert_eq!(cpu_slots, gpu_slots);
    assert_eq!(cpu_counts, gpu_counts);
}
