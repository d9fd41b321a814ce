//! CPU bodies of the particle lifecycle, binning and simulation kernels.

use super::{KernelArgs, Workgroup};
use crate::batch::DispatchArgs;
use crate::bukkit::{bukkit_coord, BukkitThreadData, PARTICLES_PER_THREAD_DATA, PARTICLE_DISPATCH_SIZE};
use crate::kernels::SimConstants;
use crate::particle::{Material, Particle, ShapeFunction, SimShape, DISABLED_POSITION, ENABLED_WORD, PARTICLE_WORDS};

fn enabled(args: &KernelArgs<'_>, binding: usize, idx: u32) -> bool {
    args.load_f32(binding, idx as usize * PARTICLE_WORDS + ENABLED_WORD) != 0.0
}

fn position(args: &KernelArgs<'_>, binding: usize, idx: u32) -> [f32; 3] {
    let p: [f32; 4] = args.read(binding, idx as usize);
    [p[0], p[1], p[2]]
}

fn bin_index(c: &SimConstants, b: [u32; 3]) -> u32 {
    b[0] + c.bukkit_x * (b[1] + c.bukkit_y * b[2])
}

fn push_free(args: &KernelArgs<'_>, count: usize, indices: usize, idx: u32) {
    let top = args.atomic_add(count, 0, 1);
    args.store(indices, top as usize, idx);
}

/// slot_count, particle_dispatch
pub(super) fn set_indirect_args(wg: Workgroup, args: &KernelArgs<'_>) {
    if wg.index() != 0 {
        return;
    }
    let shape = DispatchArgs::folded(args.load(0, 0).div_ceil(PARTICLE_DISPATCH_SIZE));
    for record in 0..2 {
        args.write(1, record, &shape);
    }
}

/// slot_count, particles, positions, bukkit_counts
pub(super) fn count(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: SimConstants = args.constants();
    let slots = args.load(0, 0);
    for i in wg.invocations() {
        if i >= slots {
            return;
        }
        if !enabled(args, 1, i) {
            continue;
        }
        let b = bin_index(&c, bukkit_coord(position(args, 2, i), &c));
        args.atomic_add(3, b as usize, 1);
    }
}

/// bukkit_counts, index_start, insert_counters, thread_data, sim_dispatch.
/// Only the first group does any work; the scan runs sequentially here.
/// Entries past the last one, up to the folded launch size, are written
/// empty so the tail groups of the step find no particles.
pub(super) fn allocate(wg: Workgroup, args: &KernelArgs<'_>) {
    if wg.index() != 0 {
        return;
    }
    let c: SimConstants = args.constants();
    let mut running = 0u32;
    let mut entries = 0u32;
    for b in 0..c.bukkit_count() {
        let reserved = args.load(0, b as usize).min(c.bukkit_capacity);
        args.store(1, b as usize, running);
        args.store(2, b as usize, 0);
        let coord = [
            b % c.bukkit_x,
            (b / c.bukkit_x) % c.bukkit_y,
            b / (c.bukkit_x * c.bukkit_y),
        ];
        let mut offset = 0;
        while offset < reserved {
            let entry = BukkitThreadData {
                range_start: running + offset,
                range_count: (reserved - offset).min(PARTICLES_PER_THREAD_DATA),
                bukkit_x: coord[0],
                bukkit_y: coord[1],
                bukkit_z: coord[2],
            };
            args.write(3, entries as usize, &entry);
            entries += 1;
            offset += PARTICLES_PER_THREAD_DATA;
        }
        running += reserved;
    }
    let shape = DispatchArgs::folded(entries);
    for pad in entries as u64..shape.groups() {
        args.write(3, pad as usize, &BukkitThreadData::default());
    }
    args.write(4, 0, &shape);
}

/// slot_count, particles, positions, bukkit_counts, index_start,
/// insert_counters, bukkit_indices, overflow, positions_out
pub(super) fn insert(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: SimConstants = args.constants();
    let slots = args.load(0, 0);
    for i in wg.invocations() {
        if i >= slots {
            return;
        }
        let p: [f32; 4] = args.read(2, i as usize);
        args.write(8, i as usize, &p);
        if !enabled(args, 1, i) {
            continue;
        }
        let b = bin_index(&c, bukkit_coord([p[0], p[1], p[2]], &c)) as usize;
        let reserved = args.load(3, b).min(c.bukkit_capacity);
        let slot = args.atomic_add(5, b, 1);
        if slot < reserved {
            args.store(6, (args.load(4, b) + slot) as usize, i);
        } else {
            args.atomic_add(7, 0, 1);
        }
    }
}

/// request_counts, spawn_requests, particles, positions, free_count,
/// free_indices, slot_count, counters
pub(super) fn emission(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: SimConstants = args.constants();
    let requests = args.load(0, 0);
    for i in wg.invocations() {
        if i >= requests {
            return;
        }
        let request: [f32; 4] = args.read(1, i as usize);
        let Some(slot) = claim_slot(args, c.max_particles) else {
            args.atomic_add(7, 0, 1);
            continue;
        };
        let particle = Particle {
            material: request[3],
            ..Particle::new(1.0, Material::Liquid)
        };
        args.write(2, slot as usize, &particle);
        args.write(3, slot as usize, &[request[0], request[1], request[2], 1.0f32]);
    }
}

/// Pop the free stack, falling back to a fresh slot below `max`.
fn claim_slot(args: &KernelArgs<'_>, max: u32) -> Option<u32> {
    let old = args.atomic_sub(4, 0, 1) as i32;
    if old > 0 {
        return Some(args.load(5, (old - 1) as usize));
    }
    args.atomic_add(4, 0, 1);
    let fresh = args.atomic_add(6, 0, 1);
    if fresh < max {
        Some(fresh)
    } else {
        args.atomic_sub(6, 0, 1);
        None
    }
}

/// request_counts, kill_requests, slot_count, particles, positions,
/// free_count, free_indices
pub(super) fn release(wg: Workgroup, args: &KernelArgs<'_>) {
    let requests = args.load(0, 1);
    let slots = args.load(2, 0);
    for i in wg.invocations() {
        if i >= requests {
            return;
        }
        let idx = args.load(1, i as usize);
        if idx >= slots {
            continue;
        }
        let was = args.atomic_exchange(3, idx as usize * PARTICLE_WORDS + ENABLED_WORD, 0);
        if f32::from_bits(was) == 0.0 {
            continue;
        }
        push_free(args, 5, 6, idx);
        args.write(4, idx as usize, &DISABLED_POSITION);
    }
}

/// positions, bukkit_counts, index_start, bukkit_indices, thread_data,
/// shapes, particles, positions_out, free_count, free_indices
pub(super) fn g2p2g(wg: Workgroup, args: &KernelArgs<'_>) {
    let c: SimConstants = args.constants();
    let entry: BukkitThreadData = args.read(4, wg.index() as usize);
    let home = [entry.bukkit_x, entry.bukkit_y, entry.bukkit_z];
    let dt2 = c.dt * c.dt;
    let gravity = [c.gravity_x * dt2, c.gravity_y * dt2, c.gravity_z * dt2];
    let radius = c.particle_radius;

    for t in wg.locals() {
        if t >= entry.range_count {
            return;
        }
        let idx = args.load(3, (entry.range_start + t) as usize);
        let p = position(args, 0, idx);
        let base = idx as usize * PARTICLE_WORDS;
        let mut d = [0.0f32; 3];
        for (axis, v) in d.iter_mut().enumerate() {
            *v = args.load_f32(6, base + axis) + gravity[axis];
        }

        let mut push = [0.0f32; 3];
        for_each_halo_bin(&c, home, |b| {
            let stored = args.load(1, b as usize).min(c.bukkit_capacity);
            let start = args.load(2, b as usize);
            for k in 0..stored {
                let j = args.load(3, (start + k) as usize);
                if j == idx {
                    continue;
                }
                let q = position(args, 0, j);
                let r = [p[0] - q[0], p[1] - q[1], p[2] - q[2]];
                let dist = (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt();
                if dist > 1.0e-6 && dist < radius {
                    let s = (radius - dist) / dist * 0.5 * c.liquid_relaxation;
                    for axis in 0..3 {
                        push[axis] += r[axis] * s;
                    }
                }
            }
        });
        for axis in 0..3 {
            d[axis] = d[axis] * (1.0 - c.liquid_viscosity) + push[axis];
        }
        let mut next = [p[0] + d[0], p[1] + d[1], p[2] + d[2]];

        let mut drained = false;
        for s in 0..c.shape_count {
            let shape: SimShape = args.read(5, s as usize);
            if !shape.contains(next) {
                continue;
            }
            match shape.function() {
                Some(ShapeFunction::Collider) => {
                    if let Some((surface, n)) = shape.push_out(next) {
                        next = surface;
                        let inward = (d[0] * n[0] + d[1] * n[1] + d[2] * n[2]).min(0.0);
                        for k in 0..3 {
                            d[k] -= inward * n[k];
                        }
                    }
                }
                Some(ShapeFunction::Drain) => drained = true,
                _ => {}
            }
        }
        if drained {
            args.store_f32(6, base + ENABLED_WORD, 0.0);
            push_free(args, 8, 9, idx);
            args.write(7, idx as usize, &DISABLED_POSITION);
            continue;
        }

        guardian_clamp(&c, &mut next, &mut d);
        for (axis, v) in d.iter().enumerate() {
            args.store_f32(6, base + axis, *v);
        }
        args.write(7, idx as usize, &[next[0], next[1], next[2], 1.0f32]);
    }
}

fn for_each_halo_bin(c: &SimConstants, home: [u32; 3], mut visit: impl FnMut(u32)) {
    let dim = [c.bukkit_x, c.bukkit_y, c.bukkit_z];
    let halo = crate::bukkit::BUKKIT_HALO_SIZE as i64;
    let range = |axis: usize| {
        let lo = (home[axis] as i64 - halo).max(0);
        let hi = (home[axis] as i64 + halo).min(dim[axis] as i64 - 1);
        lo..=hi
    };
    for z in range(2) {
        for y in range(1) {
            for x in range(0) {
                visit(bin_index(c, [x as u32, y as u32, z as u32]));
            }
        }
    }
}

/// Keep particles inside the guardian band. Hitting the band stops the
/// normal motion and damps the tangential motion by `border_friction`.
fn guardian_clamp(c: &SimConstants, next: &mut [f32; 3], d: &mut [f32; 3]) {
    let grid = [c.grid_x, c.grid_y, c.grid_z];
    let guardian = c.guardian_size as f32;
    let mut hit = [false; 3];
    for axis in 0..3 {
        let lo = guardian;
        let hi = (grid[axis] as f32 - guardian).max(lo);
        if next[axis] < lo || next[axis] > hi {
            next[axis] = next[axis].clamp(lo, hi);
            d[axis] = 0.0;
            hit[axis] = true;
        }
    }
    if hit.iter().any(|&h| h) {
        for axis in 0..3 {
            if !hit[axis] {
                d[axis] *= 1.0 - c.border_friction;
            }
        }
    }
}
