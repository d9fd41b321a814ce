//! Particle records, scene shapes and the host-side slot arena.
//!
//! Particles live in fixed-capacity device arrays. A slot is never removed:
//! destroying a particle clears its `enabled` flag and pushes the slot on a
//! free-index stack, and the next spawn pops it again. Slot indices are the
//! only references to particles anywhere in the system.

/// Position written to released slots. Far outside every grid, so binning and
/// surface extraction ignore the slot without checking `enabled`.
pub const DISABLED_POSITION: [f32; 4] = [-1.0e30, -1.0e30, -1.0e30, 0.0];

/// Word index of [`Particle::enabled`] inside the record. Kernels that
/// destroy particles flip this word atomically.
pub const ENABLED_WORD: usize = 26;

/// Number of 32-bit words in one [`Particle`].
pub const PARTICLE_WORDS: usize = 27;

/// Material tag stored in each particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum Material {
    /// Free-surface liquid.
    #[default]
    Liquid = 0,
    /// Elastic solid.
    Elastic = 1,
    /// Granular material.
    Sand = 2,
    /// Viscous liquid.
    Visco = 3,
}

impl Material {
    /// Value stored in the `material` field.
    pub fn as_f32(self) -> f32 {
        self as u32 as f32
    }
}

/// Material-point record. Layout must match `struct Particle` in the WGSL
/// simulation kernels (27 floats, no padding).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Particle {
    /// Position change over the last substep, in cells.
    pub displacement: [f32; 3],
    /// Particle mass.
    pub mass: f32,
    /// Deformation gradient, row-major 3x3.
    pub deformation_gradient: [f32; 9],
    /// [`Material`] tag as a float.
    pub material: f32,
    /// Rest volume.
    pub volume: f32,
    /// Lagrange multiplier of the volume constraint.
    pub lambda: f32,
    /// Deformation displacement, row-major 3x3.
    pub deformation_displacement: [f32; 9],
    /// Log of the plastic volume ratio.
    pub log_jp: f32,
    /// 1.0 for live particles, 0.0 for free slots.
    pub enabled: f32,
}

const IDENTITY3: [f32; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

impl Particle {
    /// Freshly spawned particle at rest.
    pub fn new(mass: f32, material: Material) -> Self {
        Self {
            displacement: [0.0; 3],
            mass,
            deformation_gradient: IDENTITY3,
            material: material.as_f32(),
            volume: 1.0,
            lambda: 0.0,
            deformation_displacement: [0.0; 9],
            log_jp: 0.0,
            enabled: 1.0,
        }
    }

    /// Inert record for a free slot.
    pub fn disabled() -> Self {
        Self {
            enabled: 0.0,
            ..Self::new(0.0, Material::Liquid)
        }
    }

    /// Whether the slot holds a live particle.
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0.0
    }
}

/// Geometric primitive of a [`SimShape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ShapeType {
    /// Oriented box with `half_size` extents.
    #[default]
    Box = 0,
    /// Sphere of `radius`.
    Sphere = 1,
}

/// What a [`SimShape`] does to the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ShapeFunction {
    /// Spawns `emission_rate` particles per frame inside the shape.
    Emitter = 0,
    /// Solid obstacle; particles are pushed out.
    #[default]
    Collider = 1,
    /// Destroys particles that enter it.
    Drain = 2,
}

/// Distance, in cells, a collider places pushed-out particles past its
/// surface. Containment is inclusive, so a particle left exactly on the
/// surface would count as inside.
pub const COLLIDER_SKIN: f32 = 1.0e-3;

/// Scene shape. Layout must match `struct SimShape` in the WGSL kernels.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SimShape {
    /// Center, in cells.
    pub position: [f32; 3],
    /// Rotation about the y axis, in radians.
    pub rotation: f32,
    /// Box half extents, in cells.
    pub half_size: [f32; 3],
    /// Sphere radius, in cells.
    pub radius: f32,
    /// [`ShapeType`] discriminant.
    pub shape_type: u32,
    /// [`ShapeFunction`] discriminant.
    pub functionality: u32,
    /// [`Material`] discriminant of emitted particles.
    pub material: u32,
    /// Particles emitted per frame.
    pub emission_rate: f32,
    /// Scene-unique identifier.
    pub id: u32,
    /// Padding to a 16-byte multiple.
    pub _pad: [u32; 3],
}

impl SimShape {
    /// Whether `p` (in cells) lies inside the shape.
    pub fn contains(&self, p: [f32; 3]) -> bool {
        let d = [
            p[0] - self.position[0],
            p[1] - self.position[1],
            p[2] - self.position[2],
        ];
        if self.shape_type == ShapeType::Sphere as u32 {
            return d[0] * d[0] + d[1] * d[1] + d[2] * d[2] <= self.radius * self.radius;
        }
        let (s, c) = self.rotation.sin_cos();
        let local = [c * d[0] - s * d[2], d[1], s * d[0] + c * d[2]];
        (0..3).all(|i| local[i].abs() <= self.half_size[i])
    }

    /// For a point inside the shape, the nearest point just outside its
    /// surface and the outward normal there. `None` when `p` is outside.
    ///
    /// A box exits through the face of least penetration. A point at a
    /// sphere's center exits upwards.
    pub fn push_out(&self, p: [f32; 3]) -> Option<([f32; 3], [f32; 3])> {
        if !self.contains(p) {
            return None;
        }
        let d = [
            p[0] - self.position[0],
            p[1] - self.position[1],
            p[2] - self.position[2],
        ];
        let offset_to_world = |o: [f32; 3]| {
            [
                self.position[0] + o[0],
                self.position[1] + o[1],
                self.position[2] + o[2],
            ]
        };

        if self.shape_type == ShapeType::Sphere as u32 {
            let len = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
            let n = if len > 1.0e-6 {
                [d[0] / len, d[1] / len, d[2] / len]
            } else {
                [0.0, 1.0, 0.0]
            };
            let r = self.radius + COLLIDER_SKIN;
            return Some((offset_to_world([n[0] * r, n[1] * r, n[2] * r]), n));
        }

        let (s, c) = self.rotation.sin_cos();
        let mut local = [c * d[0] - s * d[2], d[1], s * d[0] + c * d[2]];
        let axis = (0..3)
            .min_by(|&a, &b| {
                let pa = self.half_size[a] - local[a].abs();
                let pb = self.half_size[b] - local[b].abs();
                pa.total_cmp(&pb)
            })
            .unwrap_or(1);
        let sign = if local[axis] < 0.0 { -1.0 } else { 1.0 };
        local[axis] = sign * (self.half_size[axis] + COLLIDER_SKIN);
        let mut normal = [0.0; 3];
        normal[axis] = sign;

        let to_world = |l: [f32; 3]| [c * l[0] + s * l[2], l[1], -s * l[0] + c * l[2]];
        Some((offset_to_world(to_world(local)), to_world(normal)))
    }

    /// Functionality tag, if it names a known function.
    pub fn function(&self) -> Option<ShapeFunction> {
        match self.functionality {
            0 => Some(ShapeFunction::Emitter),
            1 => Some(ShapeFunction::Collider),
            2 => Some(ShapeFunction::Drain),
            _ => None,
        }
    }
}

/// Host-side particle arena with a stack of free slot indices.
///
/// Used to build the initial particle arrays of a scene and as the reference
/// model the device free list is checked against. Every accessor validates
/// the index and the `enabled` flag.
#[derive(Debug, Clone)]
pub struct ParticleArena {
    particles: Vec<Particle>,
    positions: Vec<[f32; 4]>,
    free: Vec<u32>,
    capacity: usize,
}

impl ParticleArena {
    /// Empty arena holding at most `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            particles: Vec::new(),
            positions: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// Maximum number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots ever handed out (live or free).
    pub fn slot_count(&self) -> usize {
        self.particles.len()
    }

    /// Number of live particles.
    pub fn enabled_count(&self) -> usize {
        self.particles.len() - self.free.len()
    }

    /// Spawn a particle, reusing the most recently freed slot first.
    /// Returns `None` when the arena is full.
    pub fn spawn(&mut self, position: [f32; 3], particle: Particle) -> Option<u32> {
        let pos = [position[0], position[1], position[2], 1.0];
        let particle = Particle {
            enabled: 1.0,
            ..particle
        };
        if let Some(slot) = self.free.pop() {
            self.particles[slot as usize] = particle;
            self.positions[slot as usize] = pos;
            return Some(slot);
        }
        if self.particles.len() >= self.capacity {
            return None;
        }
        self.particles.push(particle);
        self.positions.push(pos);
        Some((self.particles.len() - 1) as u32)
    }

    /// Destroy the particle in `slot`. Returns false for out-of-range or
    /// already free slots.
    pub fn destroy(&mut self, slot: u32) -> bool {
        match self.particles.get_mut(slot as usize) {
            Some(p) if p.is_enabled() => {
                *p = Particle::disabled();
                self.positions[slot as usize] = DISABLED_POSITION;
                self.free.push(slot);
                true
            }
            _ => false,
        }
    }

    /// Live particle in `slot`.
    pub fn get(&self, slot: u32) -> Option<&Particle> {
        self.particles.get(slot as usize).filter(|p| p.is_enabled())
    }

    /// Position of the live particle in `slot`.
    pub fn position(&self, slot: u32) -> Option<[f32; 3]> {
        self.get(slot)?;
        let p = self.positions[slot as usize];
        Some([p[0], p[1], p[2]])
    }

    /// Particle records of every slot, for upload.
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Positions of every slot, for upload.
    pub fn positions(&self) -> &[[f32; 4]] {
        &self.positions
    }

    /// Free stack, bottom first. The next spawn reuses the last entry.
    pub fn free_indices(&self) -> &[u32] {
        &self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particle_layout_matches_kernels() {
        assert_eq!(std::mem::size_of::<Particle>(), PARTICLE_WORDS * 4);
        let p = Particle::new(1.0, Material::Sand);
        let words: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&p));
        assert_eq!(words[ENABLED_WORD], 1.0);
        assert_eq!(words[13], 2.0, "material follows the deformation gradient");
        assert_eq!(std::mem::size_of::<SimShape>(), 64);
    }

    #[test]
    fn destroyed_slots_are_reused_last_in_first_out() {
        let mut arena = ParticleArena::with_capacity(8);
        for i in 0..5 {
            arena.spawn([i as f32, 0.0, 0.0], Particle::new(1.0, Material::Liquid));
        }
        assert!(arena.destroy(1));
        assert!(arena.destroy(3));
        assert_eq!(arena.enabled_count(), 3);
        assert_eq!(arena.spawn([0.0; 3], Particle::new(1.0, Material::Liquid)), Some(3));
        assert_eq!(arena.spawn([0.0; 3], Particle::new(1.0, Material::Liquid)), Some(1));
        assert_eq!(arena.spawn([0.0; 3], Particle::new(1.0, Material::Liquid)), Some(5));
    }

    #[test]
    fn destroy_validates_slot_and_flag() {
        let mut arena = ParticleArena::with_capacity(2);
        let slot = arena.spawn([1.0, 2.0, 3.0], Particle::new(1.0, Material::Liquid)).unwrap();
        assert_eq!(arena.position(slot), Some([1.0, 2.0, 3.0]));
        assert!(arena.destroy(slot));
        assert!(!arena.destroy(slot), "double destroy");
        assert!(!arena.destroy(7), "out of range");
        assert!(arena.get(slot).is_none());
        assert_eq!(arena.positions()[slot as usize], DISABLED_POSITION);
    }

    #[test]
    fn full_arena_refuses_spawn() {
        let mut arena = ParticleArena::with_capacity(1);
        assert!(arena.spawn([0.0; 3], Particle::new(1.0, Material::Liquid)).is_some());
        assert!(arena.spawn([0.0; 3], Particle::new(1.0, Material::Liquid)).is_none());
    }

    #[test]
    fn rotated_box_containment() {
        let shape = SimShape {
            position: [10.0, 10.0, 10.0],
            rotation: std::f32::consts::FRAC_PI_2,
            half_size: [4.0, 1.0, 1.0],
            radius: 0.0,
            shape_type: ShapeType::Box as u32,
            functionality: ShapeFunction::Drain as u32,
            material: 0,
            emission_rate: 0.0,
            id: 0,
            _pad: [0; 3],
        };
        // Long axis now runs along z.
        assert!(shape.contains([10.0, 10.0, 13.5]));
        assert!(!shape.contains([13.5, 10.0, 10.0]));
        assert_eq!(shape.function(), Some(ShapeFunction::Drain));
    }

    fn collider(shape_type: ShapeType, rotation: f32, half_size: [f32; 3], radius: f32) -> SimShape {
        SimShape {
            position: [10.0, 10.0, 10.0],
            rotation,
            half_size,
            radius,
            shape_type: shape_type as u32,
            functionality: ShapeFunction::Collider as u32,
            material: 0,
            emission_rate: 0.0,
            id: 0,
            _pad: [0; 3],
        }
    }

    fn close(a: [f32; 3], b: [f32; 3]) -> bool {
        (0..3).all(|i| (a[i] - b[i]).abs() < 1.0e-4)
    }

    #[test]
    fn box_push_out_uses_the_face_of_least_penetration() {
        let shape = collider(ShapeType::Box, 0.0, [2.0, 2.0, 2.0], 0.0);
        assert_eq!(shape.push_out([13.0, 10.0, 10.0]), None);

        let (point, normal) = shape.push_out([10.5, 11.5, 9.0]).unwrap();
        assert!(close(point, [10.5, 12.0 + COLLIDER_SKIN, 9.0]), "{point:?}");
        assert!(close(normal, [0.0, 1.0, 0.0]));
        assert!(!shape.contains(point));
    }

    #[test]
    fn rotated_box_push_out_returns_world_coordinates() {
        let shape = collider(ShapeType::Box, std::f32::consts::FRAC_PI_2, [4.0, 1.0, 1.0], 0.0);
        let (point, normal) = shape.push_out([10.0, 10.0, 13.5]).unwrap();
        assert!(close(point, [10.0, 10.0, 14.0 + COLLIDER_SKIN]), "{point:?}");
        assert!(close(normal, [0.0, 0.0, 1.0]), "{normal:?}");
        assert!(!shape.contains(point));
    }

    #[test]
    fn sphere_push_out_is_radial() {
        let shape = collider(ShapeType::Sphere, 0.0, [0.0; 3], 3.0);
        let (point, normal) = shape.push_out([8.0, 10.0, 10.0]).unwrap();
        assert!(close(point, [7.0 - COLLIDER_SKIN, 10.0, 10.0]), "{point:?}");
        assert!(close(normal, [-1.0, 0.0, 0.0]));

        let (point, normal) = shape.push_out([10.0, 10.0, 10.0]).unwrap();
        assert!(close(normal, [0.0, 1.0, 0.0]));
        assert!(!shape.contains(point));
    }
}
