//! Scene configuration parsing and validation

use kernel::bukkit::{bukkit_dim, PARTICLES_PER_THREAD_DATA};
use kernel::particle::PARTICLE_WORDS;
use kernel::surface::MAX_PARTICLES_PER_CELL;
use kernel::{GridConstants, Material, ShapeFunction, ShapeType, SimShape, SimulationParams, SubmitPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Errors raised while loading a scene configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid scene JSON.
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which compute device runs the scene
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    /// CPU reference executor
    Cpu,
    /// wgpu device; fails when no adapter is present
    Gpu,
    /// GPU when available, CPU otherwise
    #[default]
    Auto,
}

/// Main scene configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Human-readable scene name
    pub name: String,
    /// Compute backend
    #[serde(default)]
    pub backend: BackendType,
    /// Run the CPU executor with its validation layer
    #[serde(default = "default_validation")]
    pub validation: bool,
    /// When recorded work is submitted
    #[serde(default)]
    pub submit_policy: SubmitPolicy,
    /// Frames the host may run ahead of the device
    #[serde(default = "default_frames_in_flight")]
    pub max_frames_in_flight: usize,
    /// Particle simulation settings
    #[serde(default)]
    pub simulation: SimulationSection,
    /// Surface extraction settings
    #[serde(default)]
    pub surface: SurfaceSection,
    /// Blocks of particles present at start
    #[serde(default)]
    pub particles: Vec<ParticleBlock>,
    /// Emitters, colliders and drains
    #[serde(default)]
    pub shapes: Vec<ShapeConfig>,
}

/// Particle simulation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Grid size in cells
    #[serde(default = "default_grid")]
    pub grid: [u32; 3],
    /// Capacity of the particle arrays
    #[serde(default = "default_max_particles")]
    pub max_particles: u32,
    /// Substeps per frame
    #[serde(default = "default_substeps")]
    pub substeps: u32,
    /// Frame length (seconds)
    #[serde(default = "default_frame_dt")]
    pub frame_dt: f32,
    /// Gravity (cells/s^2)
    #[serde(default = "default_gravity")]
    pub gravity: [f32; 3],
    /// Fraction of overlap resolved per substep
    #[serde(default = "default_relaxation")]
    pub liquid_relaxation: f32,
    /// Displacement damping per substep
    #[serde(default = "default_viscosity")]
    pub liquid_viscosity: f32,
    /// Tangential damping at the walls
    #[serde(default = "default_friction")]
    pub border_friction: f32,
    /// Particle rest distance (cells)
    #[serde(default = "default_particle_radius")]
    pub particle_radius: f32,
    /// Particles stored per bin
    #[serde(default = "default_bukkit_capacity")]
    pub bukkit_capacity: u32,
    /// Emitter jitter seed
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Surface extraction settings
///
/// Simulation positions are in cells, so the default surface grid overlays
/// the simulation grid one to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceSection {
    /// Grid origin
    #[serde(default)]
    pub min: [f32; 3],
    /// Cell edge length
    #[serde(default = "default_resolution")]
    pub resolution: f32,
    /// Cells per axis; derived from the simulation grid when absent
    #[serde(default)]
    pub dims: Option<[u32; 3]>,
    /// Relative density of one particle at the kernel peak
    #[serde(default = "default_kernel_scale")]
    pub kernel_scale: f32,
    /// Support radius of the density kernel
    #[serde(default = "default_kernel_radius")]
    pub kernel_radius: f32,
    /// Density of the extracted surface
    #[serde(default = "default_isovalue")]
    pub isovalue: f32,
}

/// Axis-aligned block filled with a particle lattice at start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleBlock {
    /// Minimum corner (cells)
    pub min: [f32; 3],
    /// Maximum corner (cells)
    pub max: [f32; 3],
    /// Lattice spacing (cells)
    #[serde(default = "default_spacing")]
    pub spacing: f32,
    /// Material of the block
    #[serde(default)]
    pub material: Material,
    /// Mass of each particle
    #[serde(default = "default_mass")]
    pub mass: f32,
}

/// Scene shape as written in the config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeConfig {
    /// Box or sphere
    #[serde(default)]
    pub shape: ShapeType,
    /// Emitter, collider or drain
    #[serde(default)]
    pub function: ShapeFunction,
    /// Center (cells)
    pub position: [f32; 3],
    /// Rotation about y (radians)
    #[serde(default)]
    pub rotation: f32,
    /// Box half extents (cells)
    #[serde(default = "default_half_size")]
    pub half_size: [f32; 3],
    /// Sphere radius (cells)
    #[serde(default = "default_radius")]
    pub radius: f32,
    /// Material of emitted particles
    #[serde(default)]
    pub material: Material,
    /// Particles emitted per frame
    #[serde(default)]
    pub emission_rate: f32,
}

// Default values
fn default_validation() -> bool {
    true
}

fn default_frames_in_flight() -> usize {
    2
}

fn default_grid() -> [u32; 3] {
    SimulationParams::default().grid
}

fn default_max_particles() -> u32 {
    SimulationParams::default().max_particles
}

fn default_substeps() -> u32 {
    SimulationParams::default().substeps
}

fn default_frame_dt() -> f32 {
    SimulationParams::default().frame_dt
}

fn default_gravity() -> [f32; 3] {
    SimulationParams::default().gravity
}

fn default_relaxation() -> f32 {
    SimulationParams::default().liquid_relaxation
}

fn default_viscosity() -> f32 {
    SimulationParams::default().liquid_viscosity
}

fn default_friction() -> f32 {
    SimulationParams::default().border_friction
}

fn default_particle_radius() -> f32 {
    SimulationParams::default().particle_radius
}

fn default_bukkit_capacity() -> u32 {
    SimulationParams::default().bukkit_capacity
}

fn default_seed() -> u64 {
    SimulationParams::default().seed
}

fn default_resolution() -> f32 {
    1.0
}

fn default_kernel_scale() -> f32 {
    1.0
}

fn default_kernel_radius() -> f32 {
    2.0
}

fn default_isovalue() -> f32 {
    0.5
}

fn default_spacing() -> f32 {
    0.5
}

fn default_mass() -> f32 {
    1.0
}

fn default_half_size() -> [f32; 3] {
    [1.0; 3]
}

fn default_radius() -> f32 {
    1.0
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            grid: default_grid(),
            max_particles: default_max_particles(),
            substeps: default_substeps(),
            frame_dt: default_frame_dt(),
            gravity: default_gravity(),
            liquid_relaxation: default_relaxation(),
            liquid_viscosity: default_viscosity(),
            border_friction: default_friction(),
            particle_radius: default_particle_radius(),
            bukkit_capacity: default_bukkit_capacity(),
            seed: default_seed(),
        }
    }
}

impl Default for SurfaceSection {
    fn default() -> Self {
        Self {
            min: [0.0; 3],
            resolution: default_resolution(),
            dims: None,
            kernel_scale: default_kernel_scale(),
            kernel_radius: default_kernel_radius(),
            isovalue: default_isovalue(),
        }
    }
}

impl ParticleBlock {
    /// Lattice points of the block, cell-centered at half a spacing in.
    pub fn lattice(&self) -> impl Iterator<Item = [f32; 3]> + '_ {
        let counts = self.counts();
        let s = self.spacing;
        (0..counts[2]).flat_map(move |z| {
            (0..counts[1]).flat_map(move |y| {
                (0..counts[0]).map(move |x| {
                    [
                        self.min[0] + (x as f32 + 0.5) * s,
                        self.min[1] + (y as f32 + 0.5) * s,
                        self.min[2] + (z as f32 + 0.5) * s,
                    ]
                })
            })
        })
    }

    /// Number of particles the block holds.
    pub fn particle_count(&self) -> u64 {
        self.counts().iter().map(|&c| c as u64).product()
    }

    fn counts(&self) -> [u32; 3] {
        std::array::from_fn(|i| ((self.max[i] - self.min[i]) / self.spacing).floor().max(0.0) as u32)
    }
}

impl ShapeConfig {
    /// Device record of the shape with scene id `id`.
    pub fn to_sim_shape(&self, id: u32) -> SimShape {
        SimShape {
            position: self.position,
            rotation: self.rotation,
            half_size: self.half_size,
            radius: self.radius,
            shape_type: self.shape as u32,
            functionality: self.function as u32,
            material: self.material as u32,
            emission_rate: self.emission_rate,
            id,
            _pad: [0; 3],
        }
    }
}

impl SceneConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate configuration JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SceneConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let sim = &self.simulation;

        if sim.grid.contains(&0) {
            return invalid(format!("simulation grid {:?} has an empty axis", sim.grid));
        }
        if sim.max_particles == 0 {
            return invalid("max_particles must be positive".into());
        }
        if sim.substeps == 0 {
            return invalid("substeps must be at least 1".into());
        }
        if sim.frame_dt <= 0.0 {
            return invalid("frame_dt must be positive".into());
        }
        if !(0.0..=1.0).contains(&sim.liquid_relaxation) {
            return invalid("liquid_relaxation must be in range [0, 1]".into());
        }
        if !(0.0..1.0).contains(&sim.liquid_viscosity) {
            return invalid("liquid_viscosity must be in range [0, 1)".into());
        }
        if !(0.0..=1.0).contains(&sim.border_friction) {
            return invalid("border_friction must be in range [0, 1]".into());
        }
        if sim.particle_radius <= 0.0 {
            return invalid("particle_radius must be positive".into());
        }
        if sim.bukkit_capacity == 0 {
            return invalid("bukkit_capacity must be positive".into());
        }
        if self.max_frames_in_flight == 0 {
            return invalid("max_frames_in_flight must be at least 1".into());
        }

        let surface = &self.surface;
        if surface.resolution <= 0.0 {
            return invalid("surface resolution must be positive".into());
        }
        if surface.kernel_radius <= 0.0 {
            return invalid("surface kernel_radius must be positive".into());
        }
        if surface.kernel_scale <= 0.0 {
            return invalid("surface kernel_scale must be positive".into());
        }
        if self.surface_dims().contains(&0) {
            return invalid(format!("surface grid {:?} has an empty axis", self.surface_dims()));
        }

        // Kernels address every array with 32-bit indices.
        let dims = self.surface_dims().map(u64::from);
        let cells = dims[0] * dims[1] * dims[2];
        let vertices = (dims[0] + 1) * (dims[1] + 1) * (dims[2] + 1);
        if vertices > u32::MAX as u64 || cells * MAX_PARTICLES_PER_CELL as u64 > u32::MAX as u64 {
            return invalid(format!(
                "surface grid {:?} is too large for 32-bit cell and vertex indices",
                self.surface_dims()
            ));
        }
        let bins = bukkit_dim(sim.grid).map(u64::from);
        let entries = bins[0] * bins[1] * bins[2]
            + (sim.max_particles as u64).div_ceil(PARTICLES_PER_THREAD_DATA as u64);
        if entries > u32::MAX as u64 || sim.max_particles as u64 * PARTICLE_WORDS as u64 > u32::MAX as u64 {
            return invalid(format!(
                "simulation grid {:?} with {} particles is too large for 32-bit indices",
                sim.grid, sim.max_particles
            ));
        }

        let mut total = 0u64;
        for (i, block) in self.particles.iter().enumerate() {
            if block.spacing <= 0.0 {
                return invalid(format!("particle block {i}: spacing must be positive"));
            }
            if (0..3).any(|a| block.min[a] >= block.max[a]) {
                return invalid(format!("particle block {i}: min must be less than max"));
            }
            if block.mass <= 0.0 {
                return invalid(format!("particle block {i}: mass must be positive"));
            }
            total += block.particle_count();
        }
        if total > sim.max_particles as u64 {
            return invalid(format!(
                "{total} initial particles exceed max_particles {}",
                sim.max_particles
            ));
        }

        for (i, shape) in self.shapes.iter().enumerate() {
            match shape.shape {
                ShapeType::Sphere if shape.radius <= 0.0 => {
                    return invalid(format!("shape {i}: radius must be positive"));
                }
                ShapeType::Box if shape.half_size.iter().any(|&h| h <= 0.0) => {
                    return invalid(format!("shape {i}: half_size must be positive"));
                }
                _ => {}
            }
            if shape.emission_rate < 0.0 {
                return invalid(format!("shape {i}: emission_rate must be non-negative"));
            }
        }
        Ok(())
    }

    /// Simulation parameters for the kernel crate
    pub fn simulation_params(&self) -> SimulationParams {
        let s = &self.simulation;
        SimulationParams {
            grid: s.grid,
            max_particles: s.max_particles,
            substeps: s.substeps,
            frame_dt: s.frame_dt,
            gravity: s.gravity,
            liquid_relaxation: s.liquid_relaxation,
            liquid_viscosity: s.liquid_viscosity,
            border_friction: s.border_friction,
            particle_radius: s.particle_radius,
            bukkit_capacity: s.bukkit_capacity,
            seed: s.seed,
        }
    }

    /// Surface grid cell counts
    pub fn surface_dims(&self) -> [u32; 3] {
        self.surface.dims.unwrap_or_else(|| {
            std::array::from_fn(|i| {
                let extent = self.simulation.grid[i] as f32 - self.surface.min[i];
                (extent / self.surface.resolution).ceil().max(0.0) as u32
            })
        })
    }

    /// Constant block of the surface extraction pipeline
    pub fn grid_constants(&self) -> GridConstants {
        let dims = self.surface_dims();
        let s = &self.surface;
        GridConstants {
            num_particles: self.simulation.max_particles,
            grid_dim_x: dims[0],
            grid_dim_y: dims[1],
            grid_dim_z: dims[2],
            min_x: s.min[0],
            min_y: s.min[1],
            min_z: s.min[2],
            resolution: s.resolution,
            kernel_scale: s.kernel_scale,
            kernel_radius: s.kernel_radius,
            isovalue: s.isovalue,
            _pad0: 0,
        }
    }

    /// Device shape records, ids in config order
    pub fn sim_shapes(&self) -> Vec<SimShape> {
        self.shapes
            .iter()
            .enumerate()
            .map(|(i, s)| s.to_sim_shape(i as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> SceneConfig {
        SceneConfig::from_json(r#"{ "name": "test" }"#).unwrap()
    }

    #[test]
    fn test_defaults_match_simulation_params() {
        let config = minimal();
        assert_eq!(config.backend, BackendType::Auto);
        assert_eq!(config.submit_policy, SubmitPolicy::PerFrame);
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.simulation_params(), SimulationParams::default());
        assert_eq!(config.simulation.bukkit_capacity, 512);
    }

    #[test]
    fn test_surface_grid_overlays_simulation_grid() {
        let mut config = minimal();
        config.simulation.grid = [32, 16, 8];
        assert_eq!(config.surface_dims(), [32, 16, 8]);

        config.surface.resolution = 0.5;
        assert_eq!(config.surface_dims(), [64, 32, 16]);

        config.surface.dims = Some([10, 10, 10]);
        let c = config.grid_constants();
        assert_eq!(c.grid_dim(), [10, 10, 10]);
        assert_eq!(c.num_particles, config.simulation.max_particles);
    }

    #[test]
    fn test_parse_full_scene() {
        let json = r#"{
            "name": "dam",
            "backend": "Cpu",
            "submit_policy": "per_stage",
            "simulation": { "grid": [24, 24, 24], "max_particles": 4096, "substeps": 3 },
            "surface": { "kernel_radius": 1.5, "isovalue": 0.25 },
            "particles": [{ "min": [2, 2, 2], "max": [6, 6, 6], "spacing": 1.0, "material": "Sand" }],
            "shapes": [
                { "shape": "Sphere", "function": "Emitter", "position": [12, 20, 12], "radius": 2, "emission_rate": 8 },
                { "function": "Drain", "position": [12, 1, 12], "half_size": [4, 1, 4] }
            ]
        }"#;
        let config = SceneConfig::from_json(json).unwrap();
        assert_eq!(config.backend, BackendType::Cpu);
        assert_eq!(config.submit_policy, SubmitPolicy::PerStage);
        assert_eq!(config.simulation.substeps, 3);
        assert_eq!(config.particles[0].particle_count(), 64);
        assert_eq!(config.particles[0].material, Material::Sand);

        let shapes = config.sim_shapes();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].functionality, ShapeFunction::Emitter as u32);
        assert_eq!(shapes[0].shape_type, ShapeType::Sphere as u32);
        assert_eq!(shapes[1].id, 1);
        assert_eq!(shapes[1].shape_type, ShapeType::Box as u32);
    }

    #[test]
    fn test_lattice_stays_inside_block() {
        let block = ParticleBlock {
            min: [1.0, 2.0, 3.0],
            max: [3.0, 3.0, 4.0],
            spacing: 0.5,
            material: Material::Liquid,
            mass: 1.0,
        };
        let points: Vec<_> = block.lattice().collect();
        assert_eq!(points.len() as u64, block.particle_count());
        assert_eq!(points.len(), 4 * 2 * 2);
        for p in points {
            for a in 0..3 {
                assert!(p[a] > block.min[a] && p[a] < block.max[a]);
            }
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = minimal();
        config.simulation.grid = [16, 0, 16];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = minimal();
        config.simulation.substeps = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.simulation.liquid_viscosity = 1.0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.surface.resolution = 0.0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.max_frames_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_grids_past_32_bit_indices() {
        let mut config = minimal();
        config.surface.dims = Some([1024, 1024, 1024]);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("32-bit"), "{err}");

        // Large but addressable: launches fold, indices fit.
        config.surface.dims = Some([1024, 4, 1024]);
        config.validate().unwrap();

        let mut config = minimal();
        config.simulation.max_particles = u32::MAX / 8;
        config.simulation.grid = [16, 16, 16];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("too large"), "{err}");
    }

    #[test]
    fn test_validation_counts_initial_particles() {
        let mut config = minimal();
        config.simulation.max_particles = 63;
        config.particles.push(ParticleBlock {
            min: [0.0; 3],
            max: [4.0; 3],
            spacing: 1.0,
            material: Material::Liquid,
            mass: 1.0,
        });
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("64 initial particles"), "{err}");

        config.simulation.max_particles = 64;
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_degenerate_shapes() {
        let mut config = minimal();
        config.shapes.push(ShapeConfig {
            shape: ShapeType::Sphere,
            function: ShapeFunction::Collider,
            position: [8.0; 3],
            rotation: 0.0,
            half_size: [1.0; 3],
            radius: 0.0,
            material: Material::Liquid,
            emission_rate: 0.0,
        });
        assert!(config.validate().is_err());
        config.shapes[0].radius = 2.0;
        config.validate().unwrap();
        config.shapes[0].emission_rate = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = SceneConfig::load("does/not/exist.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
