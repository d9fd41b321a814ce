//! Orchestration Layer
//!
//! This crate builds fluid scenes on top of the compute kernels:
//! - JSON scene configuration and validation
//! - Backend selection between the CPU executor and the wgpu device
//! - The per-frame `compute` / `draw` / `release_resources` driver

#![warn(missing_docs)]

pub mod config;
pub mod scene;

pub use config::{BackendType, ConfigError, SceneConfig};
pub use scene::{FluidScene, FrameStats, SceneError};

use kernel::{CpuDevice, CpuDeviceOptions, ParticleSnapshot, SurfaceSnapshot};

/// Scene on whichever backend [`create_scene`] picked.
pub enum Scene {
    /// CPU reference executor
    Cpu(FluidScene<CpuDevice>),
    /// wgpu device
    #[cfg(feature = "gpu")]
    Gpu(FluidScene<kernel::WgpuDevice>),
}

macro_rules! on_scene {
    ($scene:expr, $s:ident => $body:expr) => {
        match $scene {
            Scene::Cpu($s) => $body,
            #[cfg(feature = "gpu")]
            Scene::Gpu($s) => $body,
        }
    };
}

impl Scene {
    /// Advance one frame.
    pub fn compute(&mut self) -> scene::Result<()> {
        on_scene!(self, s => s.compute())
    }

    /// Draw the current surface and submit.
    pub fn draw(&mut self, view_proj: [[f32; 4]; 4]) -> scene::Result<u64> {
        on_scene!(self, s => s.draw(view_proj))
    }

    /// Tear down every buffer.
    pub fn release_resources(&mut self) -> scene::Result<()> {
        on_scene!(self, s => s.release_resources())
    }

    /// Counts reported after each frame.
    pub fn frame_stats(&mut self) -> scene::Result<FrameStats> {
        on_scene!(self, s => s.frame_stats())
    }

    /// Particle arrays.
    pub fn particle_snapshot(&mut self) -> scene::Result<ParticleSnapshot> {
        on_scene!(self, s => s.particle_snapshot())
    }

    /// Surface outputs.
    pub fn surface_snapshot(&mut self) -> scene::Result<SurfaceSnapshot> {
        on_scene!(self, s => s.surface_snapshot())
    }

    /// Name of the device in use.
    pub fn device_name(&self) -> String {
        use kernel::ComputeDevice;
        on_scene!(self, s => s.context().device().name())
    }
}

/// Create a scene from a configuration file
///
/// This function performs the full setup pipeline:
/// 1. Load and validate the configuration
/// 2. Pick the compute device per the configured backend
/// 3. Upload the initial particles and shapes
/// 4. Allocate the binning and surface pipelines
///
/// # Example
/// ```no_run
/// use orchestrator::create_scene;
///
/// let mut scene = create_scene("configs/dam_break.json")?;
/// scene.compute()?;
/// scene.release_resources()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_scene(config_path: &str) -> Result<Scene, SceneError> {
    tracing::info!("Creating scene from config: {}", config_path);
    let config = SceneConfig::load(config_path)?;
    tracing::info!("Configuration loaded: {}", config.name);
    build_scene(&config)
}

/// Build a scene from an already loaded configuration.
///
/// For `Auto`, attempts GPU first and falls back to CPU if unavailable.
/// For `Gpu`, fails when no adapter can be opened.
/// For `Cpu`, always uses the CPU executor.
pub fn build_scene(config: &SceneConfig) -> Result<Scene, SceneError> {
    match config.backend {
        BackendType::Cpu => cpu_scene(config),
        #[cfg(feature = "gpu")]
        BackendType::Gpu => {
            tracing::info!("Creating GPU scene...");
            let device = kernel::WgpuDevice::new()?;
            Ok(Scene::Gpu(FluidScene::new(device, config)?))
        }
        #[cfg(not(feature = "gpu"))]
        BackendType::Gpu => Err(SceneError::Compute(kernel::Error::DeviceRequest(
            "GPU backend requested but the 'gpu' feature is not enabled".into(),
        ))),
        #[cfg(feature = "gpu")]
        BackendType::Auto => {
            tracing::info!("Auto-detecting backend...");
            if !kernel::gpu::gpu_available() {
                tracing::info!("No GPU available, using CPU executor");
                return cpu_scene(config);
            }
            match kernel::WgpuDevice::new() {
                Ok(device) => Ok(Scene::Gpu(FluidScene::new(device, config)?)),
                Err(e) => {
                    tracing::warn!("GPU init failed ({e}), falling back to CPU");
                    cpu_scene(config)
                }
            }
        }
        #[cfg(not(feature = "gpu"))]
        BackendType::Auto => {
            tracing::info!("GPU feature not enabled, using CPU executor");
            cpu_scene(config)
        }
    }
}

fn cpu_scene(config: &SceneConfig) -> Result<Scene, SceneError> {
    tracing::info!("Creating CPU scene (validation: {})...", config.validation);
    let device = CpuDevice::new(CpuDeviceOptions {
        validation: config.validation,
    })?;
    Ok(Scene::Cpu(FluidScene::new(device, config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_backend_builds_cpu_scene() {
        let config = SceneConfig::from_json(
            r#"{ "name": "t", "backend": "Cpu", "simulation": { "grid": [8, 8, 8], "max_particles": 64 } }"#,
        )
        .unwrap();
        let mut scene = build_scene(&config).unwrap();
        assert!(matches!(scene, Scene::Cpu(_)));
        assert!(scene.device_name().contains("cpu"));
        scene.compute().unwrap();
        scene.release_resources().unwrap();
        assert!(matches!(scene.compute(), Err(SceneError::Released)));
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn test_gpu_backend_without_feature_fails() {
        let config = SceneConfig::from_json(r#"{ "name": "t", "backend": "Gpu" }"#).unwrap();
        assert!(build_scene(&config).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(matches!(
            create_scene("no/such/scene.json"),
            Err(SceneError::Config(ConfigError::Io { .. }))
        ));
    }
}
