//! Scene lifecycle over the CPU executor: build from config, run frames,
//! draw, and tear down.

use kernel::{CpuDevice, Material, SubmitPolicy};
use orchestrator::config::{ParticleBlock, ShapeConfig};
use orchestrator::scene::overview_camera;
use orchestrator::{FluidScene, SceneConfig, SceneError};

fn config() -> SceneConfig {
    let mut config = SceneConfig::from_json(
        r#"{
            "name": "lifecycle",
            "backend": "Cpu",
            "simulation": { "grid": [24, 24, 24], "max_particles": 4096, "substeps": 2 }
        }"#,
    )
    .unwrap();
    config.particles.push(ParticleBlock {
        min: [6.0, 4.0, 6.0],
        max: [14.0, 12.0, 14.0],
        spacing: 1.0,
        material: Material::Liquid,
        mass: 1.0,
    });
    config
}

fn scene(config: &SceneConfig) -> FluidScene<CpuDevice> {
    FluidScene::new(CpuDevice::with_validation().unwrap(), config).unwrap()
}

fn shape(function: &str, position: [f32; 3], half_size: [f32; 3], emission_rate: f32) -> ShapeConfig {
    serde_json::from_value(serde_json::json!({
        "function": function,
        "position": position,
        "half_size": half_size,
        "emission_rate": emission_rate,
    }))
    .unwrap()
}

#[test]
fn shipped_config_validates() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../configs/dam_break.json");
    let config = SceneConfig::load(path).unwrap();
    assert!(config.particles[0].particle_count() <= config.simulation.max_particles as u64);
}

#[test]
fn frames_keep_particles_binned_and_surfaced() {
    let mut scene = scene(&config());
    let before = scene.frame_stats().unwrap();
    assert_eq!(before.particles, 512);

    for _ in 0..4 {
        scene.compute().unwrap();
    }
    let stats = scene.frame_stats().unwrap();
    assert_eq!(stats.frame, 4);
    assert_eq!(stats.particles, 512);
    assert_eq!(stats.bukkit_overflow, 0);
    assert!(stats.surface_vertices > 0);
    assert!(stats.indirect_dispatches > before.indirect_dispatches);

    let particles = scene.particle_snapshot().unwrap();
    for slot in particles.enabled_slots() {
        let p = particles.positions[slot as usize];
        assert!((0..3).all(|a| p[a] >= 0.0 && p[a] <= 24.0), "slot {slot} at {p:?}");
    }
    scene.release_resources().unwrap();
}

#[test]
fn emitter_adds_its_rate_every_frame() {
    let mut config = config();
    config.particles.clear();
    config.shapes.push(shape("Emitter", [12.0, 18.0, 12.0], [2.0, 1.0, 2.0], 8.0));
    let mut scene = scene(&config);

    for _ in 0..3 {
        scene.compute().unwrap();
    }
    assert_eq!(scene.frame_stats().unwrap().particles, 24);
}

#[test]
fn drain_releases_particles_inside_it() {
    let mut config = config();
    config.shapes.push(shape("Drain", [10.0, 8.0, 10.0], [6.0, 6.0, 6.0], 0.0));
    let mut scene = scene(&config);

    scene.compute().unwrap();
    let particles = scene.particle_snapshot().unwrap();
    assert!(particles.enabled_slots().is_empty());
    assert_eq!(particles.free.len(), 512);

    // Released slots are handed out again.
    scene.spawn([2.0, 20.0, 2.0], Material::Sand).unwrap();
    scene.compute().unwrap();
    let particles = scene.particle_snapshot().unwrap();
    assert_eq!(particles.enabled_slots().len(), 1);
    assert_eq!(particles.slot_count, 512);
}

#[test]
fn host_spawn_and_destroy_take_effect_next_frame() {
    let mut scene = scene(&config());
    scene.destroy(0).unwrap();
    scene.destroy(1).unwrap();
    scene.spawn([20.0, 20.0, 20.0], Material::Liquid).unwrap();
    assert_eq!(scene.frame_stats().unwrap().particles, 512);

    scene.compute().unwrap();
    let particles = scene.particle_snapshot().unwrap();
    assert_eq!(particles.enabled_slots().len(), 511);
    assert_eq!(particles.free.len(), 1);
}

#[test]
fn draw_consumes_the_extracted_surface() {
    let mut scene = scene(&config());
    scene.compute().unwrap();
    let vertices = scene.surface_snapshot().unwrap().vertex_indices.len();

    let fence = scene.draw(overview_camera([0.0; 3], [24.0; 3])).unwrap();
    assert!(fence > 0);
    assert_eq!(scene.context_stats().draws, 1);

    scene.release_resources().unwrap();
    let draws = scene.context().device().take_draws();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].clip_positions.len(), vertices);
    for clip in &draws[0].clip_positions {
        assert!(clip[0].abs() <= 1.5 && clip[1].abs() <= 1.5, "{clip:?}");
    }
}

#[test]
fn per_stage_policy_submits_more_batches() {
    let mut frame = scene(&config());
    let mut staged_config = config();
    staged_config.submit_policy = SubmitPolicy::PerStage;
    let mut staged = scene(&staged_config);

    frame.compute().unwrap();
    staged.compute().unwrap();
    let a = frame.frame_stats().unwrap();
    let b = staged.frame_stats().unwrap();
    assert!(b.submissions > a.submissions);
    assert_eq!(a.particles, b.particles);
    assert!(b.surface_vertices > 0);
}

#[test]
fn released_scene_refuses_work() {
    let mut scene = scene(&config());
    scene.compute().unwrap();
    scene.release_resources().unwrap();
    assert!(scene.is_released());
    scene.release_resources().unwrap();

    assert!(matches!(scene.compute(), Err(SceneError::Released)));
    assert!(matches!(scene.draw(overview_camera([0.0; 3], [1.0; 3])), Err(SceneError::Released)));
    assert!(matches!(scene.particle_snapshot(), Err(SceneError::Released)));
    assert!(matches!(scene.spawn([1.0; 3], Material::Liquid), Err(SceneError::Released)));
}

#[test]
fn invalid_config_is_rejected_before_allocation() {
    let mut config = config();
    config.simulation.max_particles = 100;
    let err = FluidScene::new(CpuDevice::with_validation().unwrap(), &config)
        .err()
        .unwrap();
    assert!(matches!(err, SceneError::Config(_)), "{err}");
}
