mod common;

use common::headless;
use glam::Vec3;
use tri_rhi::scene::{
    DirectionalLight, LightBuffer, LightBufferUpdate, LightData, LightType, PointLight, Scene, SpotLight,
    MAX_LIGHTS,
};
use tri_rhi::{BufferUsage, MemoryUsage};

fn lit_scene() -> Scene {
    let mut scene = Scene::new();
    scene.add_light(DirectionalLight::new(Vec3::new(1.0, -1.0, 0.0), Vec3::ONE, 0.5));
    scene.add_light(PointLight::new(Vec3::new(0.0, 3.0, 1.0), 12.0, Vec3::new(1.0, 0.5, 0.25), 2.0));
    scene.add_light(SpotLight::new(Vec3::ZERO, Vec3::NEG_Y, 20.0, 10.0, 10.0, Vec3::ONE, 1.0));
    scene
}

#[test]
fn light_buffer_is_created_once() {
    let device = headless();
    let mut scene = lit_scene();
    let first = scene.initialize_light_buffer(&device).unwrap().clone();
    assert_eq!(first.size(), 1040);
    assert_eq!(first.usage(), BufferUsage::UNIFORM);
    assert_eq!(first.memory(), MemoryUsage::CpuToGpu);

    let second = scene.initialize_light_buffer(&device).unwrap();
    assert!(first.ptr_eq(second));
    assert_eq!(device.live_resource_count(), 1);
}

#[test]
fn upload_round_trip_is_bit_exact() {
    let device = headless();
    let mut scene = lit_scene();
    scene.initialize_light_buffer(&device).unwrap();
    assert_eq!(scene.update_light_buffer(), Ok(LightBufferUpdate::Uploaded));

    let bytes = scene.light_buffer().unwrap().read_to_vec().unwrap();
    assert_eq!(bytes, scene.gpu_data().as_bytes());

    let decoded = LightBuffer::from_bytes(&bytes).unwrap();
    assert_eq!(decoded.light_count, 3);
    let types: Vec<f32> = decoded.active().iter().map(|l| l.position_and_type[3]).collect();
    assert_eq!(types, vec![0.0, 1.0, 2.0]);
    // Reversed cone angles were swapped on the way in
    let spot = &decoded.lights[2];
    assert!(spot.spot_angles[0] < spot.spot_angles[1]);
    // Unused records stay zeroed
    assert!(decoded.lights[3..].iter().all(|l| *l == LightData::default()));
}

#[test]
fn later_updates_replace_the_whole_block() {
    let device = headless();
    let mut scene = lit_scene();
    scene.initialize_light_buffer(&device).unwrap();
    scene.update_light_buffer().unwrap();

    scene.clear_lights();
    let handle = scene.add_light(PointLight::default()).unwrap();
    scene.update_light_buffer().unwrap();

    let decoded =
        LightBuffer::from_bytes(&scene.light_buffer().unwrap().read_to_vec().unwrap()).unwrap();
    assert_eq!(decoded.light_count, 1);
    assert_eq!(decoded.lights[1], LightData::default());
    assert_eq!(scene.light(handle).unwrap().light_type(), LightType::Point);
}

#[test]
fn seventeenth_light_leaves_the_upload_unchanged() {
    let device = headless();
    let mut scene = Scene::new();
    for i in 0..MAX_LIGHTS {
        scene
            .add_light(PointLight::new(Vec3::splat(i as f32), 5.0, Vec3::ONE, 1.0))
            .unwrap();
    }
    scene.initialize_light_buffer(&device).unwrap();
    scene.update_light_buffer().unwrap();
    let before = scene.light_buffer().unwrap().read_to_vec().unwrap();

    assert!(scene.add_light(SpotLight::default()).is_none());
    assert_eq!(scene.light_count(), MAX_LIGHTS);
    scene.update_light_buffer().unwrap();
    assert_eq!(scene.light_buffer().unwrap().read_to_vec().unwrap(), before);
}

#[test]
fn update_before_initialize_writes_nothing() {
    let device = headless();
    let scene = lit_scene();
    assert_eq!(
        scene.update_light_buffer(),
        Ok(LightBufferUpdate::NotInitialized)
    );
    assert_eq!(device.live_resource_count(), 0);
}
