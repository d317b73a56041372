// =============================================================================
// RHI PROBE - device bring-up and smoke check
// =============================================================================
//
// Creates the configured device, reports what it can do, then exercises the
// two paths every renderer needs on day one:
//
//   1. Host upload: the scene light block into a uniform buffer
//   2. GPU round trip: clear an offscreen target and read the pixels back
//
// Usage: rhi-probe [path/to/rhi.toml]
//
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use glam::Vec3;

use tri_rhi::config::Config;
use tri_rhi::scene::{DirectionalLight, LightBufferUpdate, PointLight, Scene, SpotLight};
use tri_rhi::{
    BufferDesc, BufferUsage, ClearValue, Format, FramebufferDesc, GraphicsDevice, LoadOp,
    MemoryUsage, QueueType, SubmitInfo, TextureDesc, TextureUsage,
};

const PROBE_EXTENT: u32 = 16;
const CLEAR_COLOR: [f32; 4] = [0.1, 0.2, 0.8, 1.0];
const GPU_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_path(&path)?,
        None => Config::load(),
    };
    tri_rhi::logging::init(&config.logging)?;
    log::info!("Starting rhi-probe");

    let device = GraphicsDevice::new(&config.device_desc()).context("Failed to create device")?;
    report(&device);

    let mut scene = Scene::new();
    upload_lights(&device, &mut scene)?;
    clear_and_read_back(&device)?;

    // The light buffer must go before the device, or the audit reports it
    drop(scene);
    device.destroy().context("Device teardown reported a problem")?;
    log::info!("Probe finished");
    Ok(())
}

fn report(device: &GraphicsDevice) {
    let info = device.info();
    let caps = device.capabilities();
    println!("Device:   {} ({})", info.name, info.backend);
    println!("API:      {}", info.api_version);
    println!("Memory:   {} MB", info.device_memory / (1024 * 1024));
    println!("Limits:");
    println!("  max buffer size         {}", caps.max_buffer_size);
    println!("  max texture dimension   {}", caps.max_texture_dimension_2d);
    println!("  max uniform range       {}", caps.max_uniform_buffer_range);
    println!("  max push constants      {}", caps.max_push_constant_size);
    println!("  max color attachments   {}", caps.max_color_attachments);
    println!("  max descriptor sets     {}", caps.max_bound_descriptor_sets);
    println!("Compute:  {}", caps.supports_compute);
    println!("Readback: {}", caps.supports_readback);
    println!("Validation: {}", caps.validation);
    println!("Shader sources: {:?}", caps.shader_sources);
    println!("Queues:   {:?}", caps.queues);
    println!("Formats:");
    for support in &caps.formats {
        println!("  {:<22} {:?}", format!("{:?}", support.format), support.usage);
    }
}

// =============================================================================
// CHECKS
// =============================================================================

fn upload_lights(device: &GraphicsDevice, scene: &mut Scene) -> Result<()> {
    scene.add_light(DirectionalLight::new(Vec3::new(-0.3, -1.0, -0.2), Vec3::ONE, 1.0));
    scene.add_light(PointLight::new(Vec3::new(2.0, 1.0, 0.0), 8.0, Vec3::new(1.0, 0.6, 0.3), 3.0));
    scene.add_light(SpotLight::new(
        Vec3::new(0.0, 4.0, 0.0),
        Vec3::NEG_Y,
        15.0,
        25.0,
        12.0,
        Vec3::new(0.9, 0.9, 1.0),
        2.0,
    ));

    let buffer = scene.initialize_light_buffer(device)?.clone();
    match scene.update_light_buffer()? {
        LightBufferUpdate::Uploaded => {}
        LightBufferUpdate::NotInitialized => bail!("light buffer was not created"),
    }

    let expected = scene.gpu_data();
    let bytes = buffer.read_to_vec()?;
    if bytes != expected.as_bytes() {
        bail!("light buffer contents differ after upload");
    }
    println!("Light buffer: {} lights, {} bytes OK", scene.light_count(), bytes.len());
    Ok(())
}

fn clear_and_read_back(device: &GraphicsDevice) -> Result<()> {
    let caps = device.capabilities();
    let usage = TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC;
    if !caps.supports_readback || !caps.supports_format(Format::R8G8B8A8Unorm, usage) {
        println!("Readback: skipped, not supported by this backend");
        return Ok(());
    }

    let target = device.create_texture(
        &TextureDesc::new_2d(PROBE_EXTENT, PROBE_EXTENT, Format::R8G8B8A8Unorm, usage)
            .with_label("probe target"),
    )?;
    let framebuffer = device.create_framebuffer(&FramebufferDesc {
        label: Some("probe".to_string()),
        color_attachments: vec![target.clone()],
        depth_attachment: None,
    })?;
    let size = target.desc().mip_byte_size(0);
    let readback = device.create_buffer(
        &BufferDesc::new(size, BufferUsage::TRANSFER_DST, MemoryUsage::GpuToCpu)
            .with_label("probe readback"),
    )?;

    let cmd = device.create_command_buffer(QueueType::Graphics)?;
    cmd.begin_rendering(&framebuffer, &[LoadOp::Clear(ClearValue::Color(CLEAR_COLOR))])?;
    cmd.end_rendering()?;
    cmd.copy_texture_to_buffer(&target, 0, &readback, 0)?;
    cmd.finish()?;

    let index = device.submit(&cmd, &SubmitInfo::default())?;
    if !device.wait(index, GPU_TIMEOUT)? {
        bail!("clear did not complete within {:?}", GPU_TIMEOUT);
    }

    let pixels = readback.read_to_vec()?;
    let expected: Vec<u8> = CLEAR_COLOR
        .iter()
        .map(|c| (c * 255.0).round() as u8)
        .collect();
    let mismatched = pixels
        .chunks_exact(4)
        .filter(|px| px.iter().zip(&expected).any(|(a, b)| a.abs_diff(*b) > 1))
        .count();
    if mismatched > 0 {
        bail!("{mismatched} pixels differ from the clear color");
    }
    println!("Readback: {}x{} clear OK", PROBE_EXTENT, PROBE_EXTENT);
    Ok(())
}
