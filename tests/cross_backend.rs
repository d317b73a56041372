//! Same work on every backend that initializes on this machine. Needs real
//! GPUs, so it only runs with `cargo test -- --ignored`.

mod common;

use std::time::Duration;

use tri_rhi::{
    BackendKind, BufferDesc, BufferUsage, ClearValue, DeviceDesc, Format, FramebufferDesc,
    GraphicsDevice, LoadOp, MemoryUsage, QueueType, RhiError, SubmitInfo, TextureDesc,
    TextureUsage,
};

const EXTENT: u32 = 16;
const COLOR: [f32; 4] = [0.25, 0.5, 0.75, 1.0];

fn clear_and_read(device: &GraphicsDevice) -> Result<Vec<u8>, RhiError> {
    let target = device.create_texture(&TextureDesc::new_2d(
        EXTENT,
        EXTENT,
        Format::R8G8B8A8Unorm,
        TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC,
    ))?;
    let framebuffer = device.create_framebuffer(&FramebufferDesc {
        label: None,
        color_attachments: vec![target.clone()],
        depth_attachment: None,
    })?;
    let readback = device.create_buffer(&BufferDesc::new(
        u64::from(EXTENT * EXTENT * 4),
        BufferUsage::TRANSFER_DST,
        MemoryUsage::GpuToCpu,
    ))?;

    let cmd = device.create_command_buffer(QueueType::Graphics)?;
    cmd.begin_rendering(&framebuffer, &[LoadOp::Clear(ClearValue::Color(COLOR))])?;
    cmd.end_rendering()?;
    cmd.copy_texture_to_buffer(&target, 0, &readback, 0)?;
    cmd.finish()?;
    let index = device.submit(&cmd, &SubmitInfo::default())?;
    if !device.wait(index, Duration::from_secs(5))? {
        return Err(RhiError::Timeout);
    }
    readback.read_to_vec()
}

#[test]
#[ignore = "needs a GPU"]
fn clear_matches_across_backends() {
    common::init_logging();
    let reference = clear_and_read(&common::headless()).unwrap();

    let mut compared = 0;
    for kind in [BackendKind::Vulkan, BackendKind::Metal, BackendKind::WebGpu] {
        let device = match GraphicsDevice::new(&DeviceDesc::with_backend(kind)) {
            Ok(device) => device,
            Err(err) => {
                log::info!("skipping {kind}: {err}");
                continue;
            }
        };
        let pixels = clear_and_read(&device).unwrap();
        let worst = pixels
            .iter()
            .zip(&reference)
            .map(|(a, b)| a.abs_diff(*b))
            .max()
            .unwrap_or(0);
        assert!(worst <= 1, "{kind} differs from the reference by {worst}");
        compared += 1;
    }
    assert!(compared > 0, "no GPU backend initialized");
}
