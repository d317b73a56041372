mod common;

use std::time::Duration;

use common::{headless, host_buffer, readback_buffer};
use tri_rhi::{
    BackendKind, BufferUsage, ClearValue, CommandBufferState, ComputePipelineDesc, DescriptorBinding,
    DescriptorSet, DescriptorSetDesc, DescriptorSetLayoutDesc, DescriptorType, DeviceDesc, Format,
    FramebufferDesc, GraphicsDevice, LoadOp, Pipeline, PipelineDesc, QueueType, RhiError,
    ShaderDesc, ShaderSource, ShaderStage, ShaderStages, SubmitInfo, TextureDesc, TextureUsage,
};

const STORAGE_LAYOUT_WGSL: &str = "@group(0) @binding(0) var<storage, read_write> data: array<u32>;
@compute @workgroup_size(64) fn main() {}";

fn storage_layout() -> DescriptorSetLayoutDesc {
    DescriptorSetLayoutDesc {
        bindings: vec![DescriptorBinding {
            binding: 0,
            ty: DescriptorType::StorageBuffer,
            stages: ShaderStages::COMPUTE,
        }],
    }
}

fn compute_pipeline(device: &GraphicsDevice) -> (Pipeline, DescriptorSet) {
    let shader = device
        .create_shader(&ShaderDesc::new(
            ShaderStage::Compute,
            ShaderSource::Wgsl(STORAGE_LAYOUT_WGSL.to_string()),
        ))
        .unwrap();
    let mut desc = ComputePipelineDesc::new(shader);
    desc.descriptor_layouts = vec![storage_layout()];
    let pipeline = device.create_pipeline(&PipelineDesc::Compute(desc)).unwrap();
    let set = device
        .create_descriptor_set(&DescriptorSetDesc {
            label: Some("storage".to_string()),
            layout: storage_layout(),
        })
        .unwrap();
    (pipeline, set)
}

/// Bind `set`, dispatch once and submit without waiting
fn submit_dispatch(device: &GraphicsDevice, pipeline: &Pipeline, set: &DescriptorSet) {
    let cmd = device.create_command_buffer(QueueType::Compute).unwrap();
    cmd.bind_pipeline(pipeline).unwrap();
    cmd.bind_descriptor_set(0, set).unwrap();
    cmd.dispatch(1, 1, 1).unwrap();
    cmd.finish().unwrap();
    device.submit(&cmd, &SubmitInfo::default()).unwrap();
}

#[test]
fn lifecycle_follows_submission() {
    let device = headless();
    let src = host_buffer(&device, 16, BufferUsage::TRANSFER_SRC);
    let dst = readback_buffer(&device, 16);

    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Recording);
    cmd.copy_buffer(&src, 0, &dst, 0, 16).unwrap();

    // Unfinished buffers cannot be submitted
    assert!(matches!(
        device.submit(&cmd, &SubmitInfo::default()),
        Err(RhiError::Submission(_))
    ));
    cmd.finish().unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Ready);

    device.submit(&cmd, &SubmitInfo::default()).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Submitted);
    assert!(matches!(
        cmd.copy_buffer(&src, 0, &dst, 0, 16),
        Err(RhiError::Submission(_))
    ));
    assert!(matches!(cmd.reset(), Err(RhiError::Submission(_))));
    // A submitted buffer is not ready any more
    assert!(matches!(
        device.submit(&cmd, &SubmitInfo::default()),
        Err(RhiError::Submission(_))
    ));

    device.poll().unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Completed);
    cmd.reset().unwrap();
    assert!(cmd.is_empty());
    cmd.copy_buffer(&src, 0, &dst, 0, 16).unwrap();
    assert_eq!(cmd.len(), 1);
}

#[test]
fn copies_execute_in_program_order() {
    let device = headless();
    let a = host_buffer(&device, 4, BufferUsage::TRANSFER_SRC);
    let b = host_buffer(&device, 4, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST);
    let out = readback_buffer(&device, 4);
    a.copy_data(&[1, 2, 3, 4]).unwrap();
    b.copy_data(&[9, 9, 9, 9]).unwrap();

    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    cmd.copy_buffer(&a, 0, &b, 0, 4).unwrap();
    cmd.copy_buffer(&b, 0, &out, 0, 4).unwrap();
    cmd.finish().unwrap();
    device.submit(&cmd, &SubmitInfo::default()).unwrap();
    device.wait_idle().unwrap();

    assert_eq!(out.read_to_vec().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn resources_of_another_device_are_rejected() {
    let device = headless();
    let other = headless();
    let foreign = host_buffer(&other, 16, BufferUsage::TRANSFER_SRC);
    let local = readback_buffer(&device, 16);

    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    assert!(matches!(
        cmd.copy_buffer(&foreign, 0, &local, 0, 16),
        Err(RhiError::InvalidUsage(_))
    ));

    let theirs = other.create_command_buffer(QueueType::Transfer).unwrap();
    theirs.finish().unwrap();
    assert!(matches!(
        device.submit(&theirs, &SubmitInfo::default()),
        Err(RhiError::Submission(_))
    ));
}

#[test]
fn rendering_scope_rules() {
    let device = headless();
    let target = device
        .create_texture(&TextureDesc::new_2d(
            4,
            4,
            Format::R8G8B8A8Unorm,
            TextureUsage::COLOR_ATTACHMENT,
        ))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(&FramebufferDesc {
            label: None,
            color_attachments: vec![target],
            depth_attachment: None,
        })
        .unwrap();

    let cmd = device.create_command_buffer(QueueType::Graphics).unwrap();
    assert!(matches!(cmd.end_rendering(), Err(RhiError::InvalidUsage(_))));
    assert!(matches!(
        cmd.begin_rendering(
            &framebuffer,
            &[LoadOp::Clear(ClearValue::DepthStencil { depth: 1.0, stencil: 0 })]
        ),
        Err(RhiError::InvalidUsage(_))
    ));
    cmd.begin_rendering(&framebuffer, &[]).unwrap();
    assert!(matches!(cmd.finish(), Err(RhiError::InvalidUsage(_))));
    cmd.end_rendering().unwrap();
    cmd.finish().unwrap();

    let compute = device.create_command_buffer(QueueType::Compute).unwrap();
    assert!(matches!(
        compute.begin_rendering(&framebuffer, &[]),
        Err(RhiError::InvalidUsage(_))
    ));
}

#[test]
fn clear_then_read_back() {
    let device = headless();
    let target = device
        .create_texture(&TextureDesc::new_2d(
            8,
            8,
            Format::B8G8R8A8Unorm,
            TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC,
        ))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(&FramebufferDesc {
            label: None,
            color_attachments: vec![target.clone()],
            depth_attachment: None,
        })
        .unwrap();
    let readback = readback_buffer(&device, 8 * 8 * 4);

    let cmd = device.create_command_buffer(QueueType::Graphics).unwrap();
    cmd.begin_rendering(&framebuffer, &[LoadOp::Clear(ClearValue::Color([1.0, 0.0, 0.0, 1.0]))])
        .unwrap();
    cmd.end_rendering().unwrap();
    cmd.copy_texture_to_buffer(&target, 0, &readback, 0).unwrap();
    cmd.finish().unwrap();

    let index = device.submit(&cmd, &SubmitInfo::default()).unwrap();
    assert!(device.wait(index, Duration::from_secs(1)).unwrap());
    let pixels = readback.read_to_vec().unwrap();
    assert!(pixels.chunks_exact(4).all(|px| px == [0, 0, 255, 255]));
}

#[test]
fn readback_buffer_too_small_is_an_overflow() {
    let device = headless();
    let target = device
        .create_texture(&TextureDesc::new_2d(
            8,
            8,
            Format::R8G8B8A8Unorm,
            TextureUsage::TRANSFER_SRC,
        ))
        .unwrap();
    let readback = readback_buffer(&device, 16);
    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    assert!(matches!(
        cmd.copy_texture_to_buffer(&target, 0, &readback, 0),
        Err(RhiError::BufferOverflow { .. })
    ));
}

#[test]
fn rewriting_an_in_flight_descriptor_set_is_rejected() {
    let device = headless();
    let (pipeline, set) = compute_pipeline(&device);
    let a = host_buffer(&device, 64, BufferUsage::STORAGE);
    let b = host_buffer(&device, 64, BufferUsage::STORAGE);
    set.write_buffer(0, &a).unwrap();

    submit_dispatch(&device, &pipeline, &set);
    drop(a);
    assert!(matches!(set.write_buffer(0, &b), Err(RhiError::Validation(_))));
    // The rejected write left `a` bound, so both buffers are alive
    let buffers = device.live_resources().iter().filter(|l| *l == "buffer").count();
    assert_eq!(buffers, 2);

    device.wait_idle().unwrap();
    set.write_buffer(0, &b).unwrap();
}

#[test]
fn replaced_binding_outlives_the_submission_without_validation() {
    common::init_logging();
    let device = GraphicsDevice::new(&DeviceDesc {
        validation: false,
        ..DeviceDesc::with_backend(BackendKind::Headless)
    })
    .unwrap();
    let (pipeline, set) = compute_pipeline(&device);
    let a = host_buffer(&device, 64, BufferUsage::STORAGE);
    let b = host_buffer(&device, 64, BufferUsage::STORAGE);
    set.write_buffer(0, &a).unwrap();
    submit_dispatch(&device, &pipeline, &set);
    let live_before = device.live_resource_count();

    drop(a);
    set.write_buffer(0, &b).unwrap();
    assert_eq!(device.live_resource_count(), live_before);

    // Once the submission retires, the next write releases it
    device.wait_idle().unwrap();
    set.write_buffer(0, &b).unwrap();
    assert_eq!(device.live_resource_count(), live_before - 1);
}

#[test]
fn failed_submission_leaves_the_buffer_ready() {
    let device = headless();
    let src = host_buffer(&device, 16, BufferUsage::TRANSFER_SRC);
    let dst = readback_buffer(&device, 16);
    let never_signalled = device.create_semaphore().unwrap();

    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    cmd.copy_buffer(&src, 0, &dst, 0, 16).unwrap();
    cmd.finish().unwrap();
    let info = SubmitInfo {
        wait: &[&never_signalled],
        signal: &[],
    };
    assert!(matches!(device.submit(&cmd, &info), Err(RhiError::Submission(_))));
    assert_eq!(cmd.state(), CommandBufferState::Ready);

    device.submit(&cmd, &SubmitInfo::default()).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Submitted);
}

#[test]
fn clones_submitted_concurrently_run_once() {
    let device = headless();
    let src = host_buffer(&device, 16, BufferUsage::TRANSFER_SRC);
    let dst = readback_buffer(&device, 16);
    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    cmd.copy_buffer(&src, 0, &dst, 0, 16).unwrap();
    cmd.finish().unwrap();

    let accepted = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cmd = cmd.clone();
                let device = &device;
                scope.spawn(move || device.submit(&cmd, &SubmitInfo::default()).is_ok())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count()
    });
    assert_eq!(accepted, 1);
    assert_eq!(cmd.state(), CommandBufferState::Submitted);
}
