mod common;

use common::{headless, headless_with, host_buffer};
use tri_rhi::backend::HeadlessOptions;
use tri_rhi::{
    BackendKind, BufferUsage, DeviceDesc, GraphicsDevice, QueueType, RhiError, SubmitInfo,
};

#[test]
fn headless_reports_itself() {
    let device = headless_with(HeadlessOptions {
        adapter_name: Some("probe adapter".to_string()),
        ..HeadlessOptions::default()
    });
    assert_eq!(device.backend(), BackendKind::Headless);
    let info = device.info();
    assert_eq!(info.name, "probe adapter");
    assert_eq!(info.backend, BackendKind::Headless);
    let caps = device.capabilities();
    assert!(caps.supports_readback);
    assert!(caps.supports_queue(QueueType::Transfer));
}

#[test]
fn clean_destroy() {
    let device = headless();
    let buffer = host_buffer(&device, 16, BufferUsage::UNIFORM);
    drop(buffer);
    device.destroy().unwrap();
}

#[test]
fn destroy_reports_live_resources() {
    let device = headless();
    let buffer = host_buffer(&device, 16, BufferUsage::UNIFORM);
    assert_eq!(device.live_resource_count(), 1);

    match device.destroy() {
        Err(RhiError::ResourceLeak { outstanding }) => assert_eq!(outstanding.len(), 1),
        other => panic!("expected a leak report, got {other:?}"),
    }
    assert_eq!(buffer.copy_data(&[0; 4]), Err(RhiError::DeviceDestroyed));
    assert_eq!(buffer.read_to_vec(), Err(RhiError::DeviceDestroyed));
}

#[test]
fn pending_work_does_not_count_as_a_leak() {
    let device = headless();
    {
        let src = host_buffer(&device, 16, BufferUsage::TRANSFER_SRC);
        let dst = host_buffer(&device, 16, BufferUsage::TRANSFER_DST);
        let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
        cmd.copy_buffer(&src, 0, &dst, 0, 16).unwrap();
        cmd.finish().unwrap();
        device.submit(&cmd, &SubmitInfo::default()).unwrap();
    }
    device.destroy().unwrap();
}

#[test]
fn device_loss_is_sticky() {
    let device = headless_with(HeadlessOptions {
        lose_device_after_submissions: Some(1),
        ..HeadlessOptions::default()
    });
    let submit_empty = || {
        let cmd = device.create_command_buffer(QueueType::Graphics)?;
        cmd.finish()?;
        device.submit(&cmd, &SubmitInfo::default())
    };
    submit_empty().unwrap();
    assert!(matches!(submit_empty(), Err(RhiError::DeviceLost(_))));

    let err = device
        .create_command_buffer(QueueType::Graphics)
        .unwrap_err();
    assert!(matches!(err, RhiError::DeviceLost(_)));
    assert!(err.is_fatal());
    assert!(matches!(device.poll(), Err(RhiError::DeviceLost(_))));
}

#[test]
fn backends_are_never_substituted() {
    common::init_logging();
    // Metal only exists on Apple platforms
    #[cfg(not(target_os = "macos"))]
    {
        let err = GraphicsDevice::new(&DeviceDesc::with_backend(BackendKind::Metal)).unwrap_err();
        assert!(matches!(
            err,
            RhiError::BackendUnavailable {
                backend: BackendKind::Metal,
                ..
            }
        ));
    }
    #[cfg(not(feature = "webgpu"))]
    {
        let err = GraphicsDevice::new(&DeviceDesc::with_backend(BackendKind::WebGpu)).unwrap_err();
        assert!(matches!(err, RhiError::BackendUnavailable { .. }));
    }
}

#[test]
fn devices_are_isolated() {
    let a = headless();
    let b = headless();
    assert_ne!(a.id(), b.id());
    let _buffer = host_buffer(&a, 16, BufferUsage::UNIFORM);
    assert_eq!(a.live_resource_count(), 1);
    assert_eq!(b.live_resource_count(), 0);
}
