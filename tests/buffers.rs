mod common;

use std::time::Duration;

use common::{headless, headless_with, host_buffer, readback_buffer};
use tri_rhi::backend::HeadlessOptions;
use tri_rhi::{
    BufferDesc, BufferUsage, CreationFailure, MemoryUsage, QueueType, ResourceKind, RhiError,
    SubmitInfo,
};

#[test]
fn host_visible_round_trip() {
    let device = headless();
    let buffer = host_buffer(&device, 64, BufferUsage::UNIFORM);
    let data: Vec<u8> = (0..64).collect();
    buffer.copy_data(&data).unwrap();
    assert_eq!(buffer.read_to_vec().unwrap(), data);

    buffer.copy_data_at(60, &[0xaa; 4]).unwrap();
    let mut tail = [0u8; 8];
    buffer.read_data(56, &mut tail).unwrap();
    assert_eq!(tail, [56, 57, 58, 59, 0xaa, 0xaa, 0xaa, 0xaa]);
}

#[test]
fn overflow_writes_nothing() {
    let device = headless();
    let buffer = host_buffer(&device, 16, BufferUsage::UNIFORM);
    buffer.copy_data(&[7; 16]).unwrap();

    let err = buffer.copy_data(&[1; 17]).unwrap_err();
    assert_eq!(
        err,
        RhiError::BufferOverflow {
            offset: 0,
            len: 17,
            size: 16
        }
    );
    assert!(matches!(
        buffer.copy_data_at(12, &[1; 8]),
        Err(RhiError::BufferOverflow { .. })
    ));
    assert_eq!(buffer.read_to_vec().unwrap(), vec![7; 16]);
}

#[test]
fn gpu_only_upload_is_staged() {
    // Room for the target plus one staging copy of it
    let device = headless_with(HeadlessOptions {
        memory_budget: Some(64),
        ..HeadlessOptions::default()
    });
    let gpu = device
        .create_buffer(&BufferDesc::new(
            32,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            MemoryUsage::GpuOnly,
        ))
        .unwrap();
    let data: Vec<u8> = (100..132).collect();
    gpu.copy_data(&data).unwrap();
    assert!(device.last_submitted() > device.completed());
    assert!(matches!(
        device.create_buffer(&BufferDesc::new(32, BufferUsage::TRANSFER_DST, MemoryUsage::GpuToCpu)),
        Err(RhiError::ResourceCreation {
            reason: CreationFailure::OutOfDeviceMemory,
            ..
        })
    ));

    // Retiring the copy releases the staging memory
    device.wait_idle().unwrap();
    let readback = readback_buffer(&device, 32);
    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    cmd.copy_buffer(&gpu, 0, &readback, 0, 32).unwrap();
    cmd.finish().unwrap();
    let index = device.submit(&cmd, &SubmitInfo::default()).unwrap();
    assert!(device.wait(index, Duration::from_secs(1)).unwrap());
    assert_eq!(readback.read_to_vec().unwrap(), data);
}

#[test]
fn gpu_only_without_transfer_dst_is_rejected() {
    let device = headless();
    let gpu = device
        .create_buffer(&BufferDesc::new(16, BufferUsage::VERTEX, MemoryUsage::GpuOnly))
        .unwrap();
    assert!(matches!(
        gpu.copy_data(&[0; 16]),
        Err(RhiError::InvalidUsage(_))
    ));
    assert!(matches!(
        gpu.read_to_vec(),
        Err(RhiError::InvalidUsage(_))
    ));
}

#[test]
fn zero_sized_buffers_are_invalid() {
    let device = headless();
    let err = device
        .create_buffer(&BufferDesc::new(0, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu))
        .unwrap_err();
    assert!(matches!(
        err,
        RhiError::ResourceCreation {
            kind: ResourceKind::Buffer,
            reason: CreationFailure::InvalidDesc(_)
        }
    ));
}

#[test]
fn writing_a_buffer_in_use_is_a_validation_error() {
    let device = headless();
    let src = host_buffer(&device, 16, BufferUsage::TRANSFER_SRC);
    let dst = readback_buffer(&device, 16);
    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    cmd.copy_buffer(&src, 0, &dst, 0, 16).unwrap();
    cmd.finish().unwrap();
    device.submit(&cmd, &SubmitInfo::default()).unwrap();

    assert!(matches!(
        src.copy_data(&[1; 16]),
        Err(RhiError::Validation(_))
    ));
    device.wait_idle().unwrap();
    src.copy_data(&[1; 16]).unwrap();
}

#[test]
fn writing_a_buffer_in_use_without_validation_only_warns() {
    common::init_logging();
    let device = tri_rhi::GraphicsDevice::new(&tri_rhi::DeviceDesc {
        validation: false,
        ..common::headless_desc()
    })
    .unwrap();
    let src = host_buffer(&device, 16, BufferUsage::TRANSFER_SRC);
    let dst = readback_buffer(&device, 16);
    let cmd = device.create_command_buffer(QueueType::Transfer).unwrap();
    cmd.copy_buffer(&src, 0, &dst, 0, 16).unwrap();
    cmd.finish().unwrap();
    device.submit(&cmd, &SubmitInfo::default()).unwrap();

    src.copy_data(&[1; 16]).unwrap();
}

#[test]
fn memory_budget_is_enforced() {
    let device = headless_with(HeadlessOptions {
        memory_budget: Some(1024),
        ..HeadlessOptions::default()
    });
    let first = host_buffer(&device, 768, BufferUsage::UNIFORM);
    let err = device
        .create_buffer(&BufferDesc::new(512, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu))
        .unwrap_err();
    assert_eq!(err, RhiError::out_of_memory(ResourceKind::Buffer));

    drop(first);
    assert!(device
        .create_buffer(&BufferDesc::new(512, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu))
        .is_ok());
}
