#![allow(dead_code)]

use tri_rhi::backend::HeadlessOptions;
use tri_rhi::{BackendKind, Buffer, BufferDesc, BufferUsage, DeviceDesc, GraphicsDevice, MemoryUsage};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn headless_desc() -> DeviceDesc {
    DeviceDesc {
        validation: true,
        ..DeviceDesc::with_backend(BackendKind::Headless)
    }
}

pub fn headless() -> GraphicsDevice {
    init_logging();
    GraphicsDevice::new(&headless_desc()).expect("headless device")
}

pub fn headless_with(options: HeadlessOptions) -> GraphicsDevice {
    init_logging();
    GraphicsDevice::new(&DeviceDesc {
        headless: options,
        ..headless_desc()
    })
    .expect("headless device")
}

pub fn host_buffer(device: &GraphicsDevice, size: u64, usage: BufferUsage) -> Buffer {
    device
        .create_buffer(&BufferDesc::new(size, usage, MemoryUsage::CpuToGpu))
        .expect("host buffer")
}

pub fn readback_buffer(device: &GraphicsDevice, size: u64) -> Buffer {
    device
        .create_buffer(&BufferDesc::new(size, BufferUsage::TRANSFER_DST, MemoryUsage::GpuToCpu))
        .expect("readback buffer")
}
