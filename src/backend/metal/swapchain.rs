// Surfaces and swap chains
//
// A CAMetalLayer attached to the window's NSView. Drawables are only valid
// for a single frame and are handed out at present time, so the swap chain
// renders into its own ring of textures and blits the chosen one into the
// next drawable when presenting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use core_graphics_types::geometry::CGSize;
use metal::{MTLOrigin, MTLPixelFormat, MTLSize};
use objc::runtime::{Object, YES};
use objc::{msg_send, sel, sel_impl};
use parking_lot::Mutex;
use raw_window_handle::RawWindowHandle;

use super::resources::MetalTexture;
use crate::rhi::hal::*;
use crate::rhi::surface::WindowTarget;
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

pub struct MetalSurface {
    pub layer: metal::MetalLayer,
}

impl MetalSurface {
    pub fn new(device: &metal::Device, target: &WindowTarget) -> RhiResult<Self> {
        let RawWindowHandle::AppKit(handle) = target.window else {
            return Err(RhiError::unsupported(
                ResourceKind::Surface,
                "Metal surfaces need an AppKit window",
            ));
        };

        let layer = metal::MetalLayer::new();
        layer.set_device(device);
        layer.set_presents_with_transaction(false);

        // The caller of `SurfaceTarget::from_window` guarantees the view
        // outlives every swap chain built on it
        unsafe {
            let view = handle.ns_view.as_ptr() as *mut Object;
            let layer_ptr = &*layer as *const metal::MetalLayerRef as *mut Object;
            let () = msg_send![view, setWantsLayer: YES];
            let () = msg_send![view, setLayer: layer_ptr];
        }
        log::debug!("Attached CAMetalLayer to {}x{} window", target.width, target.height);
        Ok(Self { layer })
    }
}

impl SurfaceBackend for MetalSurface {}

pub struct MetalSwapChain {
    surface: Arc<dyn SurfaceBackend>,
    queue: metal::CommandQueue,
    format: Format,
    extent: (u32, u32),
    textures: Vec<metal::Texture>,
    next: AtomicU32,
    images: Mutex<Option<Vec<Box<dyn TextureBackend>>>>,
}

impl MetalSwapChain {
    pub fn new(
        device: &metal::Device,
        queue: &metal::CommandQueue,
        surface: &Arc<dyn SurfaceBackend>,
        desc: &SwapChainDesc,
    ) -> RhiResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::SurfaceLost);
        }
        let layer = &downcast::<MetalSurface>(surface.as_any(), ResourceKind::Surface)?.layer;

        let vsync = match desc.present_mode {
            PresentMode::Fifo => true,
            PresentMode::Immediate => false,
            other => {
                log::warn!("Present mode {:?} not supported by Metal, using FIFO", other);
                true
            }
        };
        let format = Format::B8G8R8A8Srgb;
        layer.set_pixel_format(MTLPixelFormat::BGRA8Unorm_sRGB);
        // Presenting is a blit, so drawables must be copy targets
        layer.set_framebuffer_only(false);
        layer.set_drawable_size(CGSize::new(f64::from(desc.width), f64::from(desc.height)));
        layer.set_display_sync_enabled(vsync);
        layer.set_maximum_drawable_count(u64::from(desc.frames_in_flight.clamp(2, 3)));

        let image_count = match desc.image_count {
            0 => 3,
            n => n.clamp(2, 8),
        };
        let image_desc = TextureDesc::new_2d(
            desc.width,
            desc.height,
            format,
            TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST,
        )
        .with_label("swap chain image");
        let mut textures = Vec::with_capacity(image_count as usize);
        let mut images: Vec<Box<dyn TextureBackend>> = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            let image = MetalTexture::new(device, &image_desc)?;
            textures.push(image.raw.clone());
            images.push(Box::new(image));
        }

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, vsync {}",
            desc.width,
            desc.height,
            image_count,
            format,
            vsync
        );
        Ok(Self {
            surface: Arc::clone(surface),
            queue: queue.clone(),
            format,
            extent: (desc.width, desc.height),
            textures,
            next: AtomicU32::new(0),
            images: Mutex::new(Some(images)),
        })
    }

    fn layer(&self) -> RhiResult<&metal::MetalLayerRef> {
        Ok(&downcast::<MetalSurface>(self.surface.as_any(), ResourceKind::Surface)?.layer)
    }
}

impl SwapChainBackend for MetalSwapChain {
    fn format(&self) -> Format {
        self.format
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn image_usage(&self) -> TextureUsage {
        TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST
    }

    fn max_acquired(&self) -> u32 {
        self.textures.len() as u32 - 1
    }

    fn take_images(&self) -> RhiResult<Vec<Box<dyn TextureBackend>>> {
        self.images
            .lock()
            .take()
            .ok_or_else(|| RhiError::InvalidUsage("swap chain images were already taken".into()))
    }

    fn acquire(&self, _timeout: Duration, _signal: &dyn SemaphoreBackend) -> RhiResult<(u32, bool)> {
        let count = self.textures.len() as u32;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % count;
        Ok((index, false))
    }

    fn present(&self, index: u32, _wait: &[&dyn SemaphoreBackend]) -> RhiResult<bool> {
        let image = self.textures.get(index as usize).ok_or_else(|| {
            RhiError::InvalidUsage(format!("swap chain image {index} does not exist"))
        })?;
        let layer = self.layer()?;

        objc::rc::autoreleasepool(|| {
            // nextDrawable gives up after about a second
            let drawable = layer.next_drawable().ok_or(RhiError::Timeout)?;
            let target = drawable.texture();
            let (width, height) = (u64::from(self.extent.0), u64::from(self.extent.1));
            let suboptimal = target.width() != width || target.height() != height;

            let command_buffer = self.queue.new_command_buffer();
            command_buffer.set_label("present blit");
            let blit = command_buffer.new_blit_command_encoder();
            let origin = MTLOrigin { x: 0, y: 0, z: 0 };
            blit.copy_from_texture(
                image,
                0,
                0,
                origin,
                MTLSize::new(width.min(target.width()), height.min(target.height()), 1),
                target,
                0,
                0,
                origin,
            );
            blit.end_encoding();
            command_buffer.present_drawable(drawable);
            command_buffer.commit();
            Ok(suboptimal)
        })
    }
}
