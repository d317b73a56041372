// Surfaces and swap chains
//
// A WebGPU surface hands out exactly one texture at a time and only right
// before presenting, so the swap chain renders into its own ring of textures
// and copies the chosen one into the surface texture at present time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::conv;
use super::resources::WebGpuTexture;
use crate::rhi::hal::*;
use crate::rhi::surface::WindowTarget;
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

pub struct WebGpuSurface {
    pub raw: wgpu::Surface<'static>,
}

impl WebGpuSurface {
    pub fn new(instance: &wgpu::Instance, target: &WindowTarget) -> RhiResult<Self> {
        // The caller of `SurfaceTarget::from_window` guarantees the window
        // outlives every swap chain built on it
        let raw = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: target.display,
                raw_window_handle: target.window,
            })
        }
        .map_err(|e| RhiError::unsupported(ResourceKind::Surface, e.to_string()))?;
        log::debug!("Created WebGPU surface for {}x{} window", target.width, target.height);
        Ok(Self { raw })
    }
}

impl SurfaceBackend for WebGpuSurface {}

pub struct WebGpuSwapChain {
    surface: Arc<dyn SurfaceBackend>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    format: Format,
    extent: wgpu::Extent3d,
    textures: Vec<wgpu::Texture>,
    next: AtomicU32,
    images: Mutex<Option<Vec<Box<dyn TextureBackend>>>>,
}

impl WebGpuSwapChain {
    pub fn new(
        adapter: &wgpu::Adapter,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        surface: &Arc<dyn SurfaceBackend>,
        desc: &SwapChainDesc,
    ) -> RhiResult<Self> {
        let raw_surface = &downcast::<WebGpuSurface>(surface.as_any(), ResourceKind::Surface)?.raw;
        let caps = raw_surface.get_capabilities(adapter);
        if caps.formats.is_empty() {
            return Err(RhiError::unsupported(
                ResourceKind::SwapChain,
                "the adapter cannot present to this surface",
            ));
        }
        if !caps.usages.contains(wgpu::TextureUsages::COPY_DST) {
            return Err(RhiError::unsupported(
                ResourceKind::SwapChain,
                "surface textures cannot be copy destinations",
            ));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::SurfaceLost);
        }

        // Prefer sRGB BGRA, then anything the RHI can name
        let (surface_format, format) = caps
            .formats
            .iter()
            .filter_map(|f| conv::format_from_wgpu(*f).map(|ours| (*f, ours)))
            .max_by_key(|(_, ours)| (*ours == Format::B8G8R8A8Srgb) as u8 * 2 + ours.is_srgb() as u8)
            .ok_or_else(|| {
                RhiError::unsupported(ResourceKind::SwapChain, "no supported surface format")
            })?;

        let wanted = conv::present_mode(desc.present_mode);
        let present_mode = if caps.present_modes.contains(&wanted) {
            wanted
        } else {
            log::warn!(
                "Present mode {:?} not supported by the surface, using FIFO",
                desc.present_mode
            );
            wgpu::PresentMode::Fifo
        };
        log::info!("Present mode: {:?}", present_mode);

        let image_count = match desc.image_count {
            0 => 3,
            n => n.clamp(2, 8),
        };
        raw_surface.configure(
            device,
            &wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST,
                format: surface_format,
                width: desc.width,
                height: desc.height,
                present_mode,
                desired_maximum_frame_latency: desc.frames_in_flight.max(1),
                alpha_mode: caps
                    .alpha_modes
                    .first()
                    .copied()
                    .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                view_formats: vec![],
            },
        );

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
            let image = WebGpuTexture::new(device, &image_desc)?;
            textures.push(image.raw.clone());
            images.push(Box::new(image));
        }

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}",
            desc.width,
            desc.height,
            image_count,
            format
        );
        Ok(Self {
            surface: Arc::clone(surface),
            device: device.clone(),
            queue: queue.clone(),
            format,
            extent: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            textures,
            next: AtomicU32::new(0),
            images: Mutex::new(Some(images)),
        })
    }

    fn raw_surface(&self) -> RhiResult<&wgpu::Surface<'static>> {
        Ok(&downcast::<WebGpuSurface>(self.surface.as_any(), ResourceKind::Surface)?.raw)
    }
}

impl SwapChainBackend for WebGpuSwapChain {
    fn format(&self) -> Format {
        self.format
    }

    fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
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
        // The frontend bounds how many images are held, so a ring never
        // hands out an image that is still acquired
        let count = self.textures.len() as u32;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % count;
        Ok((index, false))
    }

    fn present(&self, index: u32, _wait: &[&dyn SemaphoreBackend]) -> RhiResult<bool> {
        let image = self.textures.get(index as usize).ok_or_else(|| {
            RhiError::InvalidUsage(format!("swap chain image {index} does not exist"))
        })?;
        let frame = match self.raw_surface()?.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                return Err(RhiError::SurfaceLost)
            }
            Err(wgpu::SurfaceError::Timeout) => return Err(RhiError::Timeout),
            Err(other) => return Err(RhiError::Submission(format!("present failed: {other}"))),
        };
        let suboptimal = frame.suboptimal;

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("present blit"),
        });
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: image,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &frame.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            self.extent,
        );
        self.queue.submit([encoder.finish()]);
        frame.present();
        Ok(suboptimal)
    }
}
