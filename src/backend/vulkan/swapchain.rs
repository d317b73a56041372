// Window surfaces and swapchains
//
// The surface is created from raw window handles through ash-window. The
// swapchain picks an sRGB BGRA format when offered, honors the requested
// present mode where the surface has it and falls back to FIFO otherwise.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;

use super::context::VulkanContext;
use super::conv;
use super::resources::{semaphore, VulkanTexture};
use crate::rhi::hal::*;
use crate::rhi::surface::WindowTarget;
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

pub struct VulkanSurface {
    ctx: Arc<VulkanContext>,
    pub raw: vk::SurfaceKHR,
}

impl VulkanSurface {
    pub fn new(ctx: &Arc<VulkanContext>, target: &WindowTarget) -> RhiResult<Self> {
        if ctx.surface_loader.is_none() {
            return Err(RhiError::unsupported(
                ResourceKind::Surface,
                "VK_KHR_surface is not available on this system",
            ));
        }
        let raw = unsafe {
            ash_window::create_surface(&ctx.entry, &ctx.instance, target.display, target.window, None)
        }
        .map_err(|e| conv::creation_error(ResourceKind::Surface, e))?;

        log::debug!("Created Vulkan surface for {}x{} window", target.width, target.height);
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
        })
    }
}

impl SurfaceBackend for VulkanSurface {}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        if let Some(loader) = &self.ctx.surface_loader {
            unsafe { loader.destroy_surface(self.raw, None) };
        }
    }
}

pub struct VulkanSwapChain {
    ctx: Arc<VulkanContext>,
    // Keeps the surface alive for as long as the swapchain exists
    _surface: Arc<dyn SurfaceBackend>,
    pub raw: vk::SwapchainKHR,
    format: Format,
    extent: vk::Extent2D,
    usage: TextureUsage,
    max_acquired: u32,
    images: Mutex<Option<Vec<Box<dyn TextureBackend>>>>,
}

impl VulkanSwapChain {
    pub fn new(
        ctx: &Arc<VulkanContext>,
        surface: &Arc<dyn SurfaceBackend>,
        desc: &SwapChainDesc,
        old: Option<&dyn SwapChainBackend>,
    ) -> RhiResult<Self> {
        let raw_surface = downcast::<VulkanSurface>(surface.as_any(), ResourceKind::Surface)?.raw;
        let surface_loader = ctx.surface_loader.as_ref().ok_or_else(|| {
            RhiError::unsupported(ResourceKind::SwapChain, "VK_KHR_surface is not available")
        })?;
        let query_err = |e: vk::Result| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR => RhiError::SurfaceLost,
            other => conv::creation_error(ResourceKind::SwapChain, other),
        };

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                ctx.physical_device,
                ctx.queue_family,
                raw_surface,
            )
        }
        .map_err(query_err)?;
        if !supported {
            return Err(RhiError::unsupported(
                ResourceKind::SwapChain,
                "the graphics queue cannot present to this surface",
            ));
        }

        // Query surface capabilities
        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(ctx.physical_device, raw_surface)
        }
        .map_err(query_err)?;

        // Query supported formats and present modes
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(ctx.physical_device, raw_surface)
        }
        .map_err(query_err)?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(ctx.physical_device, raw_surface)
        }
        .map_err(query_err)?;

        // Choose surface format (prefer SRGB), limited to formats the RHI can name
        let (surface_format, format) = formats
            .iter()
            .filter_map(|f| conv::format_from_vk(f.format).map(|ours| (*f, ours)))
            .max_by_key(|(f, _)| {
                (f.format == vk::Format::B8G8R8A8_SRGB) as u8 * 2
                    + (f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR) as u8
            })
            .ok_or_else(|| {
                RhiError::unsupported(ResourceKind::SwapChain, "no supported surface format")
            })?;

        let wanted = conv::present_mode(desc.present_mode);
        let present_mode = if present_modes.contains(&wanted) {
            wanted
        } else {
            log::warn!(
                "Present mode {:?} not supported by the surface, using FIFO",
                desc.present_mode
            );
            vk::PresentModeKHR::FIFO
        };
        log::info!("Present mode: {:?}", present_mode);

        // Choose extent
        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: desc.width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: desc.height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };
        if extent.width == 0 || extent.height == 0 {
            // Minimized window
            return Err(RhiError::SurfaceLost);
        }

        // Choose image count (triple buffering unless asked otherwise)
        let mut image_count = match desc.image_count {
            0 => surface_caps.min_image_count + 1,
            n => n.max(surface_caps.min_image_count),
        };
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let mut usage = TextureUsage::COLOR_ATTACHMENT;
        let mut image_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        for extra in [TextureUsage::TRANSFER_SRC, TextureUsage::TRANSFER_DST] {
            let flag = conv::texture_usage(extra);
            if surface_caps.supported_usage_flags.contains(flag) {
                usage |= extra;
                image_usage |= flag;
            }
        }

        let old_swapchain = old
            .and_then(|old| old.as_any().downcast_ref::<VulkanSwapChain>())
            .map_or(vk::SwapchainKHR::null(), |old| old.raw);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(raw_surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let raw = unsafe { ctx.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(query_err)?;

        let mut swap_chain = Self {
            ctx: Arc::clone(ctx),
            _surface: Arc::clone(surface),
            raw,
            format,
            extent,
            usage,
            max_acquired: 1,
            images: Mutex::new(None),
        };

        let images = unsafe { ctx.swapchain_loader.get_swapchain_images(raw) }
            .map_err(|e| conv::creation_error(ResourceKind::SwapChain, e))?;
        let textures = images
            .iter()
            .map(|&image| {
                VulkanTexture::from_swap_image(ctx, image, format, extent)
                    .map(|t| Box::new(t) as Box<dyn TextureBackend>)
            })
            .collect::<RhiResult<Vec<_>>>()?;

        // The presentation engine may keep up to min_image_count images to itself
        let count = images.len() as u32;
        swap_chain.max_acquired = (count.saturating_sub(surface_caps.min_image_count) + 1).min(count);
        *swap_chain.images.get_mut() = Some(textures);

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            count,
            format
        );
        Ok(swap_chain)
    }
}

impl SwapChainBackend for VulkanSwapChain {
    fn format(&self) -> Format {
        self.format
    }

    fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    fn image_usage(&self) -> TextureUsage {
        self.usage
    }

    fn max_acquired(&self) -> u32 {
        self.max_acquired
    }

    fn take_images(&self) -> RhiResult<Vec<Box<dyn TextureBackend>>> {
        self.images
            .lock()
            .take()
            .ok_or_else(|| RhiError::InvalidUsage("swap chain images were already taken".into()))
    }

    fn acquire(&self, timeout: Duration, signal: &dyn SemaphoreBackend) -> RhiResult<(u32, bool)> {
        let signal = semaphore(signal)?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                self.raw,
                timeout_ns,
                signal.raw,
                vk::Fence::null(),
            )
        }
        .map_err(|e| conv::queue_error("vkAcquireNextImageKHR", e))
    }

    fn present(&self, index: u32, wait: &[&dyn SemaphoreBackend]) -> RhiResult<bool> {
        let wait_semaphores = wait
            .iter()
            .map(|s| semaphore(*s).map(|s| s.raw))
            .collect::<RhiResult<Vec<_>>>()?;
        let swapchains = [self.raw];
        let image_indices = [index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.ctx.queue.lock();
        unsafe { self.ctx.swapchain_loader.queue_present(*queue, &present_info) }
            .map_err(|e| conv::queue_error("vkQueuePresentKHR", e))
    }
}

impl Drop for VulkanSwapChain {
    fn drop(&mut self) {
        // Image views must go before the images they point at
        self.images.get_mut().take();
        unsafe { self.ctx.swapchain_loader.destroy_swapchain(self.raw, None) };
    }
}
