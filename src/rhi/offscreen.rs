// Offscreen presentation
//
// Swap chain over ordinary backend textures, used when the surface provider
// hands out an `OffscreenTarget` instead of a window. Works with every backend,
// which is what lets tools and tests drive the full acquire/present protocol
// without a display.

use std::time::Duration;

use parking_lot::Mutex;

use super::error::{ResourceKind, RhiError, RhiResult};
use super::hal::{DeviceBackend, SemaphoreBackend, SwapChainBackend, TextureBackend};
use super::surface::OffscreenTarget;
use super::types::*;

const DEFAULT_IMAGE_COUNT: u32 = 3;
const IMAGE_COUNT_RANGE: (u32, u32) = (2, 8);

struct OffscreenImages {
    pending: Option<Vec<Box<dyn TextureBackend>>>,
    in_use: Vec<bool>,
    next: usize,
}

pub(crate) struct OffscreenSwapChain {
    target: OffscreenTarget,
    format: Format,
    extent: (u32, u32),
    images: Mutex<OffscreenImages>,
}

impl OffscreenSwapChain {
    pub(crate) fn new(
        backend: &dyn DeviceBackend,
        target: OffscreenTarget,
        desc: &SwapChainDesc,
    ) -> RhiResult<Self> {
        if target.is_lost() {
            return Err(RhiError::SurfaceLost);
        }
        let caps = backend.capabilities();
        let usage = Self::usage();
        let format = [Format::R8G8B8A8Unorm, Format::B8G8R8A8Unorm]
            .into_iter()
            .find(|f| caps.supports_format(*f, usage))
            .ok_or_else(|| {
                RhiError::unsupported(
                    ResourceKind::SwapChain,
                    "no 8-bit RGBA format can be rendered and copied on this backend",
                )
            })?;

        let count = image_count(desc.image_count);
        let images = (0..count)
            .map(|i| {
                let texture = TextureDesc::new_2d(desc.width, desc.height, format, usage)
                    .with_label(format!("offscreen image {i}"));
                backend.create_texture(&texture)
            })
            .collect::<RhiResult<Vec<_>>>()?;

        log::debug!(
            "Offscreen swap chain: {} images of {}x{} {:?}",
            count,
            desc.width,
            desc.height,
            format
        );
        Ok(Self {
            target,
            format,
            extent: (desc.width, desc.height),
            images: Mutex::new(OffscreenImages {
                pending: Some(images),
                in_use: vec![false; count as usize],
                next: 0,
            }),
        })
    }

    fn usage() -> TextureUsage {
        TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC | TextureUsage::SAMPLED
    }
}

fn image_count(requested: u32) -> u32 {
    match requested {
        0 => DEFAULT_IMAGE_COUNT,
        n => n.clamp(IMAGE_COUNT_RANGE.0, IMAGE_COUNT_RANGE.1),
    }
}

impl SwapChainBackend for OffscreenSwapChain {
    fn format(&self) -> Format {
        self.format
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn image_usage(&self) -> TextureUsage {
        Self::usage()
    }

    fn max_acquired(&self) -> u32 {
        self.images.lock().in_use.len() as u32
    }

    fn take_images(&self) -> RhiResult<Vec<Box<dyn TextureBackend>>> {
        self.images
            .lock()
            .pending
            .take()
            .ok_or_else(|| RhiError::InvalidUsage("swap chain images were already taken".into()))
    }

    fn acquire(&self, _timeout: Duration, _signal: &dyn SemaphoreBackend) -> RhiResult<(u32, bool)> {
        if self.target.is_lost() {
            return Err(RhiError::SurfaceLost);
        }
        let mut images = self.images.lock();
        let count = images.in_use.len();
        let index = (0..count)
            .map(|i| (images.next + i) % count)
            .find(|&i| !images.in_use[i])
            .ok_or(RhiError::Timeout)?;
        images.in_use[index] = true;
        images.next = (index + 1) % count;
        Ok((index as u32, self.target.size() != self.extent))
    }

    fn present(&self, index: u32, _wait: &[&dyn SemaphoreBackend]) -> RhiResult<bool> {
        let mut images = self.images.lock();
        if let Some(slot) = images.in_use.get_mut(index as usize) {
            *slot = false;
        }
        if self.target.is_lost() {
            return Err(RhiError::SurfaceLost);
        }
        Ok(self.target.size() != self.extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_count_is_clamped() {
        assert_eq!(image_count(0), 3);
        assert_eq!(image_count(1), 2);
        assert_eq!(image_count(4), 4);
        assert_eq!(image_count(20), 8);
    }
}
