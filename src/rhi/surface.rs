// Presentation surfaces
//
// The only place platform window handles enter the RHI. A `SurfaceProvider`
// is consulted once, when a swap chain is built; nothing else in the crate
// knows about windows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use super::error::{ResourceKind, RhiError, RhiResult};

/// Native window plus its display connection
#[derive(Debug, Clone, Copy)]
pub struct WindowTarget {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub enum SurfaceTarget {
    Window(WindowTarget),
    /// Presentation into plain textures, for tools and tests
    Offscreen(OffscreenTarget),
}

impl SurfaceTarget {
    /// Capture the raw handles of a window.
    ///
    /// # Safety
    /// The window and its display must outlive every swap chain created from
    /// the returned target.
    pub unsafe fn from_window<W>(window: &W, width: u32, height: u32) -> RhiResult<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let window_handle = window
            .window_handle()
            .map_err(|e| RhiError::unsupported(ResourceKind::Surface, e.to_string()))?;
        let display_handle = window
            .display_handle()
            .map_err(|e| RhiError::unsupported(ResourceKind::Surface, e.to_string()))?;
        Ok(SurfaceTarget::Window(WindowTarget {
            window: window_handle.as_raw(),
            display: display_handle.as_raw(),
            width,
            height,
        }))
    }
}

/// Anything that can describe where a swap chain presents to
pub trait SurfaceProvider {
    fn surface_target(&self) -> RhiResult<SurfaceTarget>;
}

impl SurfaceProvider for SurfaceTarget {
    fn surface_target(&self) -> RhiResult<SurfaceTarget> {
        Ok(self.clone())
    }
}

// =============================================================================
// OFFSCREEN TARGET
// =============================================================================

#[derive(Debug)]
struct OffscreenState {
    size: Mutex<(u32, u32)>,
    lost: AtomicBool,
}

/// Stand-in for a platform window: it has a size, can be resized and can go
/// away. Clones share the same state.
#[derive(Debug, Clone)]
pub struct OffscreenTarget {
    state: Arc<OffscreenState>,
}

impl OffscreenTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(OffscreenState {
                size: Mutex::new((width, height)),
                lost: AtomicBool::new(false),
            }),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        *self.state.size.lock()
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.state.size.lock() = (width, height);
    }

    /// Simulate the surface disappearing (window closed, display reset)
    pub fn lose(&self) {
        self.state.lost.store(true, Ordering::Release);
    }

    pub fn restore(&self) {
        self.state.lost.store(false, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::Acquire)
    }
}

impl SurfaceProvider for OffscreenTarget {
    fn surface_target(&self) -> RhiResult<SurfaceTarget> {
        Ok(SurfaceTarget::Offscreen(self.clone()))
    }
}
