// Swap chain
//
// Ring of presentable images plus the pacing state around them:
// - at most `max_acquired` images held by the application at once
// - at most `frames_in_flight` presented frames whose work is still running
// - one acquire semaphore per outstanding acquire, one render semaphore per image
//
// A chain becomes stale on surface loss or a resize notification. Stale
// chains refuse every acquire and present until the device recreates them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::device::DeviceShared;
use super::error::{ResourceKind, RhiError, RhiResult};
use super::hal::{SemaphoreBackend, SurfaceBackend, SwapChainBackend};
use super::offscreen::OffscreenSwapChain;
use super::resource::{ResourceCommon, Texture};
use super::surface::{OffscreenTarget, SurfaceTarget};
use super::sync::{self, Semaphore};
use super::types::*;

/// Where presented images go; kept across recreation
#[derive(Clone)]
enum PresentSurface {
    Native(Arc<dyn SurfaceBackend>),
    Offscreen(OffscreenTarget),
}

/// An image handed to the application by `acquire_next_image`
#[derive(Debug, Clone)]
pub struct AcquiredImage {
    pub index: u32,
    pub texture: Texture,
    /// Signalled when the image may be written; wait on it in the first submission
    pub image_available: Semaphore,
    /// Per-image semaphore to signal from the last submission and pass to `present`
    pub render_finished: Semaphore,
    /// The surface no longer matches the chain exactly; recreate when convenient
    pub suboptimal: bool,
}

struct ChainState {
    stale: bool,
    acquire_pool: Vec<Semaphore>,
    image_acquire: Vec<Option<Semaphore>>,
    held: Vec<bool>,
    held_count: u32,
    frame: u64,
    /// Last submission issued before the present that used each frame slot
    slot_retire: Vec<SubmissionIndex>,
}

struct SwapChainInner {
    device: Arc<DeviceShared>,
    surface: PresentSurface,
    desc: SwapChainDesc,
    raw: Box<dyn SwapChainBackend>,
    images: Vec<Texture>,
    render_finished: Vec<Semaphore>,
    state: Mutex<ChainState>,
    released: Condvar,
}

#[derive(Clone)]
pub struct SwapChain {
    inner: Arc<SwapChainInner>,
}

impl SwapChain {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        target: &SurfaceTarget,
        desc: &SwapChainDesc,
    ) -> RhiResult<Self> {
        let surface = match target {
            SurfaceTarget::Window(window) => {
                PresentSurface::Native(device.observe(device.backend.create_surface(window))?)
            }
            SurfaceTarget::Offscreen(target) => PresentSurface::Offscreen(target.clone()),
        };
        Self::build(device, surface, desc, None)
    }

    fn build(
        device: &Arc<DeviceShared>,
        surface: PresentSurface,
        desc: &SwapChainDesc,
        old: Option<&dyn SwapChainBackend>,
    ) -> RhiResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::invalid_desc(
                ResourceKind::SwapChain,
                "extent must be non-zero",
            ));
        }
        if desc.frames_in_flight == 0 {
            return Err(RhiError::invalid_desc(
                ResourceKind::SwapChain,
                "frames_in_flight must be at least 1",
            ));
        }

        let raw: Box<dyn SwapChainBackend> = match &surface {
            PresentSurface::Native(native) => {
                device.observe(device.backend.create_swap_chain(native, desc, old))?
            }
            PresentSurface::Offscreen(target) => Box::new(OffscreenSwapChain::new(
                &*device.backend,
                target.clone(),
                desc,
            )?),
        };

        let (width, height) = raw.extent();
        let format = raw.format();
        let usage = raw.image_usage();
        let images: Vec<Texture> = raw
            .take_images()?
            .into_iter()
            .enumerate()
            .map(|(i, image)| {
                let desc = TextureDesc::new_2d(width, height, format, usage)
                    .with_label(format!("swap chain image {i}"));
                Texture::new_swap_image(ResourceCommon::untracked(device), desc, image, i as u32)
            })
            .collect();
        if images.is_empty() {
            return Err(RhiError::invalid_desc(
                ResourceKind::SwapChain,
                "backend returned no presentable images",
            ));
        }

        let semaphore = || -> RhiResult<Semaphore> {
            let raw = device.observe(device.backend.create_semaphore())?;
            Ok(Semaphore::new(ResourceCommon::untracked(device), raw))
        };
        let render_finished = (0..images.len())
            .map(|_| semaphore())
            .collect::<RhiResult<Vec<_>>>()?;
        let acquire_pool = (0..=images.len())
            .map(|_| semaphore())
            .collect::<RhiResult<Vec<_>>>()?;

        log::info!(
            "Swap chain created: {}x{}, {:?}, {} images ({} acquirable), {} frames in flight",
            width,
            height,
            format,
            images.len(),
            raw.max_acquired(),
            desc.frames_in_flight
        );

        let image_count = images.len();
        Ok(Self {
            inner: Arc::new(SwapChainInner {
                device: Arc::clone(device),
                surface,
                desc: SwapChainDesc {
                    width,
                    height,
                    ..desc.clone()
                },
                raw,
                images,
                render_finished,
                state: Mutex::new(ChainState {
                    stale: false,
                    acquire_pool,
                    image_acquire: vec![None; image_count],
                    held: vec![false; image_count],
                    held_count: 0,
                    frame: 0,
                    slot_retire: vec![SubmissionIndex::NONE; desc.frames_in_flight as usize],
                }),
                released: Condvar::new(),
            }),
        })
    }

    /// Build the replacement chain on the same surface
    pub(crate) fn recreate(&self, width: u32, height: u32) -> RhiResult<Self> {
        let desc = SwapChainDesc {
            width,
            height,
            ..self.inner.desc.clone()
        };
        Self::build(
            &self.inner.device,
            self.inner.surface.clone(),
            &desc,
            Some(&*self.inner.raw),
        )
    }

    /// Mark the chain unusable and invalidate its images for submission
    pub(crate) fn retire(&self) {
        let mut state = self.inner.state.lock();
        state.stale = true;
        for image in &self.inner.images {
            image.retire();
        }
        self.inner.released.notify_all();
    }

    pub fn desc(&self) -> &SwapChainDesc {
        &self.inner.desc
    }

    pub fn format(&self) -> Format {
        self.inner.raw.format()
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.inner.desc.width, self.inner.desc.height)
    }

    pub fn image_count(&self) -> usize {
        self.inner.images.len()
    }

    pub fn images(&self) -> &[Texture] {
        &self.inner.images
    }

    pub fn max_acquired(&self) -> u32 {
        self.inner.raw.max_acquired()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.state.lock().stale
    }

    /// The window changed size. Every later acquire/present fails with
    /// `StaleSwapChain` until the device recreates the chain.
    pub fn notify_resized(&self) {
        let mut state = self.inner.state.lock();
        if !state.stale {
            log::debug!("Swap chain marked stale after resize");
        }
        state.stale = true;
        self.inner.released.notify_all();
    }

    // -------------------------------------------------------------------------
    // Acquire
    // -------------------------------------------------------------------------

    /// Wait up to `timeout` for a presentable image.
    ///
    /// Fails with `Timeout` when every acquirable image is held or the frame
    /// slot is still busy, and with `SurfaceLost` when the surface went away
    /// (the chain is stale afterwards).
    pub fn acquire_next_image(&self, timeout: Duration) -> RhiResult<AcquiredImage> {
        let device = &self.inner.device;
        device.check()?;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        if state.stale {
            return Err(RhiError::StaleSwapChain);
        }

        let max_acquired = self.max_acquired().min(self.inner.images.len() as u32);
        while state.held_count >= max_acquired {
            let timed_out = match deadline {
                Some(deadline) => self.inner.released.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.inner.released.wait(&mut state);
                    false
                }
            };
            if state.stale {
                return Err(RhiError::StaleSwapChain);
            }
            if timed_out && state.held_count >= max_acquired {
                return Err(RhiError::Timeout);
            }
        }

        self.wait_for_frame_slot(&mut state, deadline)?;
        if state.stale {
            return Err(RhiError::StaleSwapChain);
        }

        let semaphore = state.acquire_pool.pop().ok_or_else(|| {
            RhiError::Submission("no free acquire semaphore; present held images first".into())
        })?;
        if semaphore.is_pending() {
            state.acquire_pool.push(semaphore);
            return Err(RhiError::Submission(
                "acquire semaphore still has an unconsumed signal".into(),
            ));
        }

        let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
        let (index, suboptimal) = match self.inner.raw.acquire(remaining, semaphore.raw()) {
            Ok(acquired) => acquired,
            Err(err) => {
                state.acquire_pool.push(semaphore);
                return Err(match err {
                    RhiError::SurfaceLost => {
                        log::warn!("Surface lost during acquire; swap chain must be recreated");
                        state.stale = true;
                        RhiError::SurfaceLost
                    }
                    RhiError::Timeout => RhiError::Timeout,
                    other => {
                        let _ = device.observe(Err::<(), _>(other.clone()));
                        other
                    }
                });
            }
        };

        let slot = index as usize;
        if slot >= self.inner.images.len() || state.held[slot] {
            state.acquire_pool.push(semaphore);
            return Err(RhiError::Submission(format!(
                "backend returned image {index}, which is not available"
            )));
        }

        match &self.inner.surface {
            PresentSurface::Native(_) => semaphore.set_pending(true),
            PresentSurface::Offscreen(_) => {
                // Nothing native signals it; queue an empty submission that does
                device.submit_commands(QueueType::Graphics, Arc::new(Vec::new()), &[], &[&semaphore])?;
            }
        }

        state.held[slot] = true;
        state.held_count += 1;
        state.image_acquire[slot] = Some(semaphore.clone());

        if suboptimal {
            log::debug!("Acquired image {index} from a suboptimal swap chain");
        }
        Ok(AcquiredImage {
            index,
            texture: self.inner.images[slot].clone(),
            image_available: semaphore,
            render_finished: self.inner.render_finished[slot].clone(),
            suboptimal,
        })
    }

    fn wait_for_frame_slot(
        &self,
        state: &mut MutexGuard<'_, ChainState>,
        deadline: Option<Instant>,
    ) -> RhiResult<()> {
        let device = &self.inner.device;
        let slot = (state.frame % state.slot_retire.len() as u64) as usize;
        let retire = state.slot_retire[slot];
        if retire <= device.completed_index() {
            return Ok(());
        }
        let remaining = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
        let done = MutexGuard::unlocked(state, || device.wait(retire, remaining))?;
        if done {
            Ok(())
        } else {
            Err(RhiError::Timeout)
        }
    }

    // -------------------------------------------------------------------------
    // Present
    // -------------------------------------------------------------------------

    /// Queue image `index` for display once every `wait` semaphore fires.
    /// Returns whether the surface reported the chain as suboptimal.
    pub fn present(&self, index: u32, wait: &[&Semaphore]) -> RhiResult<bool> {
        let device = &self.inner.device;
        device.check()?;
        let mut state = self.inner.state.lock();
        if state.stale {
            return Err(RhiError::StaleSwapChain);
        }
        let slot = index as usize;
        if slot >= self.inner.images.len() || !state.held[slot] {
            return Err(RhiError::InvalidUsage(format!(
                "image {index} was not acquired from this swap chain"
            )));
        }
        if state.image_acquire[slot]
            .as_ref()
            .is_some_and(Semaphore::is_pending)
        {
            return Err(RhiError::Submission(format!(
                "image {index} is presented before any submission waited on its image_available semaphore"
            )));
        }
        sync::check_semaphores(device.id, wait, &[])?;

        let image = &self.inner.images[slot];
        if wait.is_empty() && image.last_write() > device.completed_index() {
            let msg = format!(
                "image {index} presented without wait semaphores while submission {} still writes it",
                image.last_write().0
            );
            if device.validation {
                return Err(RhiError::Validation(msg));
            }
            log::warn!("{msg}");
        }

        let result = match &self.inner.surface {
            PresentSurface::Native(_) => {
                let raw_wait: Vec<&dyn SemaphoreBackend> = wait.iter().map(|s| s.raw()).collect();
                let result = self.inner.raw.present(index, &raw_wait);
                if matches!(result, Ok(_) | Err(RhiError::SurfaceLost)) {
                    sync::commit_semaphores(wait, &[]);
                }
                result
            }
            PresentSurface::Offscreen(_) => {
                if !wait.is_empty() {
                    device.submit_commands(QueueType::Graphics, Arc::new(Vec::new()), wait, &[])?;
                }
                self.inner.raw.present(index, &[])
            }
        };

        match result {
            Ok(suboptimal) => {
                self.release_image(&mut state, slot);
                Ok(suboptimal)
            }
            Err(RhiError::SurfaceLost) => {
                log::warn!("Surface lost during present; swap chain must be recreated");
                self.release_image(&mut state, slot);
                state.stale = true;
                Err(RhiError::SurfaceLost)
            }
            Err(other) => device.observe(Err(other)),
        }
    }

    fn release_image(&self, state: &mut ChainState, slot: usize) {
        state.held[slot] = false;
        state.held_count -= 1;
        if let Some(semaphore) = state.image_acquire[slot].take() {
            state.acquire_pool.push(semaphore);
        }
        let frame_slot = (state.frame % state.slot_retire.len() as u64) as usize;
        state.slot_retire[frame_slot] = self.inner.device.last_submitted();
        state.frame += 1;
        self.inner.released.notify_all();
    }
}

impl std::fmt::Debug for SwapChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapChain")
            .field("extent", &self.extent())
            .field("format", &self.format())
            .field("images", &self.image_count())
            .finish()
    }
}
