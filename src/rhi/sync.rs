// Synchronization primitives
//
// GPU-GPU ordering between submissions, swap chain acquire and present.
// Binary semantics: every signal must be consumed by exactly one wait before
// the semaphore can be signalled again. The frontend tracks the pending
// state so misuse is caught the same way on every backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::{RhiError, RhiResult};
use super::hal::SemaphoreBackend;
use super::resource::ResourceCommon;
use super::types::DeviceId;

#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    common: ResourceCommon,
    raw: Box<dyn SemaphoreBackend>,
    pending: AtomicBool,
}

impl Semaphore {
    pub(crate) fn new(common: ResourceCommon, raw: Box<dyn SemaphoreBackend>) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                common,
                raw,
                pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &(dyn SemaphoreBackend + 'static) {
        &*self.inner.raw
    }

    /// A signal has been queued that no wait has consumed yet
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Semaphore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn ensure_can_signal(&self) -> RhiResult<()> {
        if self.is_pending() {
            return Err(RhiError::Submission(
                "semaphore signalled again before its previous signal was waited on".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn ensure_can_wait(&self) -> RhiResult<()> {
        if !self.is_pending() {
            return Err(RhiError::Submission(
                "waiting on a semaphore that has no pending signal".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn set_pending(&self, pending: bool) {
        self.inner.pending.store(pending, Ordering::Release);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Validate a wait/signal set before anything is queued
pub(crate) fn check_semaphores(
    device: DeviceId,
    wait: &[&Semaphore],
    signal: &[&Semaphore],
) -> RhiResult<()> {
    for sem in wait.iter().chain(signal.iter()) {
        if sem.device_id() != device {
            return Err(RhiError::Submission(
                "semaphore belongs to a different device".into(),
            ));
        }
    }
    for sem in wait {
        sem.ensure_can_wait()?;
    }
    for (i, sem) in signal.iter().enumerate() {
        sem.ensure_can_signal()?;
        if signal[..i].iter().any(|other| other.ptr_eq(sem)) {
            return Err(RhiError::Submission(
                "the same semaphore is signalled twice in one submission".into(),
            ));
        }
        if wait.iter().any(|w| w.ptr_eq(sem)) {
            return Err(RhiError::Submission(
                "a submission may not wait on and signal the same semaphore".into(),
            ));
        }
    }
    Ok(())
}

/// Commit the state change of a successful submission
pub(crate) fn commit_semaphores(wait: &[&Semaphore], signal: &[&Semaphore]) {
    for sem in wait {
        sem.set_pending(false);
    }
    for sem in signal {
        sem.set_pending(true);
    }
}
