//! Platform hooks and the critical-section wrappers built on them.
//!
//! Cross-core state is reached only through [`CoherentRegion`], which takes
//! the inter-core mutex and brackets the access with cache maintenance for the
//! whole region. Interrupt-shared state is reached through [`IrqCell`], which
//! masks interrupts on the owning core instead.

use spin::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Memory a cache maintenance operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRegion {
    /// The read-write shared half of a core.
    CoreRw { core: u32 },
    /// A byte range of shared memory.
    Range { addr: u32, len: u32 },
}

/// Hardware hooks. Everything defaults to a no-op except core wake-up.
pub trait Platform: Send + Sync {
    /// Write back cached data so other observers see it.
    fn flush(&self, _region: CacheRegion) {}

    /// Drop cached data so the next read observes other writers.
    fn invalidate(&self, _region: CacheRegion) {}

    /// Raise an inter-processor interrupt on `core`.
    fn ipi_assert(&self, core: u32);

    /// Idle `core` until an interrupt arrives.
    fn ipi_wait(&self, core: u32);

    /// Signal the host that the response ring changed.
    fn notify_host(&self) {}

    fn irq_disable(&self, _core: u32) {}

    fn irq_enable(&self, _core: u32) {}
}

/// Recorded hook invocation, see [`HostPlatform::with_trace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    Flush(CacheRegion),
    Invalidate(CacheRegion),
    IpiAssert(u32),
    NotifyHost,
    IrqDisable(u32),
    IrqEnable(u32),
}

/// Snapshot of hook call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStats {
    pub flushes: u64,
    pub invalidates: u64,
    pub ipis: u64,
    pub notifies: u64,
    pub irq_masks: u64,
}

/// Hosted platform: cores are threads, caches are coherent, interrupts are
/// flags.
#[derive(Debug)]
pub struct HostPlatform {
    pending: Vec<AtomicBool>,
    flushes: AtomicU64,
    invalidates: AtomicU64,
    ipis: AtomicU64,
    notifies: AtomicU64,
    irq_masks: AtomicU64,
    trace: Mutex<Option<Vec<PlatformEvent>>>,
}

/// Spins `ipi_wait` gives a core before returning without a wake-up.
const IPI_WAIT_SPINS: u32 = 1024;

impl HostPlatform {
    pub fn new(cores: u32) -> Self {
        Self {
            pending: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            flushes: AtomicU64::new(0),
            invalidates: AtomicU64::new(0),
            ipis: AtomicU64::new(0),
            notifies: AtomicU64::new(0),
            irq_masks: AtomicU64::new(0),
            trace: Mutex::new(None),
        }
    }

    /// Same as [`HostPlatform::new`] but records every hook call.
    pub fn with_trace(cores: u32) -> Self {
        let platform = Self::new(cores);
        *platform.trace.lock() = Some(Vec::new());
        platform
    }

    pub fn stats(&self) -> PlatformStats {
        PlatformStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            invalidates: self.invalidates.load(Ordering::Relaxed),
            ipis: self.ipis.load(Ordering::Relaxed),
            notifies: self.notifies.load(Ordering::Relaxed),
            irq_masks: self.irq_masks.load(Ordering::Relaxed),
        }
    }

    /// Recorded events, oldest first. Empty unless tracing.
    pub fn events(&self) -> Vec<PlatformEvent> {
        self.trace.lock().clone().unwrap_or_default()
    }

    pub fn clear_events(&self) {
        if let Some(trace) = self.trace.lock().as_mut() {
            trace.clear();
        }
    }

    /// Whether a wake-up is pending for `core`.
    pub fn ipi_pending(&self, core: u32) -> bool {
        self.pending
            .get(core as usize)
            .map_or(false, |p| p.load(Ordering::Acquire))
    }

    fn record(&self, event: PlatformEvent) {
        if let Some(trace) = self.trace.lock().as_mut() {
            trace.push(event);
        }
    }
}

impl Platform for HostPlatform {
    fn flush(&self, region: CacheRegion) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.record(PlatformEvent::Flush(region));
    }

    fn invalidate(&self, region: CacheRegion) {
        self.invalidates.fetch_add(1, Ordering::Relaxed);
        self.record(PlatformEvent::Invalidate(region));
    }

    fn ipi_assert(&self, core: u32) {
        self.ipis.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = self.pending.get(core as usize) {
            p.store(true, Ordering::Release);
        }
        self.record(PlatformEvent::IpiAssert(core));
    }

    fn ipi_wait(&self, core: u32) {
        let Some(p) = self.pending.get(core as usize) else {
            return;
        };
        for _ in 0..IPI_WAIT_SPINS {
            if p.swap(false, Ordering::AcqRel) {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn notify_host(&self) {
        self.notifies.fetch_add(1, Ordering::Relaxed);
        self.record(PlatformEvent::NotifyHost);
    }

    fn irq_disable(&self, core: u32) {
        self.irq_masks.fetch_add(1, Ordering::Relaxed);
        self.record(PlatformEvent::IrqDisable(core));
    }

    fn irq_enable(&self, core: u32) {
        self.record(PlatformEvent::IrqEnable(core));
    }
}

/// State shared between cores, kept coherent by explicit cache maintenance.
#[derive(Debug)]
pub struct CoherentRegion<T> {
    core: u32,
    inner: Mutex<T>,
}

impl<T> CoherentRegion<T> {
    pub fn new(core: u32, value: T) -> Self {
        Self {
            core,
            inner: Mutex::new(value),
        }
    }

    /// Lock the region and invalidate it. The returned guard flushes the
    /// region and then unlocks when dropped.
    pub fn enter<'a>(&'a self, platform: &'a dyn Platform) -> RegionGuard<'a, T> {
        let guard = self.inner.lock();
        let region = CacheRegion::CoreRw { core: self.core };
        platform.invalidate(region);
        RegionGuard {
            guard,
            platform,
            region,
        }
    }
}

/// Access to a [`CoherentRegion`]'s contents.
pub struct RegionGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    platform: &'a dyn Platform,
    region: CacheRegion,
}

impl<T> Deref for RegionGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RegionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RegionGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before the mutex guard field is dropped.
        self.platform.flush(self.region);
    }
}

/// State shared with interrupt handlers of one core.
#[derive(Debug)]
pub struct IrqCell<T> {
    core: u32,
    inner: Mutex<T>,
}

impl<T> IrqCell<T> {
    pub fn new(core: u32, value: T) -> Self {
        Self {
            core,
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with interrupts masked on the owning core.
    pub fn with<R>(&self, platform: &dyn Platform, f: impl FnOnce(&mut T) -> R) -> R {
        platform.irq_disable(self.core);
        let result = {
            let mut guard = self.inner.lock();
            f(&mut guard)
        };
        platform.irq_enable(self.core);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coherent_region_brackets_access() {
        let platform = HostPlatform::with_trace(2);
        let region = CoherentRegion::new(1, 5u32);
        {
            let mut guard = region.enter(&platform);
            *guard += 1;
        }
        assert_eq!(
            platform.events(),
            vec![
                PlatformEvent::Invalidate(CacheRegion::CoreRw { core: 1 }),
                PlatformEvent::Flush(CacheRegion::CoreRw { core: 1 }),
            ]
        );
        assert_eq!(*region.enter(&platform), 6);
    }

    #[test]
    fn irq_cell_masks_around_closure() {
        let platform = HostPlatform::with_trace(1);
        let cell = IrqCell::new(0, Vec::<u32>::new());
        let len = cell.with(&platform, |v| {
            v.push(3);
            v.len()
        });
        assert_eq!(len, 1);
        assert_eq!(
            platform.events(),
            vec![PlatformEvent::IrqDisable(0), PlatformEvent::IrqEnable(0)]
        );
    }

    #[test]
    fn ipi_wait_consumes_pending_flag() {
        let platform = HostPlatform::new(2);
        platform.ipi_assert(1);
        assert!(platform.ipi_pending(1));
        assert!(!platform.ipi_pending(0));
        platform.ipi_wait(1);
        assert!(!platform.ipi_pending(1));
        assert_eq!(platform.stats().ipis, 1);
    }
}
