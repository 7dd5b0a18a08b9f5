//! DSP context: configuration, memory layout and the cores.

use crate::component::ComponentFactory;
use crate::core::Core;
use crate::error::{Error, Result};
use crate::isr::IsrHandle;
use crate::memory::SharedMemory;
use crate::mm::{mm_round, MM_BLOCK_SIZE};
use crate::msg::{MsgQueue, MAX_CLIENTS, MAX_CORES, MSG_SLOT_SIZE};
use crate::proxy::{HostChannel, PROXY_REGION_SIZE};
use crate::sync::{CoherentRegion, IrqCell, Platform};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes reserved next to the rings for host-written command payloads.
pub const HOST_STAGING_SIZE: u32 = 256;

/// Service passes [`Dsp::run_until_idle`] makes before giving up.
const MAX_IDLE_ROUNDS: usize = 100_000;

/// Sizing of a DSP cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DspConfig {
    pub cores: u32,
    /// Per-core pool visible to other cores and the host.
    pub shared_pool_size: u32,
    /// Per-core private pool; also holds the scratch area and proxy messages.
    pub local_pool_size: u32,
    pub scratch_size: u32,
    /// Messages available for host commands on each core.
    pub proxy_pool_size: u32,
    pub max_clients: u32,
    /// Reserved capacity of every dispatch and ISR queue.
    pub queue_depth: u32,
    /// Core bridging the host rings; `None` runs without a host.
    pub shmem_core: Option<u32>,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            cores: 1,
            shared_pool_size: 64 * 1024,
            local_pool_size: 16 * 1024,
            scratch_size: 1024,
            proxy_pool_size: 16,
            max_clients: 16,
            queue_depth: 64,
            shmem_core: Some(0),
        }
    }
}

impl DspConfig {
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_shared_pool(mut self, size: u32) -> Self {
        self.shared_pool_size = size;
        self
    }

    pub fn with_local_pool(mut self, size: u32) -> Self {
        self.local_pool_size = size;
        self
    }

    pub fn with_scratch(mut self, size: u32) -> Self {
        self.scratch_size = size;
        self
    }

    pub fn with_proxy_pool(mut self, messages: u32) -> Self {
        self.proxy_pool_size = messages;
        self
    }

    pub fn with_max_clients(mut self, clients: u32) -> Self {
        self.max_clients = clients;
        self
    }

    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_shmem_core(mut self, core: Option<u32>) -> Self {
        self.shmem_core = core;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 || self.cores > MAX_CORES {
            return Err(Error::Config("core count must be 1..=4"));
        }
        for size in [self.shared_pool_size, self.local_pool_size] {
            if size == 0 || size % MM_BLOCK_SIZE != 0 {
                return Err(Error::Config("pool sizes must be non-zero multiples of 32"));
            }
        }
        if self.proxy_pool_size == 0 {
            return Err(Error::Config("proxy pool needs at least one message"));
        }
        let reserved = u64::from(mm_round(self.scratch_size.max(1)))
            + u64::from(self.proxy_pool_size) * u64::from(MSG_SLOT_SIZE);
        if reserved >= u64::from(self.local_pool_size) {
            return Err(Error::Config("local pool too small for scratch and proxy messages"));
        }
        if self.max_clients < 2 || self.max_clients > MAX_CLIENTS {
            return Err(Error::Config("max_clients must be 2..=64"));
        }
        if self.queue_depth == 0 {
            return Err(Error::Config("queue depth must be non-zero"));
        }
        if let Some(core) = self.shmem_core {
            if core >= self.cores {
                return Err(Error::Config("shared-memory core out of range"));
            }
        }
        let per_core = u64::from(self.shared_pool_size) + u64::from(self.local_pool_size);
        let total = u64::from(PROXY_REGION_SIZE + HOST_STAGING_SIZE) + per_core * u64::from(self.cores);
        if total > u64::from(u32::MAX) {
            return Err(Error::Config("memory layout exceeds the 32-bit address space"));
        }
        Ok(())
    }
}

/// Address ranges of one core's pools, as `(base, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreLayout {
    pub shared: (u32, u32),
    pub local: (u32, u32),
}

/// Placement of everything in [`SharedMemory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Base of the proxy rings.
    pub proxy: Option<u32>,
    /// Host staging area, `(base, size)`.
    pub host: Option<(u32, u32)>,
    pub cores: Vec<CoreLayout>,
    pub total: u32,
}

impl MemoryLayout {
    /// Rings first, then the staging area, then each core's pools.
    pub fn new(config: &DspConfig) -> Self {
        let mut cursor = 0;
        let (proxy, host) = if config.shmem_core.is_some() {
            let proxy = cursor;
            cursor += PROXY_REGION_SIZE;
            let host = (cursor, HOST_STAGING_SIZE);
            cursor += HOST_STAGING_SIZE;
            (Some(proxy), Some(host))
        } else {
            (None, None)
        };
        let cores = (0..config.cores)
            .map(|_| {
                let shared = (cursor, config.shared_pool_size);
                cursor += config.shared_pool_size;
                let local = (cursor, config.local_pool_size);
                cursor += config.local_pool_size;
                CoreLayout { shared, local }
            })
            .collect();
        Self {
            proxy,
            host,
            cores,
            total: cursor,
        }
    }
}

/// Read-write shared half of a core: its cross-core inbound queues.
#[derive(Debug, Default)]
pub struct CoreRw {
    /// Commands from other cores.
    pub local: MsgQueue,
    /// Responses from other cores.
    pub remote: MsgQueue,
}

/// Queues filled from interrupt context.
#[derive(Debug, Default)]
pub struct IsrQueues {
    pub schedule: MsgQueue,
    pub complete: MsgQueue,
}

/// Per-core state other cores may touch.
#[derive(Debug)]
pub struct SharedCore {
    pub rw: CoherentRegion<CoreRw>,
    pub isr: IrqCell<IsrQueues>,
    /// Registered client mask.
    pub clients: AtomicU64,
}

/// State shared by every core and the host.
pub struct DspShared {
    pub cores: Vec<SharedCore>,
    pub memory: SharedMemory,
    pub platform: Arc<dyn Platform>,
    pub layout: MemoryLayout,
}

impl DspShared {
    pub fn is_registered(&self, core: u32, client: u32) -> bool {
        self.registered(core) & (1u64 << client) != 0
    }

    /// Registered client mask of `core`.
    pub fn registered(&self, core: u32) -> u64 {
        self.cores
            .get(core as usize)
            .map_or(0, |c| c.clients.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for DspShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DspShared")
            .field("cores", &self.cores.len())
            .field("memory", &self.memory.len())
            .field("layout", &self.layout)
            .finish()
    }
}

/// A cluster of cores with their shared memory.
#[derive(Debug)]
pub struct Dsp {
    config: DspConfig,
    shared: Arc<DspShared>,
    cores: Vec<Core>,
}

impl Dsp {
    pub fn new(
        config: DspConfig,
        platform: Arc<dyn Platform>,
        factory: Arc<dyn ComponentFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = MemoryLayout::new(&config);
        let depth = config.queue_depth as usize;
        let cores = (0..config.cores)
            .map(|id| SharedCore {
                rw: CoherentRegion::new(
                    id,
                    CoreRw {
                        local: MsgQueue::with_capacity(depth),
                        remote: MsgQueue::with_capacity(depth),
                    },
                ),
                isr: IrqCell::new(
                    id,
                    IsrQueues {
                        schedule: MsgQueue::with_capacity(depth),
                        complete: MsgQueue::with_capacity(depth),
                    },
                ),
                clients: AtomicU64::new(0),
            })
            .collect();
        let shared = Arc::new(DspShared {
            cores,
            memory: SharedMemory::new(layout.total),
            platform,
            layout: layout.clone(),
        });
        let cores = layout
            .cores
            .iter()
            .enumerate()
            .map(|(id, l)| Core::new(id as u32, &config, l, Arc::clone(&shared), Arc::clone(&factory)))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("dsp: {} cores, {} bytes of shared memory", config.cores, layout.total);
        Ok(Self {
            config,
            shared,
            cores,
        })
    }

    pub fn config(&self) -> &DspConfig {
        &self.config
    }

    pub fn core(&self, id: u32) -> &Core {
        &self.cores[id as usize]
    }

    pub fn core_mut(&mut self, id: u32) -> &mut Core {
        &mut self.cores[id as usize]
    }

    pub fn cores(&self) -> usize {
        self.cores.len()
    }

    /// Host end of the proxy rings, when a core bridges them.
    pub fn host(&self) -> Option<HostChannel> {
        let base = self.shared.layout.proxy?;
        let core = self.config.shmem_core?;
        Some(HostChannel::new(Arc::clone(&self.shared), base, core))
    }

    pub fn isr(&self, core: u32) -> IsrHandle {
        IsrHandle::new(core, Arc::clone(&self.shared))
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.shared.memory
    }

    pub fn shared(&self) -> &Arc<DspShared> {
        &self.shared
    }

    /// One service pass over every core. Returns whether any did work.
    pub fn service(&mut self) -> bool {
        let mut worked = false;
        for core in &mut self.cores {
            worked |= core.service();
        }
        worked
    }

    /// Service every core until none has work left. Returns the number of
    /// productive passes.
    pub fn run_until_idle(&mut self) -> usize {
        let mut rounds = 0;
        while rounds < MAX_IDLE_ROUNDS && self.service() {
            rounds += 1;
        }
        if rounds == MAX_IDLE_ROUNDS {
            log::warn!("dsp: still busy after {} passes", rounds);
        }
        rounds
    }

    /// Hand the cores out, e.g. to run each on its own thread.
    pub fn into_cores(self) -> Vec<Core> {
        self.cores
    }
}
