//! Per-core executive: message routing, component dispatch and the service
//! loop.

// Everything a core owns lives here; state other cores can touch lives in
// `DspShared` and is only reached through its region wrappers.

use crate::component::{ClientMap, ComponentFactory, Run};
use crate::dsp::{CoreLayout, DspConfig, DspShared};
use crate::error::{Error, Result};
use crate::invariant_ppt::{assert_invariant, CORE_PROXY_ATTACHED, CORE_ROUTE_VALID};
use crate::memory::SharedMemory;
use crate::mm::{mm_round, MemPool, MM_BLOCK_SIZE};
use crate::msg::{Message, MsgPool, MsgQueue, PortSpec, RESPONSE_FAILED};
use crate::proxy;
use crate::sched::Scheduler;
use crate::sync::Platform;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which per-core pool an allocation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    /// Private to the core.
    Local,
    /// Visible to other cores and the host.
    Shared,
}

/// One DSP core.
pub struct Core {
    id: u32,
    sched: Scheduler<u32>,
    queue: MsgQueue,
    pub(crate) proxy_response: MsgQueue,
    pub(crate) cmap: ClientMap,
    local_pool: MemPool,
    shared_pool: MemPool,
    pub(crate) proxy_pool: MsgPool,
    scratch: u32,
    scratch_size: u32,
    queue_depth: usize,
    shared: Arc<DspShared>,
    factory: Arc<dyn ComponentFactory>,
    shmem: bool,
}

impl Core {
    pub(crate) fn new(
        id: u32,
        config: &DspConfig,
        layout: &CoreLayout,
        shared: Arc<DspShared>,
        factory: Arc<dyn ComponentFactory>,
    ) -> Result<Self> {
        let mut local_pool = MemPool::new(layout.local.0, layout.local.1);
        let shared_pool = MemPool::new(layout.shared.0, layout.shared.1);
        let scratch_size = mm_round(config.scratch_size.max(1));
        let scratch = local_pool
            .alloc(scratch_size)
            .ok_or(Error::NoMemory { requested: scratch_size })?;
        let proxy_pool = MsgPool::init(config.proxy_pool_size, &mut local_pool)?;
        let depth = config.queue_depth as usize;
        log::debug!(
            "core {}: local {:#x}+{:#x}, shared {:#x}+{:#x}",
            id,
            layout.local.0,
            layout.local.1,
            layout.shared.0,
            layout.shared.1
        );
        Ok(Self {
            id,
            sched: Scheduler::new(),
            queue: MsgQueue::with_capacity(depth),
            proxy_response: MsgQueue::with_capacity(depth),
            cmap: ClientMap::new(config.max_clients),
            local_pool,
            shared_pool,
            proxy_pool,
            scratch,
            scratch_size,
            queue_depth: depth,
            shared,
            factory,
            shmem: config.shmem_core == Some(id),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Port spec of a client on this core.
    pub fn spec(&self, client: u32, port: u32) -> PortSpec {
        PortSpec::new(self.id, client, port)
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.shared.memory
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.shared.platform
    }

    pub fn shared(&self) -> &Arc<DspShared> {
        &self.shared
    }

    pub(crate) fn factory(&self) -> Arc<dyn ComponentFactory> {
        Arc::clone(&self.factory)
    }

    /// Whether this core bridges the host proxy rings.
    pub fn has_shmem(&self) -> bool {
        self.shmem
    }

    /// Default queue capacity for ports created on this core.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Scratch area address and size.
    pub fn scratch(&self) -> (u32, u32) {
        (self.scratch, self.scratch_size)
    }

    pub fn clients(&self) -> &ClientMap {
        &self.cmap
    }

    pub fn pool(&self, kind: MemKind) -> &MemPool {
        match kind {
            MemKind::Local => &self.local_pool,
            MemKind::Shared => &self.shared_pool,
        }
    }

    fn pool_mut(&mut self, kind: MemKind) -> &mut MemPool {
        match kind {
            MemKind::Local => &mut self.local_pool,
            MemKind::Shared => &mut self.shared_pool,
        }
    }

    // Memory

    /// Allocate `size` bytes, rounded up to the block size.
    pub fn mem_alloc(&mut self, size: u32, align: u32, kind: MemKind) -> Result<u32> {
        if size == 0 {
            return Err(Error::InvalidParam("zero-sized allocation"));
        }
        if !align.is_power_of_two() || align > MM_BLOCK_SIZE {
            return Err(Error::InvalidParam("allocation alignment"));
        }
        if size > u32::MAX - MM_BLOCK_SIZE {
            return Err(Error::NoMemory { requested: size });
        }
        self.pool_mut(kind)
            .alloc(mm_round(size))
            .ok_or(Error::NoMemory { requested: size })
    }

    pub fn mem_free(&mut self, addr: u32, size: u32, kind: MemKind) {
        self.pool_mut(kind).free(addr, mm_round(size));
    }

    /// Message pool with `n` messages whose slots come from `kind`.
    pub fn pool_init(&mut self, n: u32, kind: MemKind) -> Result<MsgPool> {
        MsgPool::init(n, self.pool_mut(kind))
    }

    pub fn pool_destroy(&mut self, pool: MsgPool, kind: MemKind) {
        pool.destroy(self.pool_mut(kind));
    }

    // Routing

    /// Send a message towards its destination.
    pub fn submit(&mut self, msg: Message) {
        let dst = msg.id.dst().core();
        if dst == self.id {
            log::trace!("core {}: local {:?} {:?}", self.id, msg.id, msg.opcode);
            self.queue.enqueue(msg);
        } else if (dst as usize) < self.shared.cores.len() {
            self.post_remote(dst, msg, false);
        } else {
            log::warn!("core {}: no core {} for {:?}", self.id, dst, msg.id);
            self.response_err(msg);
        }
    }

    /// Return a message to its originator.
    pub fn complete(&mut self, mut msg: Message) {
        msg.id = msg.id.swapped();
        let dst = msg.id.dst().core();
        if dst == self.id {
            self.queue.enqueue(msg);
        } else if (dst as usize) < self.shared.cores.len() {
            self.post_remote(dst, msg, true);
        } else {
            log::error!("core {}: dropping response {:?}, no such core", self.id, msg.id);
            if self.proxy_pool.owns(&msg) {
                self.proxy_pool.put(msg);
            }
        }
    }

    pub fn response(&mut self, msg: Message) {
        self.complete(msg);
    }

    /// Return a message to its originator flagged as failed.
    pub fn response_err(&mut self, mut msg: Message) {
        msg.length = RESPONSE_FAILED;
        self.complete(msg);
    }

    fn post_remote(&self, core: u32, msg: Message, response: bool) {
        let target = &self.shared.cores[core as usize];
        let platform = &*self.shared.platform;
        log::trace!("core {}: {:?} to core {}", self.id, msg.id, core);
        let was_empty = {
            let mut rw = target.rw.enter(platform);
            if response {
                rw.remote.enqueue(msg)
            } else {
                rw.local.enqueue(msg)
            }
        };
        if was_empty {
            platform.ipi_assert(core);
        }
    }

    /// Deliver a message addressed to this core.
    pub fn dispatch(&mut self, msg: Message) {
        let dst = msg.id.dst();
        assert_invariant(
            CORE_ROUTE_VALID,
            dst.core() == self.id,
            "message dispatched on the wrong core",
            Some("Core::dispatch"),
        );
        if dst.is_proxy() {
            assert_invariant(
                CORE_PROXY_ATTACHED,
                self.shmem,
                "proxy response on a core without shared memory",
                Some("Core::dispatch"),
            );
            self.proxy_response.enqueue(msg);
            return;
        }
        match dst.client() {
            0 => proxy::command(self, msg),
            client => self.execute(client, Some(msg)),
        }
    }

    fn execute(&mut self, client: u32, msg: Option<Message>) {
        let Some(mut component) = self.cmap.take(client) else {
            if let Some(msg) = msg {
                self.no_client(client, msg);
            }
            return;
        };
        match component.entry(self, msg) {
            Run::Continue => self.cmap.restore(client, component),
            Run::Terminate(msg) => match component.exit(self, msg) {
                Ok(()) => {
                    drop(component);
                    self.deregister(client);
                }
                Err(e) => {
                    log::warn!("core {}: client {} failed to exit: {}", self.id, client, e);
                    self.cmap.restore(client, component);
                }
            },
        }
    }

    fn no_client(&mut self, client: u32, msg: Message) {
        if msg.is_failure() {
            log::error!(
                "core {}: dropping failure response {:?} to missing client {}",
                self.id,
                msg.id,
                client
            );
            if self.proxy_pool.owns(&msg) {
                self.proxy_pool.put(msg);
            }
            return;
        }
        log::warn!(
            "core {}: {:?} rejected: {}",
            self.id,
            msg.opcode,
            Error::NoClient {
                core: self.id,
                client
            }
        );
        self.response_err(msg);
    }

    /// Record a freshly created client in the shared registration mask.
    pub(crate) fn register_client(&mut self, client: u32) {
        self.shared.cores[self.id as usize]
            .clients
            .fetch_or(1u64 << client, Ordering::AcqRel);
        log::debug!("core {}: client {} registered", self.id, client);
    }

    fn deregister(&mut self, client: u32) {
        if let Some(task) = self.cmap.release(client) {
            self.sched.cancel(task);
        }
        self.shared.cores[self.id as usize]
            .clients
            .fetch_and(!(1u64 << client), Ordering::AcqRel);
        log::debug!("core {}: client {} deregistered", self.id, client);
    }

    // Scheduling

    /// Run `client` `dts` ticks after the current core time. No-op when it
    /// is already scheduled.
    pub fn schedule(&mut self, client: u32, dts: u32) {
        if self.cmap.task(client).is_some() {
            return;
        }
        let ts = self.sched.timestamp().wrapping_add(dts);
        let task = self.sched.put(client, ts);
        self.cmap.set_task(client, Some(task));
    }

    pub fn cancel(&mut self, client: u32) {
        if let Some(task) = self.cmap.task(client) {
            self.sched.cancel(task);
            self.cmap.set_task(client, None);
        }
    }

    pub fn is_scheduled(&self, client: u32) -> bool {
        self.cmap.task(client).is_some()
    }

    /// Current core time.
    pub fn timestamp(&self) -> u32 {
        self.sched.timestamp()
    }

    fn run_task(&mut self) -> bool {
        let Some(client) = self.sched.get() else {
            return false;
        };
        self.cmap.set_task(client, None);
        self.execute(client, None);
        true
    }

    // Service loop

    fn drain_local(&mut self) -> bool {
        let n = self.queue.len();
        for _ in 0..n {
            match self.queue.dequeue() {
                Some(msg) => self.dispatch(msg),
                None => break,
            }
        }
        n > 0
    }

    fn drain_ipc(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let me = &shared.cores[self.id as usize];
        let platform = &*shared.platform;
        let mut progress = false;
        loop {
            let msg = me.isr.with(platform, |q| q.schedule.dequeue());
            match msg {
                Some(msg) => {
                    self.dispatch(msg);
                    progress = true;
                }
                None => break,
            }
        }
        loop {
            let msg = {
                let mut rw = me.rw.enter(platform);
                rw.local.dequeue().or_else(|| rw.remote.dequeue())
            };
            match msg {
                Some(msg) => {
                    self.dispatch(msg);
                    progress = true;
                }
                None => break,
            }
        }
        progress
    }

    fn drain_isr_responses(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let me = &shared.cores[self.id as usize];
        let mut progress = false;
        while let Some(msg) = me.isr.with(&*shared.platform, |q| q.complete.dequeue()) {
            self.complete(msg);
            progress = true;
        }
        progress
    }

    /// Process everything that is ready. Returns whether any work was done.
    pub fn service(&mut self) -> bool {
        let mut worked = false;
        loop {
            let mut progress = false;
            if self.shmem {
                progress |= proxy::process_queues(self);
            }
            progress |= self.drain_local();
            progress |= self.drain_ipc();
            progress |= self.drain_isr_responses();
            progress |= self.run_task();
            if !progress {
                break;
            }
            worked = true;
        }
        worked
    }

    /// Serve until `stop` is set, idling between interrupts.
    pub fn run(&mut self, stop: &AtomicBool) {
        log::debug!("core {}: running", self.id);
        while !stop.load(Ordering::Acquire) {
            if !self.service() {
                self.shared.platform.ipi_wait(self.id);
            }
        }
        log::debug!("core {}: stopped", self.id);
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("timestamp", &self.sched.timestamp())
            .field("scheduled", &self.sched.len())
            .field("queued", &self.queue.len())
            .field("clients", &self.cmap)
            .field("shmem", &self.shmem)
            .finish()
    }
}
