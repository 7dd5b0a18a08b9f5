//! Input and output ports.
//!
//! An input port queues incoming data messages and either exposes the head
//! message directly (bypass) or copies data into an internal buffer. An
//! output port owns a set of buffers routed to a sink and circulates them:
//! produced buffers travel downstream, consumed ones come back as responses.

use crate::core::{Core, MemKind};
use crate::error::{Error, Result};
use crate::invariant_ppt::{
    assert_invariant, PORT_BUFFER_ORIGIN, PORT_CONSUME_BOUNDS, PORT_FILL_BUFFERED,
    PORT_FLUSH_SINGLE, PORT_PRODUCE_READY, PORT_UNROUTE_IDLE,
};
use crate::mm::MM_BLOCK_SIZE;
use crate::msg::{Message, MsgPool, MsgQueue, Opcode, PortSpec, SessionId};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    /// Input port state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        const CREATED = 1 << 0;
        const ENABLED = 1 << 1;
        /// End-of-stream marker queued.
        const EOS = 1 << 2;
        /// End-of-stream marker consumed.
        const DONE = 1 << 3;
        const PURGING = 1 << 4;
    }
}

bitflags! {
    /// Output port state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputFlags: u32 {
        const CREATED = 1 << 0;
        const ROUTED = 1 << 1;
        const ENABLED = 1 << 2;
        /// Zero-length buffer produced.
        const DONE = 1 << 3;
        const FLUSHING = 1 << 4;
        /// Every buffer is home.
        const IDLE = 1 << 5;
        const UNROUTING = 1 << 6;
    }
}

/// Payload of a ROUTE command.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RouteRequest {
    /// Destination port, a raw [`PortSpec`].
    pub dst: u32,
    pub count: u32,
    pub length: u32,
    pub align: u32,
}

impl RouteRequest {
    pub fn new(dst: PortSpec, count: u32, length: u32, align: u32) -> Self {
        Self {
            dst: u32::from(dst.raw()),
            count,
            length,
            align,
        }
    }

    pub fn dst(&self) -> PortSpec {
        PortSpec::from_raw(self.dst as u16)
    }
}

/// Consumer endpoint.
#[derive(Debug)]
pub struct InputPort {
    queue: MsgQueue,
    buffer: u32,
    size: u32,
    filled: u32,
    access: u32,
    flags: InputFlags,
}

impl InputPort {
    /// Create a port with an internal buffer of `size` bytes; 0 selects
    /// bypass mode.
    pub fn new(core: &mut Core, size: u32, align: u32) -> Result<Self> {
        let buffer = if size > 0 {
            core.mem_alloc(size, align, MemKind::Local)?
        } else {
            0
        };
        Ok(Self {
            queue: MsgQueue::with_capacity(core.queue_depth()),
            buffer,
            size,
            filled: 0,
            access: 0,
            flags: InputFlags::CREATED | InputFlags::ENABLED,
        })
    }

    /// Queue an incoming message. Returns whether the queue went from empty
    /// to non-empty. Rejected messages are answered with an error.
    pub fn put(&mut self, core: &mut Core, msg: Message) -> bool {
        if !self.flags.contains(InputFlags::ENABLED) {
            log::warn!("input: {:?} rejected: {}", msg.id, Error::PortDisabled);
            core.response_err(msg);
            return false;
        }
        if self.flags.contains(InputFlags::DONE) {
            // New stream.
            self.flags.remove(InputFlags::EOS | InputFlags::DONE);
        } else if msg.length == 0 && self.flags.contains(InputFlags::EOS) {
            log::warn!("input: {:?} rejected, end of stream already queued", msg.id);
            core.response_err(msg);
            return false;
        }
        if msg.length == 0 {
            self.flags.insert(InputFlags::EOS);
        }
        let was_empty = self.queue.enqueue(msg);
        if was_empty && self.is_bypass() {
            self.skip_eos(core);
        }
        was_empty
    }

    /// Copy queued data into the internal buffer. Returns whether the buffer
    /// is full.
    pub fn fill(&mut self, core: &mut Core) -> bool {
        assert_invariant(
            PORT_FILL_BUFFERED,
            !self.is_bypass(),
            "fill on a bypass port",
            Some("InputPort::fill"),
        );
        while self.filled < self.size {
            let (length, buffer) = match self.queue.head() {
                Some(m) => (m.length, m.buffer),
                None => break,
            };
            if length == 0 {
                if let Some(eos) = self.queue.dequeue() {
                    self.flags.insert(InputFlags::DONE);
                    core.complete(eos);
                }
                break;
            }
            let n = (length - self.access).min(self.size - self.filled);
            let copied = core
                .memory()
                .copy(self.buffer + self.filled, buffer + self.access, n);
            if let Err(e) = copied {
                log::warn!("input: dropping unreadable buffer: {}", e);
                self.access = 0;
                if let Some(m) = self.queue.dequeue() {
                    core.response_err(m);
                }
                continue;
            }
            self.filled += n;
            self.access += n;
            if self.access == length {
                self.access = 0;
                if let Some(m) = self.queue.dequeue() {
                    core.complete(m);
                }
            }
        }
        self.filled == self.size
    }

    /// Mark `n` bytes of the current data as consumed.
    pub fn consume(&mut self, core: &mut Core, n: u32) {
        assert_invariant(
            PORT_CONSUME_BOUNDS,
            n <= self.level(),
            "consume beyond available data",
            Some("InputPort::consume"),
        );
        if self.is_bypass() {
            let length = match self.queue.head() {
                Some(m) => m.length,
                None => return,
            };
            self.access += n;
            if self.access == length {
                self.access = 0;
                if let Some(m) = self.queue.dequeue() {
                    core.complete(m);
                }
                self.skip_eos(core);
            }
        } else {
            let rest = self.filled - n;
            if n > 0 && rest > 0 {
                if let Err(e) = core.memory().copy(self.buffer, self.buffer + n, rest) {
                    log::error!("input: buffer shift failed: {}", e);
                }
            }
            self.filled = rest;
        }
    }

    /// Address of the current data.
    pub fn data(&self) -> Option<u32> {
        if self.is_bypass() {
            self.queue
                .head()
                .filter(|m| m.length > 0)
                .map(|m| m.buffer + self.access)
        } else {
            Some(self.buffer)
        }
    }

    /// Bytes available at [`InputPort::data`].
    pub fn level(&self) -> u32 {
        if self.is_bypass() {
            self.queue.head().map_or(0, |m| m.length - self.access)
        } else {
            self.filled
        }
    }

    /// Copy of the current data.
    pub fn bytes(&self, core: &Core) -> Result<Vec<u8>> {
        match self.data() {
            Some(addr) => core.memory().to_vec(addr, self.level()),
            None => Ok(Vec::new()),
        }
    }

    pub fn is_bypass(&self) -> bool {
        self.size == 0
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(InputFlags::EOS)
    }

    pub fn is_done(&self) -> bool {
        self.flags.contains(InputFlags::DONE)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn flags(&self) -> InputFlags {
        self.flags
    }

    pub fn enable(&mut self) {
        self.flags.insert(InputFlags::ENABLED);
    }

    pub fn disable(&mut self) {
        self.flags.remove(InputFlags::ENABLED);
    }

    /// Answer every queued message with zero length and reset the stream.
    pub fn purge(&mut self, core: &mut Core) {
        self.flags.insert(InputFlags::PURGING);
        while let Some(mut m) = self.queue.dequeue() {
            m.length = 0;
            core.complete(m);
        }
        self.access = 0;
        self.filled = 0;
        self.flags
            .remove(InputFlags::EOS | InputFlags::DONE | InputFlags::PURGING);
    }

    pub fn destroy(&mut self, core: &mut Core) {
        self.purge(core);
        if self.size > 0 {
            core.mem_free(self.buffer, self.size, MemKind::Local);
            self.size = 0;
        }
        self.flags = InputFlags::empty();
    }

    /// Bypass mode: complete an end-of-stream marker at the head.
    fn skip_eos(&mut self, core: &mut Core) {
        if self.queue.head().map_or(false, |m| m.length == 0) {
            if let Some(eos) = self.queue.dequeue() {
                self.flags.insert(InputFlags::DONE);
                core.complete(eos);
            }
        }
    }
}

/// Producer endpoint.
#[derive(Debug)]
pub struct OutputPort {
    spec: PortSpec,
    dst: PortSpec,
    queue: MsgQueue,
    pool: Option<MsgPool>,
    control: Option<Message>,
    pending: Option<Message>,
    buffers: u32,
    length: u32,
    bytes: u32,
    memory: u32,
    flags: OutputFlags,
}

impl OutputPort {
    pub fn new(spec: PortSpec) -> Self {
        Self {
            spec,
            dst: PortSpec::default(),
            queue: MsgQueue::new(),
            pool: None,
            control: None,
            pending: None,
            buffers: 0,
            length: 0,
            bytes: 0,
            memory: 0,
            flags: OutputFlags::CREATED | OutputFlags::ENABLED,
        }
    }

    /// Allocate `n` buffers of `length` bytes for traffic towards `dst`.
    pub fn route(&mut self, core: &mut Core, dst: PortSpec, n: u32, length: u32, align: u32) -> Result<()> {
        if self.is_routed() {
            return Err(Error::InvalidParam("port already routed"));
        }
        if n == 0 || length == 0 {
            return Err(Error::InvalidParam("route needs at least one non-empty buffer"));
        }
        if !align.is_power_of_two() || align > MM_BLOCK_SIZE {
            return Err(Error::InvalidParam("route alignment"));
        }
        let bytes = length
            .checked_add(align - 1)
            .map(|l| l & !(align - 1))
            .and_then(|stride| stride.checked_mul(n).map(|b| (stride, b)));
        let Some((stride, bytes)) = bytes else {
            return Err(Error::NoMemory { requested: u32::MAX });
        };
        let memory = core.mem_alloc(bytes, align, MemKind::Shared)?;
        let mut pool = match core.pool_init(n + 1, MemKind::Local) {
            Ok(pool) => pool,
            Err(e) => {
                core.mem_free(memory, bytes, MemKind::Shared);
                return Err(e);
            }
        };

        let id = SessionId::new(self.spec, dst);
        self.queue = MsgQueue::with_capacity(n as usize);
        for i in 0..=n {
            let Some(mut m) = pool.get() else { break };
            m.id = id;
            if i < n {
                m.opcode = Opcode::EMPTY_THIS_BUFFER;
                m.length = length;
                m.buffer = memory + i * stride;
                self.queue.enqueue(m);
            } else {
                m.opcode = Opcode::FLUSH;
                self.control = Some(m);
            }
        }

        self.pool = Some(pool);
        self.dst = dst;
        self.buffers = n;
        self.length = length;
        self.bytes = bytes;
        self.memory = memory;
        self.flags.insert(OutputFlags::ROUTED | OutputFlags::IDLE);
        log::debug!("output {:?}: routed to {:?}, {}x{} bytes", self.spec, dst, n, length);
        Ok(())
    }

    /// Address of the next free buffer.
    pub fn data(&self) -> Option<u32> {
        self.queue.head().map(|m| m.buffer)
    }

    /// Capacity of each buffer.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Buffers currently home.
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Send the head buffer downstream carrying `n` bytes; 0 ends the stream.
    pub fn produce(&mut self, core: &mut Core, n: u32) {
        assert_invariant(
            PORT_PRODUCE_READY,
            self.is_routed() && !self.queue.is_empty() && n <= self.length,
            "produce without a free buffer",
            Some("OutputPort::produce"),
        );
        if let Some(mut m) = self.queue.dequeue() {
            m.length = n;
            self.flags.set(OutputFlags::DONE, n == 0);
            self.flags.remove(OutputFlags::IDLE);
            core.submit(m);
        }
    }

    /// Take back a buffer returned by the sink. Returns whether the queue of
    /// free buffers went from empty to non-empty.
    pub fn put(&mut self, msg: Message) -> bool {
        assert_invariant(
            PORT_BUFFER_ORIGIN,
            self.pool.as_ref().map_or(false, |p| p.owns(&msg)),
            "buffer returned to the wrong port",
            Some("OutputPort::put"),
        );
        let mut msg = msg;
        if msg.is_failure() {
            log::warn!("output {:?}: sink rejected buffer", self.spec);
        }
        msg.id = SessionId::new(self.spec, self.dst);
        msg.opcode = Opcode::EMPTY_THIS_BUFFER;
        msg.length = self.length;
        let was_empty = self.queue.enqueue(msg);
        if self.queue.len() as u32 == self.buffers {
            self.flags.insert(OutputFlags::IDLE);
        }
        was_empty
    }

    /// Whether `msg` is this port's flow-control message coming back.
    pub fn is_control(&self, msg: &Message) -> bool {
        msg.opcode != Opcode::EMPTY_THIS_BUFFER
            && self.pool.as_ref().map_or(false, |p| p.owns(msg))
    }

    /// Start draining outstanding buffers. Returns `true` only when there is
    /// nothing left to drain; while a flush is in flight it keeps returning
    /// `false` without sending anything.
    pub fn flush(&mut self, core: &mut Core, opcode: Opcode) -> bool {
        if !self.is_routed() || self.is_idle() {
            return true;
        }
        if self.is_flushing() {
            return false;
        }
        assert_invariant(
            PORT_FLUSH_SINGLE,
            self.control.is_some(),
            "flow-control message not home",
            Some("OutputPort::flush"),
        );
        if let Some(mut m) = self.control.take() {
            m.id = SessionId::new(self.spec, self.dst);
            m.opcode = opcode;
            m.length = 0;
            m.buffer = 0;
            self.flags.insert(OutputFlags::FLUSHING);
            log::debug!("output {:?}: flushing with {:?}", self.spec, opcode);
            core.submit(m);
        }
        false
    }

    /// Flow-control message came back. Returns whether the port is idle.
    pub fn flush_done(&mut self, msg: Message) -> bool {
        assert_invariant(
            PORT_BUFFER_ORIGIN,
            self.flags.contains(OutputFlags::FLUSHING)
                && self.pool.as_ref().map_or(false, |p| p.owns(&msg)),
            "unexpected flow-control response",
            Some("OutputPort::flush_done"),
        );
        self.control = Some(msg);
        self.flags.remove(OutputFlags::FLUSHING);
        self.is_idle()
    }

    /// Release the buffers and the message pool allocated by `route`.
    pub fn unroute(&mut self, core: &mut Core) {
        assert_invariant(
            PORT_UNROUTE_IDLE,
            self.is_routed()
                && self.is_idle()
                && !self.flags.contains(OutputFlags::FLUSHING)
                && self.control.is_some(),
            "unroute of a busy port",
            Some("OutputPort::unroute"),
        );
        if let Some(mut pool) = self.pool.take() {
            while let Some(m) = self.queue.dequeue() {
                pool.put(m);
            }
            if let Some(c) = self.control.take() {
                pool.put(c);
            }
            core.pool_destroy(pool, MemKind::Local);
        }
        core.mem_free(self.memory, self.bytes, MemKind::Shared);
        self.buffers = 0;
        self.length = 0;
        self.bytes = 0;
        self.memory = 0;
        self.flags
            .remove(OutputFlags::ROUTED | OutputFlags::IDLE | OutputFlags::DONE);
        log::debug!("output {:?}: unrouted", self.spec);
    }

    /// Handle an UNROUTE command. Answers it immediately when the port is
    /// idle, otherwise flushes and keeps it until [`OutputPort::unroute_done`].
    pub fn unroute_start(&mut self, core: &mut Core, cmd: Message) -> bool {
        if !self.is_routed() {
            core.response(cmd);
            return true;
        }
        if self.is_idle() && !self.is_flushing() {
            self.unroute(core);
            core.response(cmd);
            return true;
        }
        if self.pending.is_some() {
            log::warn!("output {:?}: unroute already in progress", self.spec);
            core.response_err(cmd);
            return false;
        }
        self.pending = Some(cmd);
        self.flags.insert(OutputFlags::UNROUTING);
        // A flush already in flight finishes the handshake.
        self.flush(core, Opcode::UNROUTE);
        false
    }

    /// Finish an UNROUTE once the flush completed.
    pub fn unroute_done(&mut self, core: &mut Core) {
        if !self.flags.contains(OutputFlags::UNROUTING) {
            return;
        }
        self.unroute(core);
        self.flags.remove(OutputFlags::UNROUTING);
        if let Some(cmd) = self.pending.take() {
            core.response(cmd);
        }
    }

    pub fn destroy(&mut self, core: &mut Core) {
        if self.is_routed() {
            self.unroute(core);
        }
        self.flags = OutputFlags::empty();
    }

    pub fn spec(&self) -> PortSpec {
        self.spec
    }

    pub fn dst(&self) -> PortSpec {
        self.dst
    }

    pub fn is_routed(&self) -> bool {
        self.flags.contains(OutputFlags::ROUTED)
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(OutputFlags::IDLE)
    }

    pub fn is_flushing(&self) -> bool {
        self.flags.contains(OutputFlags::FLUSHING)
    }

    pub fn is_unrouting(&self) -> bool {
        self.flags.contains(OutputFlags::UNROUTING)
    }

    pub fn is_done(&self) -> bool {
        self.flags.contains(OutputFlags::DONE)
    }

    pub fn flags(&self) -> OutputFlags {
        self.flags
    }
}
