//! Messages, message pools and message queues.

use crate::error::{Error, Result};
use crate::invariant_ppt::{assert_invariant, MSG_POOL_COMPLETE, MSG_POOL_ORIGIN};
use crate::mm::MemPool;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bytes reserved per message slot (one cache line).
pub const MSG_SLOT_SIZE: u32 = 32;

/// Failure marker carried in [`Message::length`] of a response.
pub const RESPONSE_FAILED: u32 = u32::MAX;

/// Maximum number of cores addressable by a [`PortSpec`].
pub const MAX_CORES: u32 = 4;

/// Maximum number of clients per core.
pub const MAX_CLIENTS: u32 = 64;

/// Packed endpoint: core (bits 0-1), client (bits 2-7), port (bits 8-14)
/// and the proxy flag (bit 15).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortSpec(u16);

impl PortSpec {
    const PROXY: u16 = 1 << 15;

    pub const fn new(core: u32, client: u32, port: u32) -> Self {
        PortSpec(((core & 0x3) | ((client & 0x3f) << 2) | ((port & 0x7f) << 8)) as u16)
    }

    /// Endpoint on the host side of the proxy, hosted by `core`.
    pub const fn proxy(core: u32, client: u32) -> Self {
        PortSpec(Self::new(core, client, 0).0 | Self::PROXY)
    }

    pub const fn from_raw(raw: u16) -> Self {
        PortSpec(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn core(self) -> u32 {
        (self.0 & 0x3) as u32
    }

    pub const fn client(self) -> u32 {
        ((self.0 >> 2) & 0x3f) as u32
    }

    pub const fn port(self) -> u32 {
        ((self.0 >> 8) & 0x7f) as u32
    }

    pub const fn is_proxy(self) -> bool {
        self.0 & Self::PROXY != 0
    }

    /// Same core and client, different port.
    pub const fn with_port(self, port: u32) -> Self {
        PortSpec((self.0 & !(0x7f << 8)) | (((port & 0x7f) as u16) << 8))
    }
}

impl fmt::Debug for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.core(), self.client(), self.port())?;
        if self.is_proxy() {
            write!(f, "P")?;
        }
        Ok(())
    }
}

/// Source endpoint in the low half, destination in the high half.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(u32);

impl SessionId {
    pub const fn new(src: PortSpec, dst: PortSpec) -> Self {
        SessionId(src.0 as u32 | ((dst.0 as u32) << 16))
    }

    pub const fn from_raw(raw: u32) -> Self {
        SessionId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn src(self) -> PortSpec {
        PortSpec(self.0 as u16)
    }

    pub const fn dst(self) -> PortSpec {
        PortSpec((self.0 >> 16) as u16)
    }

    /// Source and destination exchanged, as used by responses.
    pub const fn swapped(self) -> Self {
        Self::new(self.dst(), self.src())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}->{:?}", self.src(), self.dst())
    }
}

/// Command opcode: kind in bits 0-5, command-data flag in bit 31 and
/// response-data flag in bit 30.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Opcode(u32);

impl Opcode {
    const CDATA: u32 = 1 << 31;
    const RDATA: u32 = 1 << 30;

    pub const fn new(cdata: bool, rdata: bool, kind: u32) -> Self {
        let mut raw = kind & 0x3f;
        if cdata {
            raw |= Self::CDATA;
        }
        if rdata {
            raw |= Self::RDATA;
        }
        Opcode(raw)
    }

    pub const UNREGISTER: Opcode = Opcode::new(false, false, 0);
    pub const REGISTER: Opcode = Opcode::new(true, false, 1);
    pub const ROUTE: Opcode = Opcode::new(true, false, 2);
    pub const UNROUTE: Opcode = Opcode::new(true, false, 3);
    pub const ALLOC: Opcode = Opcode::new(false, false, 4);
    pub const FREE: Opcode = Opcode::new(false, false, 5);
    pub const SET_PARAM: Opcode = Opcode::new(true, false, 6);
    pub const GET_PARAM: Opcode = Opcode::new(true, true, 7);
    pub const EMPTY_THIS_BUFFER: Opcode = Opcode::new(true, false, 8);
    pub const FILL_THIS_BUFFER: Opcode = Opcode::new(false, true, 9);
    pub const FLUSH: Opcode = Opcode::new(false, false, 10);
    pub const PAUSE: Opcode = Opcode::new(false, false, 11);
    pub const RESUME: Opcode = Opcode::new(false, false, 12);

    pub const fn from_raw(raw: u32) -> Self {
        Opcode(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn kind(self) -> usize {
        (self.0 & 0x3f) as usize
    }

    /// Command buffer holds data written by the sender.
    pub const fn has_cdata(self) -> bool {
        self.0 & Self::CDATA != 0
    }

    /// Response buffer holds data written by the receiver.
    pub const fn has_rdata(self) -> bool {
        self.0 & Self::RDATA != 0
    }

    pub fn name(self) -> &'static str {
        match self.kind() {
            0 => "UNREGISTER",
            1 => "REGISTER",
            2 => "ROUTE",
            3 => "UNROUTE",
            4 => "ALLOC",
            5 => "FREE",
            6 => "SET_PARAM",
            7 => "GET_PARAM",
            8 => "EMPTY_THIS_BUFFER",
            9 => "FILL_THIS_BUFFER",
            10 => "FLUSH",
            11 => "PAUSE",
            12 => "RESUME",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#010x})", self.name(), self.0)
    }
}

/// Identity of the pool a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Fixed-size record carrying every command, response and data buffer.
///
/// A message has exactly one owner at a time and moves by value between
/// pools, queues and components. It is only ever created by a [`MsgPool`]
/// and must be returned to that pool.
#[derive(Debug)]
pub struct Message {
    pub id: SessionId,
    pub opcode: Opcode,
    pub length: u32,
    pub buffer: u32,
    origin: PoolId,
}

impl Message {
    pub fn origin(&self) -> PoolId {
        self.origin
    }

    pub fn is_failure(&self) -> bool {
        self.length == RESPONSE_FAILED
    }
}

/// FIFO of owned messages.
#[derive(Debug, Default)]
pub struct MsgQueue {
    items: VecDeque<Message>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that accepts `capacity` messages without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Append `msg`; returns whether the queue was empty before.
    pub fn enqueue(&mut self, msg: Message) -> bool {
        let was_empty = self.items.is_empty();
        self.items.push_back(msg);
        was_empty
    }

    pub fn dequeue(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    pub fn head(&self) -> Option<&Message> {
        self.items.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Message> {
        self.items.front_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }
}

/// Pool of `n` messages whose slots are reserved from a [`MemPool`].
#[derive(Debug)]
pub struct MsgPool {
    id: PoolId,
    base: u32,
    capacity: u32,
    free: Vec<Message>,
}

impl MsgPool {
    pub fn init(n: u32, mm: &mut MemPool) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidParam("message pool needs at least one message"));
        }
        let bytes = n * MSG_SLOT_SIZE;
        let base = mm.alloc(bytes).ok_or(Error::NoMemory { requested: bytes })?;
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        let free = (0..n)
            .map(|_| Message {
                id: SessionId::default(),
                opcode: Opcode::default(),
                length: 0,
                buffer: 0,
                origin: id,
            })
            .collect();
        log::debug!("msg: pool {:?} with {} messages at {:#x}", id, n, base);
        Ok(Self {
            id,
            base,
            capacity: n,
            free,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Take a cleared message; `None` when the pool is exhausted.
    pub fn get(&mut self) -> Option<Message> {
        let mut msg = self.free.pop()?;
        msg.id = SessionId::default();
        msg.opcode = Opcode::default();
        msg.length = 0;
        msg.buffer = 0;
        Some(msg)
    }

    /// Like [`MsgPool::get`], reporting an empty pool as an error.
    pub fn try_get(&mut self) -> Result<Message> {
        self.get().ok_or(Error::PoolExhausted)
    }

    /// Return a message taken from this pool.
    pub fn put(&mut self, msg: Message) {
        assert_invariant(
            MSG_POOL_ORIGIN,
            msg.origin == self.id,
            "message returned to a foreign pool",
            Some("MsgPool::put"),
        );
        self.free.push(msg);
    }

    pub fn owns(&self, msg: &Message) -> bool {
        msg.origin == self.id
    }

    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Release the slot reservation. Every message must be back home.
    pub fn destroy(self, mm: &mut MemPool) {
        assert_invariant(
            MSG_POOL_COMPLETE,
            self.free.len() as u32 == self.capacity,
            "message pool destroyed with messages outstanding",
            Some("MsgPool::destroy"),
        );
        mm.free(self.base, self.capacity * MSG_SLOT_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_fields() {
        let spec = PortSpec::new(3, 17, 5);
        assert_eq!((spec.core(), spec.client(), spec.port()), (3, 17, 5));
        assert!(!spec.is_proxy());
        let proxy = PortSpec::proxy(1, 9);
        assert!(proxy.is_proxy());
        assert_eq!((proxy.core(), proxy.client()), (1, 9));
        assert_eq!(spec.with_port(2).port(), 2);
        assert_eq!(spec.with_port(2).client(), 17);
    }

    #[test]
    fn session_swap() {
        let a = PortSpec::new(0, 1, 0);
        let b = PortSpec::proxy(0, 4);
        let id = SessionId::new(a, b);
        assert_eq!(id.src(), a);
        assert_eq!(id.dst(), b);
        assert_eq!(id.swapped(), SessionId::new(b, a));
        assert_eq!(id.swapped().swapped(), id);
    }

    #[test]
    fn opcode_flags() {
        assert!(Opcode::EMPTY_THIS_BUFFER.has_cdata());
        assert!(!Opcode::EMPTY_THIS_BUFFER.has_rdata());
        assert!(Opcode::FILL_THIS_BUFFER.has_rdata());
        assert_eq!(Opcode::FLUSH.kind(), 10);
        assert_eq!(Opcode::from_raw(Opcode::ROUTE.raw()), Opcode::ROUTE);
        assert_eq!(Opcode::from_raw(63).name(), "UNKNOWN");
    }

    #[test]
    fn queue_reports_first_enqueue() {
        let mut mm = MemPool::new(0, 1024);
        let mut pool = MsgPool::init(3, &mut mm).unwrap();
        let mut q = MsgQueue::with_capacity(3);
        assert!(q.enqueue(pool.get().unwrap()));
        assert!(!q.enqueue(pool.get().unwrap()));
        q.head_mut().unwrap().length = 9;
        assert_eq!(q.dequeue().unwrap().length, 9);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pool_accounting() {
        let mut mm = MemPool::new(0, 1024);
        let mut pool = MsgPool::init(4, &mut mm).unwrap();
        assert_eq!(mm.free_bytes(), 1024 - 4 * MSG_SLOT_SIZE);
        let msgs: Vec<Message> = (0..4).map(|_| pool.get().unwrap()).collect();
        assert!(pool.get().is_none());
        assert!(msgs.iter().all(|m| pool.owns(m)));
        for m in msgs {
            pool.put(m);
        }
        assert_eq!(pool.available(), pool.capacity());
        pool.destroy(&mut mm);
        assert_eq!(mm.free_bytes(), 1024);
    }

    #[test]
    fn empty_pool_reports_exhaustion() {
        let mut mm = MemPool::new(0, 1024);
        let mut pool = MsgPool::init(1, &mut mm).unwrap();
        let m = pool.try_get().unwrap();
        assert_eq!(pool.try_get().unwrap_err(), Error::PoolExhausted);
        pool.put(m);
        assert!(pool.try_get().is_ok());
    }

    #[test]
    fn pool_init_reports_exhaustion() {
        let mut mm = MemPool::new(0, 64);
        assert_eq!(
            MsgPool::init(4, &mut mm).unwrap_err(),
            Error::NoMemory { requested: 128 }
        );
    }

    #[test]
    #[should_panic(expected = "MSG_POOL_ORIGIN")]
    fn foreign_message_is_a_bug() {
        let mut mm = MemPool::new(0, 1024);
        let mut a = MsgPool::init(1, &mut mm).unwrap();
        let mut b = MsgPool::init(1, &mut mm).unwrap();
        let m = a.get().unwrap();
        b.put(m);
    }

    #[test]
    #[should_panic(expected = "MSG_POOL_COMPLETE")]
    fn destroy_with_outstanding_message_is_a_bug() {
        let mut mm = MemPool::new(0, 1024);
        let mut pool = MsgPool::init(2, &mut mm).unwrap();
        let _held = pool.get().unwrap();
        pool.destroy(&mut mm);
    }
}
