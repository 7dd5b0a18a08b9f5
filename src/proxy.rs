//! Host proxy: the shared-memory rings connecting the DSP to the host, and
//! the command handlers serving client 0 of every core.
//!
//! Ring layout at the proxy base address:
//!
//! ```text
//! +0     header: cmd_read, cmd_write, rsp_read, rsp_write (32 bytes)
//! +32    command ring, PROXY_QUEUE_LENGTH x 16-byte slots
//! +4128  response ring, PROXY_QUEUE_LENGTH x 16-byte slots
//! ```
//!
//! A ring position is a 16-bit slot index with a 16-bit wrap counter above
//! it. The ring is empty when read and write positions are equal and full
//! when they name the same slot with different wrap counters. Each side only
//! ever writes its own position word.

use crate::core::{Core, MemKind};
use crate::dsp::DspShared;
use crate::error::{Error, Result};
use crate::io::RouteRequest;
use crate::memory::SharedMemory;
use crate::mm::{mm_round, MM_BLOCK_SIZE};
use crate::msg::{Message, Opcode, PortSpec, SessionId, RESPONSE_FAILED};
use crate::sync::CacheRegion;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

/// Slots per ring.
pub const PROXY_QUEUE_LENGTH: u32 = 256;

/// Bytes of one wire message.
pub const PROXY_MESSAGE_SIZE: u32 = 16;

const HEADER_SIZE: u32 = 32;
const CMD_READ: u32 = 0;
const CMD_WRITE: u32 = 4;
const RSP_READ: u32 = 8;
const RSP_WRITE: u32 = 12;
const CMD_RING: u32 = HEADER_SIZE;
const RSP_RING: u32 = CMD_RING + PROXY_QUEUE_LENGTH * PROXY_MESSAGE_SIZE;

/// Bytes occupied by the header and both rings.
pub const PROXY_REGION_SIZE: u32 = RSP_RING + PROXY_QUEUE_LENGTH * PROXY_MESSAGE_SIZE;

/// Message as exchanged with the host.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ProxyMessage {
    pub session_id: u32,
    pub opcode: u32,
    pub length: u32,
    pub address: u32,
}

impl ProxyMessage {
    pub fn new(id: SessionId, opcode: Opcode, length: u32, address: u32) -> Self {
        Self {
            session_id: id.raw(),
            opcode: opcode.raw(),
            length,
            address,
        }
    }

    pub fn id(&self) -> SessionId {
        SessionId::from_raw(self.session_id)
    }

    pub fn op(&self) -> Opcode {
        Opcode::from_raw(self.opcode)
    }

    pub fn is_failure(&self) -> bool {
        self.length == RESPONSE_FAILED
    }
}

/// Ring header as laid out in shared memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RingHeader {
    pub cmd_read: u32,
    pub cmd_write: u32,
    pub rsp_read: u32,
    pub rsp_write: u32,
    reserved: [u32; 4],
}

const fn ring_index(pos: u32) -> u32 {
    pos & 0xffff
}

/// Position after `pos`, bumping the wrap counter at the end of the ring.
pub const fn ring_advance(pos: u32) -> u32 {
    let index = ring_index(pos) + 1;
    if index == PROXY_QUEUE_LENGTH {
        (pos & !0xffff).wrapping_add(1 << 16)
    } else {
        (pos & !0xffff) | index
    }
}

pub const fn ring_empty(read: u32, write: u32) -> bool {
    read == write
}

pub const fn ring_full(read: u32, write: u32) -> bool {
    read != write && ring_index(read) == ring_index(write)
}

/// Messages between `read` and `write`.
pub const fn ring_level(read: u32, write: u32) -> u32 {
    if ring_full(read, write) {
        PROXY_QUEUE_LENGTH
    } else {
        (ring_index(write) + PROXY_QUEUE_LENGTH - ring_index(read)) % PROXY_QUEUE_LENGTH
    }
}

fn ring_sane(pos: u32) -> bool {
    ring_index(pos) < PROXY_QUEUE_LENGTH
}

struct Ring<'a> {
    memory: &'a SharedMemory,
    base: u32,
}

impl Ring<'_> {
    fn header(&self) -> Result<RingHeader> {
        self.memory.read_pod(self.base)
    }

    fn set(&self, offset: u32, pos: u32) -> Result<()> {
        self.memory.write_pod(self.base + offset, &pos)
    }

    fn slot(&self, ring: u32, pos: u32) -> u32 {
        self.base + ring + ring_index(pos) * PROXY_MESSAGE_SIZE
    }
}

/// Move traffic between the rings and the core. Returns whether anything
/// moved.
pub(crate) fn process_queues(core: &mut Core) -> bool {
    match shmem_io(core) {
        Ok(progress) => progress,
        Err(e) => {
            log::error!("proxy: shared memory access failed: {}", e);
            false
        }
    }
}

fn shmem_io(core: &mut Core) -> Result<bool> {
    let shared = Arc::clone(core.shared());
    let Some(base) = shared.layout.proxy else {
        return Ok(false);
    };
    let ring = Ring {
        memory: &shared.memory,
        base,
    };
    let platform = &*shared.platform;
    let header_region = CacheRegion::Range {
        addr: base,
        len: HEADER_SIZE,
    };

    let mut written = false;
    let mut worked = false;
    let mut stalled = false;
    loop {
        let mut progress = false;

        // Responses out.
        while !core.proxy_response.is_empty() {
            platform.invalidate(header_region);
            let h = ring.header()?;
            if !positions_sane("response", h.rsp_read, h.rsp_write) {
                stalled = true;
                break;
            }
            if ring_full(h.rsp_read, h.rsp_write) {
                break;
            }
            let Some(msg) = core.proxy_response.dequeue() else { break };
            if msg.opcode.has_rdata() && !msg.is_failure() && msg.length > 0 {
                platform.flush(CacheRegion::Range {
                    addr: msg.buffer,
                    len: msg.length,
                });
            }
            let slot = ring.slot(RSP_RING, h.rsp_write);
            let wire = ProxyMessage::new(msg.id, msg.opcode, msg.length, msg.buffer);
            shared.memory.write_pod(slot, &wire)?;
            platform.flush(CacheRegion::Range {
                addr: slot,
                len: PROXY_MESSAGE_SIZE,
            });
            ring.set(RSP_WRITE, ring_advance(h.rsp_write))?;
            platform.flush(header_region);
            log::trace!("proxy: response {:?} {:?}", msg.id, msg.opcode);
            recycle(core, msg);
            written = true;
            progress = true;
        }

        // Commands in.
        while !stalled {
            platform.invalidate(header_region);
            let h = ring.header()?;
            if !positions_sane("command", h.cmd_read, h.cmd_write) {
                stalled = true;
                break;
            }
            if ring_empty(h.cmd_read, h.cmd_write) {
                break;
            }
            let mut msg = match core.proxy_pool.try_get() {
                Ok(msg) => msg,
                Err(e) => {
                    log::debug!("proxy: {}, commands left in ring", e);
                    break;
                }
            };
            let slot = ring.slot(CMD_RING, h.cmd_read);
            platform.invalidate(CacheRegion::Range {
                addr: slot,
                len: PROXY_MESSAGE_SIZE,
            });
            let wire: ProxyMessage = shared.memory.read_pod(slot)?;
            ring.set(CMD_READ, ring_advance(h.cmd_read))?;
            platform.flush(header_region);

            msg.id = wire.id();
            msg.opcode = wire.op();
            msg.length = wire.length;
            msg.buffer = wire.address;
            if msg.opcode.has_cdata() && msg.length > 0 {
                platform.invalidate(CacheRegion::Range {
                    addr: msg.buffer,
                    len: msg.length,
                });
            }
            log::trace!("proxy: command {:?} {:?}", msg.id, msg.opcode);

            let src = msg.id.src();
            let dst = msg.id.dst();
            let valid = src.is_proxy()
                && src.core() == core.id()
                && !dst.is_proxy()
                && (dst.core() as usize) < shared.cores.len();
            if valid {
                core.submit(msg);
            } else {
                log::warn!("proxy: rejecting command with session {:?}", msg.id);
                msg.id = msg.id.swapped();
                msg.length = RESPONSE_FAILED;
                core.proxy_response.enqueue(msg);
            }
            progress = true;
        }

        if progress {
            worked = true;
        }
        if stalled || !progress {
            break;
        }
    }

    if written {
        platform.notify_host();
    }
    Ok(worked)
}

/// Positions are written by the host; an out of range slot index stops ring
/// service for this pass instead of addressing past the ring.
fn positions_sane(ring: &str, read: u32, write: u32) -> bool {
    let sane = ring_sane(read) && ring_sane(write);
    if !sane {
        log::error!(
            "proxy: {} ring positions out of range (read {:#x}, write {:#x})",
            ring,
            read,
            write
        );
    }
    sane
}

fn recycle(core: &mut Core, msg: Message) {
    if core.proxy_pool.owns(&msg) {
        core.proxy_pool.put(msg);
    } else {
        log::error!("proxy: response {:?} not from the proxy pool, dropped", msg.id);
    }
}

// Command table

type ProxyHandler = fn(&mut Core, &mut Message) -> Result<()>;

const PROXY_COMMANDS: [Option<ProxyHandler>; 64] = {
    let mut table: [Option<ProxyHandler>; 64] = [None; 64];
    table[Opcode::REGISTER.kind()] = Some(proxy_register as ProxyHandler);
    table[Opcode::ALLOC.kind()] = Some(proxy_alloc as ProxyHandler);
    table[Opcode::FREE.kind()] = Some(proxy_free as ProxyHandler);
    table[Opcode::FILL_THIS_BUFFER.kind()] = Some(proxy_fill_this_buffer as ProxyHandler);
    table[Opcode::FLUSH.kind()] = Some(proxy_flush as ProxyHandler);
    table
};

/// Serve a command addressed to client 0.
pub(crate) fn command(core: &mut Core, mut msg: Message) {
    let Some(handler) = PROXY_COMMANDS[msg.opcode.kind()] else {
        log::warn!(
            "proxy: {} from {:?}",
            Error::UnknownOpcode(msg.opcode.raw()),
            msg.id.src()
        );
        core.response_err(msg);
        return;
    };
    match handler(core, &mut msg) {
        Ok(()) => core.response(msg),
        Err(e) => {
            log::warn!("proxy: {:?} failed: {}", msg.opcode, e);
            core.response_err(msg);
        }
    }
}

/// Class name in the command buffer, NUL padding stripped.
fn class_name(core: &Core, msg: &Message) -> Result<String> {
    let raw = core.memory().to_vec(msg.buffer, msg.length)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec()).map_err(|_| Error::InvalidParam("class name"))
}

fn proxy_register(core: &mut Core, msg: &mut Message) -> Result<()> {
    let class = class_name(core, msg)?;
    let client = core.cmap.reserve().ok_or(Error::NoClients { core: core.id() })?;
    let id = core.spec(client, 0);
    let factory = core.factory();
    match factory.create(core, id, &class) {
        Ok(component) => {
            core.cmap.install(client, component);
            core.register_client(client);
            // Response source becomes the new client.
            msg.id = SessionId::new(msg.id.src(), id);
            log::debug!("proxy: registered '{}' as {:?}", class, id);
            Ok(())
        }
        Err(e) => {
            core.cmap.release(client);
            Err(e)
        }
    }
}

fn proxy_alloc(core: &mut Core, msg: &mut Message) -> Result<()> {
    let addr = core.mem_alloc(msg.length, MM_BLOCK_SIZE, MemKind::Shared)?;
    msg.buffer = addr;
    Ok(())
}

fn proxy_free(core: &mut Core, msg: &mut Message) -> Result<()> {
    if msg.length == 0 {
        return Err(Error::InvalidParam("free of zero bytes"));
    }
    let size = mm_round(msg.length);
    if !core.pool(MemKind::Shared).is_allocated(msg.buffer, size) {
        return Err(Error::BadAddress {
            addr: msg.buffer,
            len: msg.length,
        });
    }
    core.mem_free(msg.buffer, size, MemKind::Shared);
    Ok(())
}

/// Trace sink: nothing to report.
fn proxy_fill_this_buffer(_core: &mut Core, msg: &mut Message) -> Result<()> {
    msg.length = 0;
    Ok(())
}

fn proxy_flush(_core: &mut Core, _msg: &mut Message) -> Result<()> {
    Ok(())
}

/// Host end of the proxy rings.
#[derive(Debug, Clone)]
pub struct HostChannel {
    shared: Arc<DspShared>,
    base: u32,
    core: u32,
}

impl HostChannel {
    pub(crate) fn new(shared: Arc<DspShared>, base: u32, core: u32) -> Self {
        Self { shared, base, core }
    }

    /// Core the rings are attached to.
    pub fn core(&self) -> u32 {
        self.core
    }

    /// Host-side endpoint for sessions opened by `client`.
    pub fn client(&self, client: u32) -> PortSpec {
        PortSpec::proxy(self.core, client)
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.shared.memory
    }

    /// Address of the ring header.
    pub fn base(&self) -> u32 {
        self.base
    }

    fn ring(&self) -> Ring<'_> {
        Ring {
            memory: &self.shared.memory,
            base: self.base,
        }
    }

    /// Post a command and wake the proxy core.
    pub fn send(&self, msg: ProxyMessage) -> Result<()> {
        let ring = self.ring();
        let h = ring.header()?;
        if ring_full(h.cmd_read, h.cmd_write) {
            return Err(Error::RingFull);
        }
        let slot = ring.slot(CMD_RING, h.cmd_write);
        self.shared.memory.write_pod(slot, &msg)?;
        ring.set(CMD_WRITE, ring_advance(h.cmd_write))?;
        self.shared.platform.ipi_assert(self.core);
        Ok(())
    }

    /// Take the oldest response, if any.
    pub fn recv(&self) -> Result<Option<ProxyMessage>> {
        let ring = self.ring();
        let h = ring.header()?;
        if ring_empty(h.rsp_read, h.rsp_write) {
            return Ok(None);
        }
        let msg = self.shared.memory.read_pod(ring.slot(RSP_RING, h.rsp_read))?;
        ring.set(RSP_READ, ring_advance(h.rsp_read))?;
        Ok(Some(msg))
    }

    /// Responses waiting to be received.
    pub fn pending(&self) -> Result<u32> {
        let h = self.ring().header()?;
        Ok(ring_level(h.rsp_read, h.rsp_write))
    }

    /// Commands the DSP has not picked up yet.
    pub fn outstanding(&self) -> Result<u32> {
        let h = self.ring().header()?;
        Ok(ring_level(h.cmd_read, h.cmd_write))
    }

    /// Store a ROUTE payload at `addr`.
    pub fn write_route(&self, addr: u32, req: &RouteRequest) -> Result<()> {
        self.shared.memory.write_pod(addr, req)
    }
}

const _: () = assert!(std::mem::size_of::<ProxyMessage>() == PROXY_MESSAGE_SIZE as usize);
const _: () = assert!(std::mem::size_of::<RingHeader>() == HEADER_SIZE as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_with_counter() {
        let mut pos = 0;
        for _ in 0..PROXY_QUEUE_LENGTH {
            pos = ring_advance(pos);
        }
        assert_eq!(pos, 1 << 16);
        assert!(ring_full(0, pos));
        assert!(!ring_empty(0, pos));
        assert_eq!(ring_level(0, pos), PROXY_QUEUE_LENGTH);
    }

    #[test]
    fn ring_level_across_wrap() {
        let read = (3 << 16) | 250;
        let mut write = read;
        for _ in 0..10 {
            write = ring_advance(write);
        }
        assert_eq!(ring_index(write), 4);
        assert_eq!(ring_level(read, write), 10);
        assert!(!ring_full(read, write));
    }

    #[test]
    fn wire_layout() {
        assert_eq!(PROXY_REGION_SIZE, 32 + 2 * 256 * 16);
        assert_eq!(PROXY_REGION_SIZE % MM_BLOCK_SIZE, 0);
        let m = ProxyMessage::new(
            SessionId::new(PortSpec::proxy(0, 1), PortSpec::new(0, 0, 0)),
            Opcode::ALLOC,
            256,
            0,
        );
        assert_eq!(bytemuck::bytes_of(&m).len(), 16);
        assert_eq!(m.op(), Opcode::ALLOC);
    }

    #[test]
    fn command_table_covers_proxy_opcodes() {
        for op in [
            Opcode::REGISTER,
            Opcode::ALLOC,
            Opcode::FREE,
            Opcode::FILL_THIS_BUFFER,
            Opcode::FLUSH,
        ] {
            assert!(PROXY_COMMANDS[op.kind()].is_some(), "{:?}", op);
        }
        assert!(PROXY_COMMANDS[Opcode::ROUTE.kind()].is_none());
    }
}
