//! Host driver: issues proxy commands against a [`Dsp`] and services it
//! until the answers arrive.

use crate::component::ComponentFactory;
use crate::dsp::{Dsp, DspConfig};
use crate::error::{Error, Result};
use crate::io::RouteRequest;
use crate::msg::{Opcode, PortSpec, SessionId};
use crate::proxy::{HostChannel, ProxyMessage};
use crate::sync::HostPlatform;
use std::collections::VecDeque;
use std::sync::Arc;

/// Drives a single-threaded [`Dsp`] from the host side.
pub struct HostHarness {
    pub dsp: Dsp,
    pub platform: Arc<HostPlatform>,
    host: HostChannel,
    staging: (u32, u32),
    client: u32,
    backlog: VecDeque<ProxyMessage>,
}

impl HostHarness {
    /// Build a DSP on a [`HostPlatform`]. The configuration must enable the
    /// host rings.
    pub fn new(config: DspConfig, factory: Arc<dyn ComponentFactory>) -> Result<Self> {
        let platform = Arc::new(HostPlatform::new(config.cores));
        let dsp = Dsp::new(config, platform.clone(), factory)?;
        let host = dsp.host().ok_or(Error::Config("host rings disabled"))?;
        let staging = dsp
            .shared()
            .layout
            .host
            .ok_or(Error::Config("host rings disabled"))?;
        Ok(Self {
            dsp,
            platform,
            host,
            staging,
            client: 1,
            backlog: VecDeque::new(),
        })
    }

    /// Give up the host end and hand the DSP over, e.g. to run its cores on
    /// threads.
    pub fn into_dsp(self) -> Dsp {
        self.dsp
    }

    pub fn host(&self) -> &HostChannel {
        &self.host
    }

    /// Session from this host client to `dst`.
    pub fn session(&self, dst: PortSpec) -> SessionId {
        SessionId::new(self.host.client(self.client), dst)
    }

    /// Post a command without waiting.
    pub fn send(&mut self, dst: PortSpec, opcode: Opcode, length: u32, address: u32) -> Result<()> {
        self.host
            .send(ProxyMessage::new(self.session(dst), opcode, length, address))
    }

    /// Service the DSP and collect every response that arrived.
    pub fn drain(&mut self) -> Result<Vec<ProxyMessage>> {
        self.dsp.run_until_idle();
        let mut out: Vec<ProxyMessage> = self.backlog.drain(..).collect();
        while let Some(rsp) = self.host.recv()? {
            out.push(rsp);
        }
        Ok(out)
    }

    /// Send a command and wait for its response.
    pub fn command(&mut self, dst: PortSpec, opcode: Opcode, length: u32, address: u32) -> Result<ProxyMessage> {
        self.send(dst, opcode, length, address)?;
        self.dsp.run_until_idle();
        let expected = self.session(dst).swapped().src();
        loop {
            let Some(rsp) = self.host.recv()? else {
                return Err(Error::Component("no response from the DSP"));
            };
            // REGISTER answers from the newly created client.
            if rsp.op() == opcode
                && (rsp.id().src() == expected || opcode == Opcode::REGISTER)
            {
                return if rsp.is_failure() {
                    Err(Error::Rejected { opcode: opcode.raw() })
                } else {
                    Ok(rsp)
                };
            }
            self.backlog.push_back(rsp);
        }
    }

    /// Create a component of `class` on `core`; returns its port 0 spec.
    pub fn register(&mut self, core: u32, class: &str) -> Result<PortSpec> {
        let (addr, size) = self.staging;
        let name = class.as_bytes();
        if name.len() as u32 >= size {
            return Err(Error::InvalidParam("class name too long"));
        }
        self.host.memory().write(addr, name)?;
        let rsp = self.command(
            PortSpec::new(core, 0, 0),
            Opcode::REGISTER,
            name.len() as u32,
            addr,
        )?;
        Ok(rsp.id().src())
    }

    pub fn unregister(&mut self, client: PortSpec) -> Result<()> {
        self.command(client, Opcode::UNREGISTER, 0, 0).map(|_| ())
    }

    /// Allocate from the shared pool of `core`.
    pub fn alloc(&mut self, core: u32, size: u32) -> Result<u32> {
        let rsp = self.command(PortSpec::new(core, 0, 0), Opcode::ALLOC, size, 0)?;
        Ok(rsp.address)
    }

    pub fn free(&mut self, core: u32, addr: u32, size: u32) -> Result<()> {
        self.command(PortSpec::new(core, 0, 0), Opcode::FREE, size, addr)
            .map(|_| ())
    }

    /// Connect output port `src` to input port `dst` with `count` buffers.
    pub fn route(&mut self, src: PortSpec, dst: PortSpec, count: u32, length: u32, align: u32) -> Result<()> {
        let (addr, _) = self.staging;
        let req = RouteRequest::new(dst, count, length, align);
        self.host.write_route(addr, &req)?;
        self.command(src, Opcode::ROUTE, std::mem::size_of::<RouteRequest>() as u32, addr)
            .map(|_| ())
    }

    pub fn unroute(&mut self, src: PortSpec) -> Result<()> {
        self.command(src, Opcode::UNROUTE, 0, 0).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ClassRegistry;

    fn harness() -> HostHarness {
        HostHarness::new(DspConfig::default(), Arc::new(ClassRegistry::new())).unwrap()
    }

    #[test]
    fn harness_alloc_free() {
        let mut h = harness();
        let before = h.dsp.core(0).pool(crate::core::MemKind::Shared).free_bytes();
        let a = h.alloc(0, 100).unwrap();
        assert_eq!(
            h.dsp.core(0).pool(crate::core::MemKind::Shared).free_bytes(),
            before - 128
        );
        h.free(0, a, 100).unwrap();
        assert_eq!(
            h.dsp.core(0).pool(crate::core::MemKind::Shared).free_bytes(),
            before
        );
    }

    #[test]
    fn harness_unknown_class_is_rejected() {
        let mut h = harness();
        let err = h.register(0, "nope").unwrap_err();
        assert_eq!(
            err,
            Error::Rejected {
                opcode: Opcode::REGISTER.raw()
            }
        );
        assert_eq!(h.dsp.core(0).clients().live(), 0);
    }

    #[test]
    fn harness_unsupported_opcode() {
        let mut h = harness();
        let err = h
            .command(PortSpec::new(0, 0, 0), Opcode::ROUTE, 0, 0)
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
    }
}
