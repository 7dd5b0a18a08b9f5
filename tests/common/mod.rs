//! Test components shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use xfcore::io::{InputPort, OutputPort, RouteRequest};
use xfcore::{ClassRegistry, Component, Core, Message, Opcode, PortSpec, Result, Run};

/// What the test components observed.
#[derive(Default)]
pub struct Probe {
    /// Payloads seen by sinks, in arrival order.
    pub deliveries: Mutex<Vec<Vec<u8>>>,
    /// Last published source state.
    pub source: Mutex<SourceState>,
    /// `(client, core time)` of every ticker activation.
    pub ticks: Mutex<Vec<(u32, u32)>>,
    /// Messages handed to collectors.
    pub collected: Mutex<Vec<Message>>,
    /// Sinks that saw the end of a stream.
    pub eos: Mutex<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceState {
    pub routed: bool,
    pub idle: bool,
    pub available: usize,
    pub produced: u32,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<Vec<u8>> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn source(&self) -> SourceState {
        self.source.lock().unwrap().clone()
    }

    pub fn ticks(&self) -> Vec<(u32, u32)> {
        self.ticks.lock().unwrap().clone()
    }

    pub fn take_collected(&self) -> Vec<Message> {
        std::mem::take(&mut *self.collected.lock().unwrap())
    }
}

/// Copies data messages from its input port to its routed output port.
pub struct Source {
    input: InputPort,
    output: OutputPort,
    produced: u32,
    probe: Arc<Probe>,
}

impl Source {
    pub fn new(core: &mut Core, id: PortSpec, probe: Arc<Probe>) -> Result<Self> {
        Ok(Self {
            input: InputPort::new(core, 0, 4)?,
            output: OutputPort::new(id),
            produced: 0,
            probe,
        })
    }

    fn pump(&mut self, core: &mut Core) {
        while self.output.available() > 0 {
            if let (Some(src), Some(dst)) = (self.input.data(), self.output.data()) {
                let n = self.input.level().min(self.output.length());
                if core.memory().copy(dst, src, n).is_err() {
                    break;
                }
                self.output.produce(core, n);
                self.input.consume(core, n);
                self.produced += 1;
            } else if self.input.is_done() && !self.output.is_done() {
                self.output.produce(core, 0);
            } else {
                break;
            }
        }
    }

    fn publish(&self) {
        *self.probe.source.lock().unwrap() = SourceState {
            routed: self.output.is_routed(),
            idle: self.output.is_idle(),
            available: self.output.available(),
            produced: self.produced,
        };
    }
}

impl Component for Source {
    fn entry(&mut self, core: &mut Core, msg: Option<Message>) -> Run {
        if let Some(msg) = msg {
            if self.output.is_control(&msg) {
                let idle = self.output.flush_done(msg);
                if idle && self.output.is_unrouting() {
                    self.output.unroute_done(core);
                }
            } else {
                match msg.opcode {
                    Opcode::ROUTE => {
                        let request = core.memory().read_pod::<RouteRequest>(msg.buffer);
                        let routed = match request {
                            Ok(r) => self.output.route(core, r.dst(), r.count, r.length, r.align),
                            Err(e) => Err(e),
                        };
                        match routed {
                            Ok(()) => core.response(msg),
                            Err(_) => core.response_err(msg),
                        }
                    }
                    Opcode::UNROUTE => {
                        self.output.unroute_start(core, msg);
                    }
                    Opcode::EMPTY_THIS_BUFFER => {
                        self.output.put(msg);
                    }
                    Opcode::FILL_THIS_BUFFER => {
                        self.input.put(core, msg);
                    }
                    Opcode::UNREGISTER => return Run::Terminate(Some(msg)),
                    _ => core.response_err(msg),
                }
            }
        }
        self.pump(core);
        self.publish();
        Run::Continue
    }

    fn exit(&mut self, core: &mut Core, msg: Option<Message>) -> Result<()> {
        self.input.destroy(core);
        self.output.destroy(core);
        self.publish();
        if let Some(msg) = msg {
            core.response(msg);
        }
        Ok(())
    }
}

/// Records every buffer it receives and hands it straight back.
pub struct Sink {
    input: InputPort,
    probe: Arc<Probe>,
}

impl Sink {
    pub fn new(core: &mut Core, probe: Arc<Probe>) -> Result<Self> {
        Ok(Self {
            input: InputPort::new(core, 0, 4)?,
            probe,
        })
    }
}

impl Component for Sink {
    fn entry(&mut self, core: &mut Core, msg: Option<Message>) -> Run {
        if let Some(msg) = msg {
            match msg.opcode {
                Opcode::EMPTY_THIS_BUFFER => {
                    let done = self.input.is_done();
                    self.input.put(core, msg);
                    if !done && self.input.is_done() {
                        *self.probe.eos.lock().unwrap() += 1;
                    }
                }
                Opcode::FLUSH | Opcode::UNROUTE => {
                    self.input.purge(core);
                    core.response(msg);
                }
                Opcode::UNREGISTER => return Run::Terminate(Some(msg)),
                _ => core.response_err(msg),
            }
        }
        while self.input.level() > 0 {
            if let Ok(bytes) = self.input.bytes(core) {
                self.probe.deliveries.lock().unwrap().push(bytes);
            }
            let n = self.input.level();
            self.input.consume(core, n);
            if self.input.is_done() {
                *self.probe.eos.lock().unwrap() += 1;
            }
        }
        Run::Continue
    }

    fn exit(&mut self, core: &mut Core, msg: Option<Message>) -> Result<()> {
        self.input.destroy(core);
        if let Some(msg) = msg {
            core.response(msg);
        }
        Ok(())
    }
}

/// Reschedules itself `remaining` times, `period` ticks apart.
pub struct Ticker {
    id: PortSpec,
    period: u32,
    remaining: u32,
    probe: Arc<Probe>,
}

impl Component for Ticker {
    fn entry(&mut self, core: &mut Core, msg: Option<Message>) -> Run {
        match msg {
            None => {
                self.probe
                    .ticks
                    .lock()
                    .unwrap()
                    .push((self.id.client(), core.timestamp()));
                if self.remaining > 0 {
                    self.remaining -= 1;
                    core.schedule(self.id.client(), self.period);
                }
            }
            Some(msg) if msg.opcode == Opcode::UNREGISTER => return Run::Terminate(Some(msg)),
            Some(msg) if msg.opcode == Opcode::RESUME => {
                core.schedule(self.id.client(), 0);
                core.schedule(self.id.client(), 0);
                core.response(msg);
            }
            Some(msg) if msg.opcode == Opcode::PAUSE => {
                core.cancel(self.id.client());
                core.response(msg);
            }
            Some(msg) => core.response_err(msg),
        }
        Run::Continue
    }

    fn exit(&mut self, core: &mut Core, msg: Option<Message>) -> Result<()> {
        if let Some(msg) = msg {
            core.response(msg);
        }
        Ok(())
    }
}

/// Keeps every message it receives in the probe and refuses to exit while
/// holding one.
pub struct Collector {
    probe: Arc<Probe>,
}

impl Component for Collector {
    fn entry(&mut self, _core: &mut Core, msg: Option<Message>) -> Run {
        match msg {
            Some(msg) if msg.opcode == Opcode::UNREGISTER => return Run::Terminate(Some(msg)),
            Some(msg) => self.probe.collected.lock().unwrap().push(msg),
            None => {}
        }
        Run::Continue
    }

    fn exit(&mut self, _core: &mut Core, msg: Option<Message>) -> Result<()> {
        match msg {
            Some(msg) => {
                self.probe.collected.lock().unwrap().push(msg);
                Err(xfcore::Error::Component("collector keeps its messages"))
            }
            None => Ok(()),
        }
    }
}

/// Factory with every test class.
pub fn registry(probe: &Arc<Probe>) -> ClassRegistry {
    let (p1, p2, p3, p4) = (probe.clone(), probe.clone(), probe.clone(), probe.clone());
    ClassRegistry::new()
        .with("source", move |core, id| {
            Ok(Box::new(Source::new(core, id, p1.clone())?) as Box<dyn Component>)
        })
        .with("sink", move |core, _id| {
            Ok(Box::new(Sink::new(core, p2.clone())?) as Box<dyn Component>)
        })
        .with("ticker", move |_core, id| {
            Ok(Box::new(Ticker {
                id,
                period: 10,
                remaining: 3,
                probe: p3.clone(),
            }) as Box<dyn Component>)
        })
        .with("collector", move |_core, _id| {
            Ok(Box::new(Collector { probe: p4.clone() }) as Box<dyn Component>)
        })
}
