//! Component contract, class factory and the per-core client map.

use crate::core::Core;
use crate::error::{Error, Result};
use crate::invariant_ppt::{assert_invariant, CLIENT_SLOT_LIVE};
use crate::msg::{Message, PortSpec, MAX_CLIENTS};
use crate::sched::TaskRef;
use std::collections::HashMap;

/// Outcome of a component activation.
#[derive(Debug)]
pub enum Run {
    /// Keep the component alive.
    Continue,
    /// Tear the component down; the message is handed to [`Component::exit`].
    Terminate(Option<Message>),
}

/// Processing unit hosted by a core.
///
/// `entry` is called with `Some(msg)` when a message is dispatched to the
/// component and with `None` when its scheduler task fires. It must not
/// block: a component that cannot make progress returns and waits for the
/// next message.
pub trait Component: Send {
    fn entry(&mut self, core: &mut Core, msg: Option<Message>) -> Run;

    /// Release resources. On error the component stays registered.
    fn exit(&mut self, core: &mut Core, msg: Option<Message>) -> Result<()>;
}

/// Builds components for REGISTER commands.
pub trait ComponentFactory: Send + Sync {
    fn create(&self, core: &mut Core, id: PortSpec, class: &str) -> Result<Box<dyn Component>>;
}

type Constructor = Box<dyn Fn(&mut Core, PortSpec) -> Result<Box<dyn Component>> + Send + Sync>;

/// Factory mapping class names to constructors.
#[derive(Default)]
pub struct ClassRegistry {
    classes: HashMap<String, Constructor>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the constructor for `name`.
    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn(&mut Core, PortSpec) -> Result<Box<dyn Component>> + Send + Sync + 'static,
    {
        self.classes.insert(name.to_string(), Box::new(ctor));
    }

    pub fn with<F>(mut self, name: &str, ctor: F) -> Self
    where
        F: Fn(&mut Core, PortSpec) -> Result<Box<dyn Component>> + Send + Sync + 'static,
    {
        self.register(name, ctor);
        self
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

impl ComponentFactory for ClassRegistry {
    fn create(&self, core: &mut Core, id: PortSpec, class: &str) -> Result<Box<dyn Component>> {
        match self.classes.get(class) {
            Some(ctor) => ctor(core, id),
            None => Err(Error::UnknownClass(class.to_string())),
        }
    }
}

#[derive(Default)]
struct ClientSlot {
    live: bool,
    component: Option<Box<dyn Component>>,
    task: Option<TaskRef>,
}

/// Client id to component table. Client 0 is the proxy and never handed out.
pub struct ClientMap {
    slots: Vec<ClientSlot>,
    free: Vec<u32>,
}

impl ClientMap {
    pub fn new(max_clients: u32) -> Self {
        let max = max_clients.clamp(1, MAX_CLIENTS);
        Self {
            slots: (0..max).map(|_| ClientSlot::default()).collect(),
            free: (1..max).rev().collect(),
        }
    }

    /// Claim the lowest free client id.
    pub fn reserve(&mut self) -> Option<u32> {
        let client = self.free.pop()?;
        self.slots[client as usize].live = true;
        Some(client)
    }

    pub fn install(&mut self, client: u32, component: Box<dyn Component>) {
        let slot = self.live_slot(client, "install");
        slot.component = Some(component);
    }

    /// Take the component out for an activation.
    pub fn take(&mut self, client: u32) -> Option<Box<dyn Component>> {
        self.slots
            .get_mut(client as usize)
            .filter(|s| s.live)
            .and_then(|s| s.component.take())
    }

    /// Put a component back after an activation.
    pub fn restore(&mut self, client: u32, component: Box<dyn Component>) {
        self.install(client, component);
    }

    /// Recycle `client`. Returns the scheduler task it still held.
    pub fn release(&mut self, client: u32) -> Option<TaskRef> {
        let slot = self.live_slot(client, "release");
        let task = slot.task.take();
        slot.component = None;
        slot.live = false;
        self.free.push(client);
        task
    }

    pub fn task(&self, client: u32) -> Option<TaskRef> {
        self.slots.get(client as usize).and_then(|s| s.task)
    }

    pub fn set_task(&mut self, client: u32, task: Option<TaskRef>) {
        self.live_slot(client, "set_task").task = task;
    }

    pub fn is_live(&self, client: u32) -> bool {
        self.slots.get(client as usize).map_or(false, |s| s.live)
    }

    /// Number of registered clients.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn live_slot(&mut self, client: u32, context: &str) -> &mut ClientSlot {
        let live = self.is_live(client);
        assert_invariant(CLIENT_SLOT_LIVE, live, "client slot not reserved", Some(context));
        &mut self.slots[client as usize]
    }
}

impl std::fmt::Debug for ClientMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMap")
            .field("capacity", &self.slots.len())
            .field("live", &self.live())
            .finish()
    }
}
