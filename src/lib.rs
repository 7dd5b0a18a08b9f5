//! Cooperative multi-core dataflow kernel for DSP audio processing.
//!
//! Components run to completion on their core, exchange fixed-size
//! [`msg::Message`]s through ports and are driven either by message arrival
//! or by an earliest-deadline-first scheduler. A host talks to the cores
//! through a pair of shared-memory rings served by the [`proxy`].

pub mod component;
pub mod core;
pub mod dsp;
pub mod error;
#[doc(hidden)]
pub mod harness;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod io;
pub mod isr;
pub mod memory;
pub mod mm;
pub mod msg;
pub mod proxy;
pub mod rbtree;
pub mod sched;
pub mod sync;

pub use crate::component::{ClassRegistry, Component, ComponentFactory, Run};
pub use crate::core::{Core, MemKind};
pub use crate::dsp::{Dsp, DspConfig};
pub use crate::error::{Error, Result};
pub use crate::msg::{Message, Opcode, PortSpec, SessionId};
