//! Error types for xfcore.

use thiserror::Error;

/// Result type alias using xfcore's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable failures. Every one of these ends up as a failure response
/// to the originator of the message that triggered it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Allocator could not satisfy the request.
    #[error("out of memory: {requested} bytes requested")]
    NoMemory {
        /// Size of the failed request in bytes.
        requested: u32,
    },

    /// Message pool has no free messages.
    #[error("message pool exhausted")]
    PoolExhausted,

    /// Client map of a core is full.
    #[error("no free client slots on core {core}")]
    NoClients {
        /// Core whose client map is full.
        core: u32,
    },

    /// Destination client is not registered.
    #[error("client {client} not registered on core {core}")]
    NoClient {
        /// Destination core.
        core: u32,
        /// Destination client id.
        client: u32,
    },

    /// Opcode is not handled by the receiver.
    #[error("unsupported opcode {0:#010x}")]
    UnknownOpcode(u32),

    /// Factory does not know the requested class.
    #[error("unknown component class '{0}'")]
    UnknownClass(String),

    /// Malformed request parameter.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Address range falls outside the memory it refers to.
    #[error("address range {addr:#x}+{len} out of bounds")]
    BadAddress {
        /// Start address.
        addr: u32,
        /// Length in bytes.
        len: u32,
    },

    /// Port does not accept data in its current state.
    #[error("port is disabled")]
    PortDisabled,

    /// Proxy ring has no free slot.
    #[error("proxy ring full")]
    RingFull,

    /// The DSP answered a host command with a failure response.
    #[error("command {opcode:#010x} rejected by the DSP")]
    Rejected {
        /// Raw opcode of the rejected command.
        opcode: u32,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Component-specific failure.
    #[error("component error: {0}")]
    Component(&'static str),
}
