//! Synchronous host-facing error type.
//!
//! Internal state machines never use this type: per the propagation policy,
//! capture-context failures update a status word and task-context failures
//! flow out through the OS-call ABI's own `(value, errno)` pair. This type
//! only covers the host API boundary (`Engine::read/write/verify/
//! set_phi2_khz/start_action`).

use thiserror::Error;

/// A host request was rejected before any state machine was started.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// `addr + len` does not fit in the 16-bit CPU address space.
    #[error("length {len} at address {addr:#06x} overruns the 16-bit address space")]
    InvalidRange { addr: u16, len: usize },

    /// Requested PHI2 frequency is outside the supported 100 kHz - 8 MHz range.
    #[error("phi2 frequency {0} kHz is outside the supported 100-8000 kHz range")]
    UnsupportedFrequency(u32),

    /// An action (read/write/verify) was requested while one is already active.
    #[error("an action is already active")]
    ActionBusy,

    /// A sideband message was queued for an out-of-range device id.
    #[error("sideband device id {0} is out of the 3-bit range")]
    InvalidDevice(u8),
}
