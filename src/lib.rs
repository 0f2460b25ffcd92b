//! Bus-servicing engine for a coprocessor sharing a register window with a
//! 6502-family CPU.
//!
//! The crate clocks the CPU, owns the 32-byte `$FFE0-$FFFF` register
//! window, performs host-initiated bulk transfers via a synthesized 6502
//! routine, serves a POSIX-flavored OS-call protocol, and forwards
//! side-channel writes to a companion display/sound processor.
//!
//! # Modules
//! - [`regs`] / [`xstack`] / [`xram`]: the register window, auxiliary
//!   stack and extended RAM data model.
//! - [`event`] / [`sideband`]: the bus-event and sideband wire formats.
//! - [`bus`]: the Bus Engine tying the data model to CPU-visible reads and
//!   writes.
//! - [`action`]: host-initiated read/write/verify via a synthesized
//!   self-modifying routine.
//! - [`clock`]: PHI2 frequency quantization and the reset protocol.
//! - [`oscall`]: the OS-call dispatcher.
//! - [`cpu6502`]: a minimal 6502-family stepper used to exercise the
//!   contracts above in tests and the `demos/` binary; the real CPU is an
//!   external collaborator, out of scope for this crate.
//! - [`engine`]: wires everything together and runs the capture and task
//!   execution contexts as OS threads.

pub mod action;
pub mod bus;
pub mod clock;
pub mod cpu6502;
pub mod engine;
pub mod error;
pub mod event;
pub mod oscall;
pub mod regs;
pub mod sideband;
pub mod xram;
pub mod xstack;

pub use engine::{Engine, EngineConfig};
pub use error::ProtocolError;
