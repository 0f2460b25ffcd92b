//! Extended RAM (XRAM) — a 64 KiB byte array shared with the Sideband Link,
//! addressed through two independent auto-incrementing cursors.

use crate::sideband::{Message, SidebandLink};

/// Size of the extended RAM array.
pub const XRAM_SIZE: usize = 0x10000;

/// One auto-incrementing cursor: address, signed step, mirror byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cursor {
    address: u16,
    step: i8,
}

impl Cursor {
    /// Program the cursor's address and step from the window.
    pub fn configure(&mut self, address: u16, step: i8) {
        self.address = address;
        self.step = step;
    }

    /// Current address.
    pub fn address(&self) -> u16 {
        self.address
    }

    fn advance(&mut self) {
        self.address = self.address.wrapping_add(self.step as u16);
    }
}

/// The 64 KiB extended RAM plus its two cursors.
pub struct ExtendedRam {
    bytes: Box<[u8; XRAM_SIZE]>,
    cursors: [Cursor; 2],
}

impl ExtendedRam {
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0; XRAM_SIZE]),
            cursors: [Cursor::default(); 2],
        }
    }

    /// Direct byte access, for the Action Controller / host API; does not
    /// touch a cursor or emit a sideband message.
    pub fn read(&self, addr: u16) -> u8 {
        self.bytes[addr as usize]
    }

    /// Direct byte write, bypassing cursors and the sideband.
    pub fn write(&mut self, addr: u16, value: u8) {
        self.bytes[addr as usize] = value;
    }

    /// Program cursor `k`'s address and step (window writes to ADDR/STEP).
    pub fn configure_cursor(&mut self, k: usize, address: u16, step: i8) {
        self.cursors[k].configure(address, step);
    }

    /// Current address of cursor `k`.
    pub fn cursor_address(&self, k: usize) -> u16 {
        self.cursors[k].address()
    }

    /// CPU read of cursor `k`'s mirror byte: returns the byte at the current
    /// address, then advances the cursor and refreshes from the new location.
    pub fn cursor_read(&mut self, k: usize) -> u8 {
        let addr = self.cursors[k].address();
        let value = self.read(addr);
        self.cursors[k].advance();
        value
    }

    /// CPU write of cursor `k`'s mirror byte: commits the byte, advances the
    /// cursor, then enqueues a sideband message. The commit happens strictly
    /// before the enqueue so a companion reading a different path never
    /// observes a byte newer than it was told about.
    pub fn cursor_write(&mut self, k: usize, value: u8, sideband: &SidebandLink) {
        let addr = self.cursors[k].address();
        self.write(addr, value);
        self.cursors[k].advance();
        let _ = sideband.try_send(Message::xram(addr, value));
    }

    /// The mirror byte the CPU should currently observe for cursor `k`
    /// without performing a cursor operation (for refreshing after a
    /// non-cursor write, or for tests).
    pub fn cursor_mirror(&self, k: usize) -> u8 {
        self.read(self.cursors[k].address())
    }
}

impl Default for ExtendedRam {
    fn default() -> Self {
        Self::new()
    }
}
