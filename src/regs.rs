//! Register File — the 32-byte window at $FFE0-$FFFF.
//!
//! `regs[0..32]` mirrors the CPU-visible window byte for byte. The array is
//! kept 32-byte aligned so the Bus Engine's ingress/egress DMA can treat the
//! low 5 address bits as a direct index, matching the real hardware's
//! bit-sliced pointer trick.

/// Offset of the UART flow-control byte (bit7 TX ready, bit6 RX ready).
pub const OFF_UART_FLOW: usize = 0x00;
/// Offset of the UART transmit byte (write-only).
pub const OFF_UART_TX: usize = 0x01;
/// Offset of the UART receive byte (read clears RX-ready).
pub const OFF_UART_RX: usize = 0x02;

/// Cursor 0 mirror byte.
pub const OFF_XRAM_RW0: usize = 0x04;
/// Cursor 0 signed step.
pub const OFF_XRAM_STEP0: usize = 0x05;
/// Cursor 0 address, little-endian 16-bit.
pub const OFF_XRAM_ADDR0: usize = 0x06;

/// Cursor 1 mirror byte.
pub const OFF_XRAM_RW1: usize = 0x08;
/// Cursor 1 signed step.
pub const OFF_XRAM_STEP1: usize = 0x09;
/// Cursor 1 address, little-endian 16-bit.
pub const OFF_XRAM_ADDR1: usize = 0x0A;

/// Auxiliary stack top mirror.
pub const OFF_XSTACK: usize = 0x0C;
/// 16-bit errno, little-endian.
pub const OFF_ERRNO: usize = 0x0D;
/// OS-call opcode; high bit doubles as the busy flag.
pub const OFF_OPCODE: usize = 0x0F;

/// Accumulator return/argument register.
pub const OFF_A: usize = 0x14;
/// X return/argument register.
pub const OFF_X: usize = 0x16;
/// Secondary 16-bit return/argument register.
pub const OFF_SREG: usize = 0x18;
/// CPU reset vector, little-endian ($FFFC equivalent within the window).
pub const OFF_RESET_VEC: usize = 0x1C;

/// High bit of the opcode byte: set while a dispatched call is in flight.
pub const OPCODE_BUSY_BIT: u8 = 0x80;

/// The 32-byte register window, $FFE0-$FFFF.
#[repr(align(32))]
#[derive(Debug, Clone)]
pub struct RegisterFile {
    regs: [u8; 32],
}

impl RegisterFile {
    /// Create a window with every byte zeroed.
    pub fn new() -> Self {
        Self { regs: [0; 32] }
    }

    /// Read a byte as the CPU would observe it on a bus read cycle.
    pub fn read(&self, offset: usize) -> u8 {
        self.regs[offset & 0x1F]
    }

    /// Write a byte as the ingress DMA would deposit it on a bus write cycle.
    pub fn write(&mut self, offset: usize, value: u8) {
        self.regs[offset & 0x1F] = value;
    }

    /// Read a little-endian 16-bit field spanning `offset` and `offset + 1`.
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.read(offset), self.read(offset + 1)])
    }

    /// Write a little-endian 16-bit field spanning `offset` and `offset + 1`.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write(offset, lo);
        self.write(offset + 1, hi);
    }

    /// Raw window contents, for the Action Controller's self-modifying
    /// routine which addresses the top 16 bytes directly.
    pub fn as_slice(&self) -> &[u8; 32] {
        &self.regs
    }

    /// Mutable raw window contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8; 32] {
        &mut self.regs
    }

    /// Clear the entire window. Used only by the Action Controller when
    /// priming a canned routine.
    pub fn clear(&mut self) {
        self.regs = [0; 32];
    }

    /// Whether the OS-call dispatcher currently has a call in flight.
    pub fn opcode_busy(&self) -> bool {
        self.read(OFF_OPCODE) & OPCODE_BUSY_BIT != 0
    }

    /// Set or clear the busy bit without disturbing the low 7 opcode bits.
    pub fn set_opcode_busy(&mut self, busy: bool) {
        let op = self.read(OFF_OPCODE);
        let op = if busy {
            op | OPCODE_BUSY_BIT
        } else {
            op & !OPCODE_BUSY_BIT
        };
        self.write(OFF_OPCODE, op);
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_32_byte_aligned() {
        let regs = RegisterFile::new();
        assert_eq!(std::mem::align_of_val(&regs), 32);
    }

    #[test]
    fn write_then_read_same_offset() {
        let mut regs = RegisterFile::new();
        regs.write(OFF_UART_TX, 0x42);
        assert_eq!(regs.read(OFF_UART_TX), 0x42);
    }

    #[test]
    fn offset_wraps_into_window() {
        let mut regs = RegisterFile::new();
        regs.write(0x20 + OFF_A, 0x7F);
        assert_eq!(regs.read(OFF_A), 0x7F);
    }

    #[test]
    fn u16_field_is_little_endian() {
        let mut regs = RegisterFile::new();
        regs.write_u16(OFF_XRAM_ADDR0, 0x1234);
        assert_eq!(regs.read(OFF_XRAM_ADDR0), 0x34);
        assert_eq!(regs.read(OFF_XRAM_ADDR0 + 1), 0x12);
        assert_eq!(regs.read_u16(OFF_XRAM_ADDR0), 0x1234);
    }

    #[test]
    fn busy_bit_does_not_disturb_opcode() {
        let mut regs = RegisterFile::new();
        regs.write(OFF_OPCODE, 0x10);
        regs.set_opcode_busy(true);
        assert_eq!(regs.read(OFF_OPCODE), 0x90);
        assert!(regs.opcode_busy());
        regs.set_opcode_busy(false);
        assert_eq!(regs.read(OFF_OPCODE), 0x10);
        assert!(!regs.opcode_busy());
    }

    #[test]
    fn clear_zeroes_whole_window() {
        let mut regs = RegisterFile::new();
        for i in 0..32 {
            regs.write(i, 0xAA);
        }
        regs.clear();
        for i in 0..32 {
            assert_eq!(regs.read(i), 0);
        }
    }
}
