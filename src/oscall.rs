//! OS-Call Dispatcher — the POSIX-flavored call table the CPU reaches
//! through the op-code register.
//!
//! Op-codes 0x00 (reset xstack) and 0xFF (exit) are fast paths handled
//! inline by the Bus Engine's capture loop; everything else latches the
//! busy bit there and is serviced here, in the task context.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::bus::BusEngine;
use crate::event::BusEvent;
use crate::regs;
use crate::sideband::Message;
use crate::xstack::XSTACK_SIZE;

pub const ERRNO_OK: u16 = 0;
pub const ERRNO_EBADF: u16 = 1;
pub const ERRNO_EACCES: u16 = 2;
pub const ERRNO_ENOMEM: u16 = 3;
pub const ERRNO_EIO: u16 = 4;
pub const ERRNO_ENOSYS: u16 = 5;
pub const ERRNO_EINVAL: u16 = 6;

const OP_OPEN: u8 = 0x10;
const OP_CLOSE: u8 = 0x11;
const OP_READ: u8 = 0x12;
const OP_WRITE: u8 = 0x13;
const OP_LSEEK: u8 = 0x14;
const OP_CLOCK_GETTIME: u8 = 0x20;
const OP_RNG: u8 = 0x21;
const OP_EXT_REG_WRITE: u8 = 0x70;

/// The OS-Call Dispatcher. Owns the host-side resources (open files, the
/// RNG stream) the CPU's op-codes manipulate.
pub struct OsCallDispatcher {
    files: Mutex<HashMap<i32, std::fs::File>>,
    next_fd: AtomicI32,
    rng: AtomicU64,
    start: Instant,
}

impl OsCallDispatcher {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(3), // 0-2 reserved, as on a POSIX host
            rng: AtomicU64::new(0x2545_F491_4F6C_DD1D),
            start: Instant::now(),
        }
    }

    /// Service one captured op-code write. Returns `true` if this event was
    /// an op-code dispatch (whether or not it required work here).
    pub fn on_event(&self, engine: &BusEngine, ev: BusEvent) -> bool {
        if !ev.is_write() || ev.offset() != regs::OFF_OPCODE {
            return false;
        }
        match ev.data() & !regs::OPCODE_BUSY_BIT {
            // Already handled inline by the Bus Engine's capture loop.
            0x00 | 0xFF => {}
            OP_OPEN => self.do_open(engine),
            OP_CLOSE => self.do_close(engine),
            OP_READ => self.do_read(engine),
            OP_WRITE => self.do_write(engine),
            OP_LSEEK => self.do_lseek(engine),
            OP_CLOCK_GETTIME => self.do_clock_gettime(engine),
            OP_RNG => self.do_rng(engine),
            OP_EXT_REG_WRITE => self.do_ext_reg_write(engine),
            // Unknown op-codes must clear
            // busy and set errno, never leave busy latched.
            _ => self.finish(engine, -1, ERRNO_ENOSYS),
        }
        true
    }

    fn read_ax(&self, engine: &BusEngine) -> u16 {
        let regs = engine.regs();
        (regs.read(regs::OFF_A) as u16) | ((regs.read(regs::OFF_X) as u16) << 8)
    }

    #[cfg(test)]
    pub(crate) fn read_axsreg(&self, engine: &BusEngine) -> u32 {
        let ax = self.read_ax(engine) as u32;
        let sreg = engine.regs().read_u16(regs::OFF_SREG) as u32;
        ax | (sreg << 16)
    }

    /// Write the 32-bit return value into A/X/SREG and clear busy, per the
    /// calling convention. Does not touch the auxiliary
    /// stack — callers that return data through it (only `read`) manage it
    /// themselves.
    fn finish(&self, engine: &BusEngine, value: i32, errno: u16) {
        let word = value as u32;
        let mut regs = engine.regs();
        regs.write(regs::OFF_A, (word & 0xFF) as u8);
        regs.write(regs::OFF_X, ((word >> 8) & 0xFF) as u8);
        regs.write_u16(regs::OFF_SREG, ((word >> 16) & 0xFFFF) as u16);
        regs.write_u16(regs::OFF_ERRNO, errno);
        regs.set_opcode_busy(false);
    }

    /// Input-argument cleanup every handler performs before returning
    /// restore the auxiliary stack to its empty value.
    fn reset_xstack(&self, engine: &BusEngine) {
        let mut xs = engine.xstack();
        xs.reset();
        let mirror = xs.mirror();
        drop(xs);
        engine.regs().write(regs::OFF_XSTACK, mirror);
    }

    fn do_open(&self, engine: &BusEngine) {
        let flags = self.read_ax(engine);
        let path = {
            let xs = engine.xstack();
            let bytes = xs.peek_args(XSTACK_SIZE - xs.ptr());
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        };
        self.reset_xstack(engine);

        let mut opts = OpenOptions::new();
        match flags & 0x3 {
            1 => {
                opts.write(true);
            }
            2 => {
                opts.read(true).write(true);
            }
            _ => {
                opts.read(true);
            }
        }
        if flags & 0x200 != 0 {
            opts.create(true);
        }
        if flags & 0x400 != 0 {
            opts.truncate(true);
        }
        if flags & 0x800 != 0 {
            opts.append(true);
        }

        match opts.open(&path) {
            Ok(file) => {
                let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
                self.files.lock().unwrap().insert(fd, file);
                self.finish(engine, fd, ERRNO_OK);
            }
            Err(e) => {
                let errno = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => ERRNO_EACCES,
                    std::io::ErrorKind::NotFound => ERRNO_EBADF,
                    _ => ERRNO_EIO,
                };
                self.finish(engine, -1, errno);
            }
        }
    }

    fn do_close(&self, engine: &BusEngine) {
        let fd = self.read_ax(engine) as i32;
        self.reset_xstack(engine);
        if self.files.lock().unwrap().remove(&fd).is_some() {
            self.finish(engine, 0, ERRNO_OK);
        } else {
            self.finish(engine, -1, ERRNO_EBADF);
        }
    }

    fn do_read(&self, engine: &BusEngine) {
        let fd = self.read_ax(engine) as i32;
        let len = (engine.regs().read_u16(regs::OFF_SREG) as usize).min(XSTACK_SIZE - 1);
        self.reset_xstack(engine);

        let mut buf = vec![0u8; len];
        let mut files = self.files.lock().unwrap();
        let Some(file) = files.get_mut(&fd) else {
            drop(files);
            self.finish(engine, -1, ERRNO_EBADF);
            return;
        };
        let result = file.read(&mut buf);
        drop(files);

        match result {
            Ok(n) => {
                let mut xs = engine.xstack();
                for &b in buf[..n].iter().rev() {
                    xs.push(b);
                }
                let mirror = xs.mirror();
                drop(xs);
                engine.regs().write(regs::OFF_XSTACK, mirror);
                self.finish(engine, n as i32, ERRNO_OK);
            }
            Err(_) => self.finish(engine, -1, ERRNO_EIO),
        }
    }

    fn do_write(&self, engine: &BusEngine) {
        let fd = self.read_ax(engine) as i32;
        let len = (engine.regs().read_u16(regs::OFF_SREG) as usize).min(XSTACK_SIZE - 1);
        let buf = engine.xstack().peek_args(len).to_vec();
        self.reset_xstack(engine);

        let mut files = self.files.lock().unwrap();
        let Some(file) = files.get_mut(&fd) else {
            drop(files);
            self.finish(engine, -1, ERRNO_EBADF);
            return;
        };
        let result = file.write(&buf);
        drop(files);
        match result {
            Ok(n) => self.finish(engine, n as i32, ERRNO_OK),
            Err(_) => self.finish(engine, -1, ERRNO_EIO),
        }
    }

    fn do_lseek(&self, engine: &BusEngine) {
        let fd = self.read_ax(engine) as i32;
        let offset = engine.regs().read_u16(regs::OFF_SREG) as i16 as i64;
        self.reset_xstack(engine);

        let mut files = self.files.lock().unwrap();
        let Some(file) = files.get_mut(&fd) else {
            drop(files);
            self.finish(engine, -1, ERRNO_EBADF);
            return;
        };
        let result = file.seek(SeekFrom::Start(offset.max(0) as u64));
        drop(files);
        match result {
            Ok(pos) => self.finish(engine, pos as i32, ERRNO_OK),
            Err(_) => self.finish(engine, -1, ERRNO_EIO),
        }
    }

    fn do_clock_gettime(&self, engine: &BusEngine) {
        self.reset_xstack(engine);
        let ms = self.start.elapsed().as_millis() as u32;
        self.finish(engine, ms as i32, ERRNO_OK);
    }

    fn do_rng(&self, engine: &BusEngine) {
        self.reset_xstack(engine);
        // xorshift64*: adequate for a firmware-facing PRNG, not for crypto.
        let mut x = self.rng.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.store(x, Ordering::Relaxed);
        self.finish(engine, (x as u32) as i32, ERRNO_OK);
    }

    fn do_ext_reg_write(&self, engine: &BusEngine) {
        let packed = self.read_ax(engine);
        let device = ((packed >> 5) & 0x7) as u8;
        let channel = ((packed >> 1) & 0xF) as u8;
        let selector = engine.regs().read(regs::OFF_SREG);
        let payload = {
            let xs = engine.xstack();
            let bytes = xs.peek_args(2);
            u16::from_le_bytes([bytes[0], bytes[1]])
        };
        self.reset_xstack(engine);

        let msg = Message::new(device, channel, selector, payload);
        if engine.sideband().try_send(msg) {
            self.finish(engine, 0, ERRNO_OK);
        } else {
            self.finish(engine, -1, ERRNO_EIO);
        }
    }
}

impl Default for OsCallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu6502::Bus;

    fn dispatch(engine: &BusEngine, dispatcher: &OsCallDispatcher, opcode: u8) {
        engine.cpu_write(0xFFE0 + regs::OFF_OPCODE as u16, opcode);
        let ev = BusEvent::write(regs::OFF_OPCODE, opcode);
        assert!(dispatcher.on_event(engine, ev));
    }

    #[test]
    fn unknown_opcode_clears_busy_and_sets_enosys() {
        let (engine, _rx) = BusEngine::new();
        let dispatcher = OsCallDispatcher::new();
        dispatch(&engine, &dispatcher, 0x7E);
        assert!(!engine.regs().opcode_busy());
        assert_eq!(engine.regs().read_u16(regs::OFF_ERRNO), ERRNO_ENOSYS);
        assert_eq!(engine.regs().read(regs::OFF_A), 0xFF);
    }

    #[test]
    fn clock_gettime_returns_nonzero_monotonic_ms_after_a_wait() {
        let (engine, _rx) = BusEngine::new();
        let dispatcher = OsCallDispatcher::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        dispatch(&engine, &dispatcher, OP_CLOCK_GETTIME);
        assert!(!engine.regs().opcode_busy());
        let ms = dispatcher.read_axsreg(&engine);
        assert!(ms >= 5);
    }

    #[test]
    fn rng_returns_a_word_and_advances_state() {
        let (engine, _rx) = BusEngine::new();
        let dispatcher = OsCallDispatcher::new();
        dispatch(&engine, &dispatcher, OP_RNG);
        let first = dispatcher.read_axsreg(&engine);
        dispatch(&engine, &dispatcher, OP_RNG);
        let second = dispatcher.read_axsreg(&engine);
        assert_ne!(first, second);
    }

    #[test]
    fn open_nonexistent_file_reports_ebadf() {
        let (engine, _rx) = BusEngine::new();
        let dispatcher = OsCallDispatcher::new();
        // AX = O_RDONLY; empty path on the xstack (terminator byte only).
        engine.cpu_write(0xFFE0 + regs::OFF_A as u16, 0);
        engine.cpu_write(0xFFE0 + regs::OFF_X as u16, 0);
        engine.cpu_write(0xFFE0 + regs::OFF_XSTACK as u16, 0);
        dispatch(&engine, &dispatcher, OP_OPEN);
        assert_eq!(engine.regs().read_u16(regs::OFF_ERRNO), ERRNO_EBADF);
    }

    #[test]
    fn write_then_read_round_trips_through_a_temp_file() {
        let (engine, _rx) = BusEngine::new();
        let dispatcher = OsCallDispatcher::new();
        let path = std::env::temp_dir().join(format!("oscall-test-{:p}", &dispatcher));
        let path_str = path.to_str().unwrap();

        engine.xstack().push(0); // C-string terminator
        for &b in path_str.as_bytes().iter().rev() {
            engine.xstack().push(b);
        }
        let flags: u16 = 0x02 | 0x200 | 0x400; // O_RDWR | O_CREAT | O_TRUNC
        engine.cpu_write(0xFFE0 + regs::OFF_A as u16, (flags & 0xFF) as u8);
        engine.cpu_write(0xFFE0 + regs::OFF_X as u16, (flags >> 8) as u8);

        dispatch(&engine, &dispatcher, OP_OPEN);
        assert_eq!(engine.regs().read_u16(regs::OFF_ERRNO), ERRNO_OK);
        let fd = dispatcher.read_axsreg(&engine) as i32;
        assert!(fd >= 0);

        // write "hi" (2 bytes) via xstack + SREG length.
        engine.cpu_write(0xFFE0 + regs::OFF_A as u16, (fd & 0xFF) as u8);
        engine.cpu_write(0xFFE0 + regs::OFF_X as u16, ((fd >> 8) & 0xFF) as u8);
        engine.regs().write_u16(regs::OFF_SREG, 2);
        engine.xstack().push(b'i');
        engine.xstack().push(b'h');
        dispatch(&engine, &dispatcher, OP_WRITE);
        assert_eq!(dispatcher.read_axsreg(&engine), 2);

        engine.cpu_write(0xFFE0 + regs::OFF_A as u16, (fd & 0xFF) as u8);
        engine.cpu_write(0xFFE0 + regs::OFF_X as u16, ((fd >> 8) & 0xFF) as u8);
        engine.regs().write_u16(regs::OFF_SREG, 0);
        dispatch(&engine, &dispatcher, OP_LSEEK);
        assert_eq!(dispatcher.read_axsreg(&engine), 0);

        engine.cpu_write(0xFFE0 + regs::OFF_A as u16, (fd & 0xFF) as u8);
        engine.cpu_write(0xFFE0 + regs::OFF_X as u16, ((fd >> 8) & 0xFF) as u8);
        engine.regs().write_u16(regs::OFF_SREG, 2);
        dispatch(&engine, &dispatcher, OP_READ);
        assert_eq!(dispatcher.read_axsreg(&engine), 2);
        let bytes = engine.xstack().peek_args(2).to_vec();
        assert_eq!(bytes, vec![b'h', b'i']);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ext_reg_write_enqueues_a_sideband_message() {
        let (engine, _rx) = BusEngine::new();
        let dispatcher = OsCallDispatcher::new();
        let device = 2u16;
        let channel = 5u16;
        let packed = (device << 5) | (channel << 1);
        engine.cpu_write(0xFFE0 + regs::OFF_A as u16, (packed & 0xFF) as u8);
        engine.cpu_write(0xFFE0 + regs::OFF_X as u16, (packed >> 8) as u8);
        engine.regs().write(regs::OFF_SREG, 0x42);
        engine.xstack().push(0x12);
        engine.xstack().push(0x34);
        dispatch(&engine, &dispatcher, OP_EXT_REG_WRITE);
        assert_eq!(dispatcher.read_axsreg(&engine), 0);
        let msg = engine.sideband().try_recv().expect("sideband message");
        assert_eq!(msg.device(), device as u8);
        assert_eq!(msg.channel(), channel as u8);
        assert_eq!(msg.selector(), 0x42);
    }
}
