//! Bus Engine — the three cooperating state machines that service every CPU
//! bus cycle on the $FFE0-$FFFF window.
//!
//! Modeled as a single struct shared between the capture and task execution
//! contexts. Individual fields are guarded by their own mutex
//! rather than one big lock, mirroring the hardware's independent Ingress,
//! Egress and Event state machines: a write cycle only ever touches the
//! register file and (for xstack/xram offsets) one auxiliary structure, the
//! same narrow slice the real DMA pair would touch.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::cpu6502::Bus as CpuBus;
use crate::event::BusEvent;
use crate::regs::{self, RegisterFile};
use crate::sideband::SidebandLink;
use crate::xram::ExtendedRam;
use crate::xstack::AuxStack;

/// Base address of the register window in the CPU's address space.
pub const WINDOW_BASE: u16 = 0xFFE0;

/// Sentinel meaning "no watched read address programmed".
const NO_WATCH: i32 = -1;

/// The Bus Engine. `cpu_ram` stands in for the 6502's own RAM/ROM outside
/// the window — the address space the Action Controller's synthesized
/// routine reads and writes, distinct from the coprocessor's own XRAM which
/// the CPU can only reach indirectly through a cursor.
pub struct BusEngine {
    regs: Mutex<RegisterFile>,
    xstack: Mutex<AuxStack>,
    xram: Mutex<ExtendedRam>,
    cpu_ram: Mutex<Box<[u8; 0x10000]>>,
    sideband: SidebandLink,
    event_tx: Sender<BusEvent>,
    /// The Event SM's one programmable watched read address (a window
    /// offset, 0-31), or `NO_WATCH`.
    watched_read_offset: AtomicI32,
    /// Cleared by the op-code 0xFF ("exit") fast path; set again by
    /// whatever brings RESB back up.
    cpu_running: AtomicBool,
}

impl BusEngine {
    /// Build a fresh engine and return it paired with the receiving end of
    /// its event queue (consumed by the Action Controller / OS-Call
    /// Dispatcher running on the task context).
    pub fn new() -> (Self, Receiver<BusEvent>) {
        let (event_tx, event_rx) = mpsc::channel();
        let engine = Self {
            regs: Mutex::new(RegisterFile::new()),
            xstack: Mutex::new(AuxStack::new()),
            xram: Mutex::new(ExtendedRam::new()),
            cpu_ram: Mutex::new(Box::new([0; 0x10000])),
            sideband: SidebandLink::new(),
            event_tx,
            watched_read_offset: AtomicI32::new(NO_WATCH),
            cpu_running: AtomicBool::new(true),
        };
        (engine, event_rx)
    }

    /// Whether RESB is currently released (the "CPU running" flag the
    /// op-code 0xFF exit fast path clears).
    pub fn is_cpu_running(&self) -> bool {
        self.cpu_running.load(Ordering::SeqCst)
    }

    /// Release RESB again after an exit, e.g. before starting a new action.
    pub fn set_cpu_running(&self, running: bool) {
        self.cpu_running.store(running, Ordering::SeqCst);
    }

    /// Program (or clear, with `None`) the Event SM's single watched read
    /// address. Reprogrammed by the Action Controller as it changes mode.
    pub fn set_watched_read_offset(&self, offset: Option<usize>) {
        let v = offset.map(|o| o as i32).unwrap_or(NO_WATCH);
        self.watched_read_offset.store(v, Ordering::SeqCst);
    }

    /// Direct register access for components that are not simulating a bus
    /// cycle (the Action Controller patching the synthesized routine, the
    /// OS-Call Dispatcher reading argument registers).
    pub fn regs(&self) -> std::sync::MutexGuard<'_, RegisterFile> {
        self.regs.lock().unwrap()
    }

    pub fn xram(&self) -> std::sync::MutexGuard<'_, ExtendedRam> {
        self.xram.lock().unwrap()
    }

    pub fn xstack(&self) -> std::sync::MutexGuard<'_, AuxStack> {
        self.xstack.lock().unwrap()
    }

    pub fn sideband(&self) -> &SidebandLink {
        &self.sideband
    }

    /// Direct read/write of CPU-addressable RAM outside the window, for the
    /// host API's bulk read/write/verify staging.
    pub fn cpu_ram_read(&self, addr: u16) -> u8 {
        self.cpu_ram.lock().unwrap()[addr as usize]
    }

    pub fn cpu_ram_write(&self, addr: u16, value: u8) {
        self.cpu_ram.lock().unwrap()[addr as usize] = value;
    }

    /// Offset within the window for CPU-visible special-cased bytes that the
    /// Ingress/Egress capture loop handles itself (stack mirror, cursor
    /// mirrors) rather than leaving as a plain register.
    fn window_write(&self, offset: usize, value: u8) {
        match offset {
            regs::OFF_XSTACK => {
                self.xstack.lock().unwrap().push(value);
                let mirror = self.xstack.lock().unwrap().mirror();
                self.regs.lock().unwrap().write(regs::OFF_XSTACK, mirror);
                return;
            }
            regs::OFF_XRAM_RW0 | regs::OFF_XRAM_RW1 => {
                let k = if offset == regs::OFF_XRAM_RW0 { 0 } else { 1 };
                self.xram.lock().unwrap().cursor_write(k, value, &self.sideband);
                let mirror = self.xram.lock().unwrap().cursor_mirror(k);
                self.regs.lock().unwrap().write(offset, mirror);
                return;
            }
            regs::OFF_OPCODE => {
                // The host always writes a raw op-code (bit 7 clear, except
                // for 0xFF itself); the busy bit is only ever added by us.
                match value {
                    // Op-code 0: reset the auxiliary stack, handled inline
                    // by the capture loop rather than dispatched.
                    0x00 => {
                        self.xstack.lock().unwrap().reset();
                        let mirror = self.xstack.lock().unwrap().mirror();
                        let mut regs = self.regs.lock().unwrap();
                        regs.write(regs::OFF_XSTACK, mirror);
                        regs.write(regs::OFF_OPCODE, 0x00);
                    }
                    // 0xFF: exit. The opcode register is cleared rather than
                    // left holding the sentinel, since its high bit would
                    // otherwise read back as a spurious busy flag.
                    0xFF => {
                        self.cpu_running.store(false, Ordering::SeqCst);
                        self.regs.lock().unwrap().write(regs::OFF_OPCODE, 0x00);
                    }
                    op => {
                        self.regs
                            .lock()
                            .unwrap()
                            .write(regs::OFF_OPCODE, op | regs::OPCODE_BUSY_BIT);
                    }
                }
                return;
            }
            _ => {}
        }
        self.regs.lock().unwrap().write(offset, value);

        // A write to a cursor's address/step reprograms it and refreshes
        // its mirror so the next read reflects the new configuration.
        if offset == regs::OFF_XRAM_STEP0 || offset == regs::OFF_XRAM_ADDR0 || offset == regs::OFF_XRAM_ADDR0 + 1 {
            self.resync_cursor(0, regs::OFF_XRAM_ADDR0, regs::OFF_XRAM_STEP0, regs::OFF_XRAM_RW0);
        } else if offset == regs::OFF_XRAM_STEP1 || offset == regs::OFF_XRAM_ADDR1 || offset == regs::OFF_XRAM_ADDR1 + 1 {
            self.resync_cursor(1, regs::OFF_XRAM_ADDR1, regs::OFF_XRAM_STEP1, regs::OFF_XRAM_RW1);
        }
    }

    fn resync_cursor(&self, k: usize, addr_off: usize, step_off: usize, mirror_off: usize) {
        let (addr, step) = {
            let regs = self.regs.lock().unwrap();
            (regs.read_u16(addr_off), regs.read(step_off) as i8)
        };
        let mirror = {
            let mut xram = self.xram.lock().unwrap();
            xram.configure_cursor(k, addr, step);
            xram.cursor_mirror(k)
        };
        self.regs.lock().unwrap().write(mirror_off, mirror);
    }

    fn window_read(&self, offset: usize) -> u8 {
        match offset {
            regs::OFF_XSTACK => {
                let value = self.xstack.lock().unwrap().pop();
                let mirror = self.xstack.lock().unwrap().mirror();
                self.regs.lock().unwrap().write(regs::OFF_XSTACK, mirror);
                value
            }
            regs::OFF_XRAM_RW0 | regs::OFF_XRAM_RW1 => {
                let k = if offset == regs::OFF_XRAM_RW0 { 0 } else { 1 };
                let value = self.xram.lock().unwrap().cursor_read(k);
                let mirror = self.xram.lock().unwrap().cursor_mirror(k);
                self.regs.lock().unwrap().write(offset, mirror);
                value
            }
            regs::OFF_UART_RX => {
                let mut regs = self.regs.lock().unwrap();
                let value = regs.read(offset);
                // Clear RX-ready (bit 6 of UART flow) on read.
                let flow = regs.read(regs::OFF_UART_FLOW);
                regs.write(regs::OFF_UART_FLOW, flow & !0x40);
                value
            }
            _ => self.regs.lock().unwrap().read(offset),
        }
    }

    /// Emit a captured bus event to the task context, if the Event SM would
    /// forward this cycle: every write, plus the one watched read address.
    fn maybe_emit(&self, offset: usize, data: u8, is_write: bool) {
        let watched = self.watched_read_offset.load(Ordering::SeqCst);
        let forward = is_write || (watched >= 0 && watched as usize == offset);
        if forward {
            let ev = if is_write {
                BusEvent::write(offset, data)
            } else {
                BusEvent::read(offset, data)
            };
            // An Event SM FIFO overflow is a logged-and-ignored design bug
            // a disconnected receiver is treated the same way.
            let _ = self.event_tx.send(ev);
        }
    }
}

impl CpuBus for BusEngine {
    fn cpu_read(&self, addr: u16) -> u8 {
        if addr >= WINDOW_BASE {
            let offset = (addr - WINDOW_BASE) as usize;
            let value = self.window_read(offset);
            self.maybe_emit(offset, value, false);
            value
        } else {
            self.cpu_ram_read(addr)
        }
    }

    fn cpu_write(&self, addr: u16, value: u8) {
        if addr >= WINDOW_BASE {
            let offset = (addr - WINDOW_BASE) as usize;
            self.window_write(offset, value);
            self.maybe_emit(offset, value, true);
        } else {
            self.cpu_ram_write(addr, value);
        }
    }
}
