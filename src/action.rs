//! Action Controller — host-initiated bulk RAM transfers via a synthesized
//! 6502 routine.
//!
//! The host cannot touch the CPU's RAM directly. Instead this module writes
//! a tiny self-modifying program into the top 16 bytes of the register
//! window ($FFF0-$FFFF, window offsets 0x10-0x1F), points the reset vector
//! at it, and releases reset. Each iteration of the CPU's loop produces a
//! bus event this controller consumes to patch the next byte and advance.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::bus::BusEngine;
use crate::error::ProtocolError;
use crate::event::BusEvent;
use crate::regs::OFF_RESET_VEC;

/// Window offset of the synthesized routine's entry point ($FFF0).
const OFF_ROUTINE: usize = 0x10;

/// $FFF0 in full CPU address terms, for addr-space length clamping.
const FORBIDDEN_ADDR: u16 = 0xFFF0;
const VERIFY_FORBIDDEN_ADDR: u16 = 0xFFFA;

/// Below this PHI2 frequency, the first two write iterations can fail to
/// land in SRAM (the slow-clock warm-up quirk).
const SLOW_CLOCK_THRESHOLD_KHZ: u32 = 10;

/// Extra watchdog allowance layered on top of the reset time.
const WATCHDOG_EXTRA: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Active(Kind),
}

struct Inner {
    state: State,
    buffer: Vec<u8>,
    /// Index of the byte currently loaded for the CPU's next iteration.
    pos: i32,
    end: i32,
    base_addr: u16,
    /// Write-mode only: iterations left to silently absorb before the
    /// first byte is allowed to advance (the slow-clock warm-up quirk).
    warmup: i32,
    saved_reset_vec: u16,
    deadline: Option<Instant>,
    result: i32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: State::Idle,
            buffer: Vec::new(),
            pos: 0,
            end: 0,
            base_addr: 0,
            warmup: 0,
            saved_reset_vec: 0,
            deadline: None,
            result: -1,
        }
    }
}

/// The Action Controller. One instance is shared by the task context; the
/// Bus Engine's event receiver feeds it iteration-completion events.
pub struct ActionController {
    inner: Mutex<Inner>,
}

impl ActionController {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Whether an action is in flight (the "CPU active" precondition other
    /// actions must wait on).
    pub fn is_active(&self) -> bool {
        !matches!(self.inner.lock().unwrap().state, State::Idle)
    }

    /// Last result: -1 OK, -2 timeout, or a mismatch address (verify only).
    pub fn result(&self) -> i32 {
        self.inner.lock().unwrap().result
    }

    fn start_common(&self, engine: &BusEngine, entry_offset: usize, reset_us: u64) {
        let mut inner = self.inner.lock().unwrap();
        let mut regs = engine.regs();
        inner.saved_reset_vec = regs.read_u16(OFF_RESET_VEC);
        regs.write_u16(OFF_RESET_VEC, 0xFFE0 + entry_offset as u16);
        drop(regs);
        inner.deadline = Some(Instant::now() + Duration::from_micros(reset_us) + WATCHDOG_EXTRA);
    }

    /// CPU -> buffer. `len` is clamped so the transfer never overlaps the
    /// routine region; the clamped tail is zero-padded in the result.
    pub fn start_read(
        &self,
        engine: &BusEngine,
        addr: u16,
        len: usize,
        reset_us: u64,
    ) -> Result<(), ProtocolError> {
        if self.is_active() {
            return Err(ProtocolError::ActionBusy);
        }
        let clamped = clamp_len(addr, len, FORBIDDEN_ADDR);
        let mut buffer = vec![0u8; len];
        if clamped == 0 {
            std::mem::swap(&mut self.inner.lock().unwrap().buffer, &mut buffer);
            self.finish(engine, -1);
            return Ok(());
        }
        write_read_or_verify_routine(engine, addr, false);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::Active(Kind::Read);
            std::mem::swap(&mut inner.buffer, &mut buffer);
            inner.pos = 0;
            inner.end = clamped as i32;
            inner.base_addr = addr;
            inner.result = -1;
        }
        engine.set_watched_read_offset(None);
        self.start_common(engine, OFF_ROUTINE, reset_us);
        Ok(())
    }

    /// buffer -> CPU.
    pub fn start_write(
        &self,
        engine: &BusEngine,
        addr: u16,
        data: &[u8],
        reset_us: u64,
        phi2_khz: u32,
    ) -> Result<(), ProtocolError> {
        if self.is_active() {
            return Err(ProtocolError::ActionBusy);
        }
        let clamped = clamp_len(addr, data.len(), FORBIDDEN_ADDR);
        if clamped == 0 {
            self.finish(engine, -1);
            return Ok(());
        }
        let buffer = data[..clamped].to_vec();
        write_write_routine(engine, addr, buffer[0]);
        let warmup = if phi2_khz < SLOW_CLOCK_THRESHOLD_KHZ { 2 } else { 0 };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::Active(Kind::Write);
            inner.buffer = buffer;
            // byte 0 is already loaded by write_write_routine above.
            inner.pos = 0;
            inner.warmup = warmup;
            inner.end = clamped as i32;
            inner.base_addr = addr;
            inner.result = -1;
        }
        // Write-mode iterations are observed via the BRA operand *read* at
        // $FFF6 (window offset 0x16) since the STA target never changes.
        engine.set_watched_read_offset(Some(0x16));
        self.start_common(engine, OFF_ROUTINE, reset_us);
        Ok(())
    }

    /// buffer == CPU. Bytes overlapping the watchdog/reset-vector region
    /// ($FFFA+) are compared directly with no CPU code run (a mismatch
    /// there is reported as the mismatching address, a "meta" failure).
    pub fn start_verify(
        &self,
        engine: &BusEngine,
        addr: u16,
        data: &[u8],
        reset_us: u64,
    ) -> Result<(), ProtocolError> {
        if self.is_active() {
            return Err(ProtocolError::ActionBusy);
        }
        // Meta check: compare the tail overlapping $FFFA+ directly.
        let regs = engine.regs();
        for (i, &want) in data.iter().enumerate() {
            let target = addr.wrapping_add(i as u16);
            if target >= VERIFY_FORBIDDEN_ADDR {
                let offset = (target - 0xFFE0) as usize;
                if offset < 32 && regs.read(offset) != want {
                    drop(regs);
                    self.finish(engine, target as i32);
                    return Ok(());
                }
            }
        }
        drop(regs);

        let clamped = clamp_len(addr, data.len(), VERIFY_FORBIDDEN_ADDR);
        if clamped == 0 {
            self.finish(engine, -1);
            return Ok(());
        }
        let buffer = data[..clamped].to_vec();
        write_read_or_verify_routine(engine, addr, true);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::Active(Kind::Verify);
            inner.buffer = buffer;
            inner.pos = 0;
            inner.end = clamped as i32;
            inner.base_addr = addr;
            inner.result = -1;
        }
        engine.set_watched_read_offset(None);
        self.start_common(engine, OFF_ROUTINE, reset_us);
        Ok(())
    }

    /// Drain and process one captured bus event. Returns `true` if the
    /// event advanced or completed the in-flight action.
    pub fn on_event(&self, engine: &BusEngine, ev: BusEvent) -> bool {
        let kind = match self.inner.lock().unwrap().state {
            State::Active(k) => k,
            State::Idle => return false,
        };
        match kind {
            Kind::Write if !ev.is_write() && ev.offset() == 0x16 => {
                self.advance_write(engine);
                true
            }
            Kind::Read if ev.is_write() && ev.offset() == 0x1D => {
                self.advance_read(engine, ev.data());
                true
            }
            Kind::Verify if ev.is_write() && ev.offset() == 0x1C => {
                self.advance_verify(engine, ev.data());
                true
            }
            _ => false,
        }
    }

    fn advance_write(&self, engine: &BusEngine) {
        // The event fires once per completed LDA/STA/BRA loop. The byte and
        // target address it just used were loaded by the *previous* call
        // (or by `start_write` for iteration zero); here we either absorb a
        // warm-up iteration or load the next byte for the iteration after
        // this one.
        let done = {
            let mut inner = self.inner.lock().unwrap();
            if inner.warmup > 0 {
                inner.warmup -= 1;
                false
            } else {
                let next = inner.pos + 1;
                if next >= inner.end {
                    true
                } else {
                    let byte = inner.buffer[next as usize];
                    let target = inner.base_addr.wrapping_add(next as u16);
                    let mut regs = engine.regs();
                    regs.write(0x11, byte);
                    regs.write_u16(0x13, target);
                    drop(regs);
                    inner.pos = next;
                    false
                }
            }
        };
        if done {
            engine.regs().write(0x16, 0x00); // fall into the halt branch
            self.finish(engine, -1);
        }
    }

    fn advance_read(&self, engine: &BusEngine, byte: u8) {
        let done = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pos < inner.end {
                let mut regs = engine.regs();
                let addr = regs.read_u16(0x11);
                regs.write_u16(0x11, addr.wrapping_add(1));
                drop(regs);
                let pos = inner.pos as usize;
                inner.buffer[pos] = byte;
                inner.pos += 1;
                inner.pos == inner.end
            } else {
                false
            }
        };
        if done {
            engine.regs().write(0x17, 0xFE); // BRA self-loop
            self.finish(engine, -1);
        }
    }

    fn advance_verify(&self, engine: &BusEngine, byte: u8) {
        let (done, mismatch) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pos >= inner.end {
                return;
            }
            let mut regs = engine.regs();
            let addr = regs.read_u16(0x11);
            regs.write_u16(0x11, addr.wrapping_add(1));
            drop(regs);
            let mismatch = if inner.buffer[inner.pos as usize] != byte {
                Some(inner.base_addr.wrapping_add(inner.pos as u16))
            } else {
                None
            };
            inner.pos += 1;
            (inner.pos == inner.end, mismatch)
        };
        if done {
            engine.regs().write(0x17, 0xFE);
            let result = mismatch.map(|a| a as i32).unwrap_or(-1);
            self.finish(engine, result);
        } else if let Some(addr) = mismatch {
            // first mismatch wins; keep running to let the CPU finish, but
            // latch the address now in case nothing overwrites it later.
            let mut inner = self.inner.lock().unwrap();
            if inner.result == -1 {
                inner.result = addr as i32;
            }
        }
    }

    /// Restore the saved reset vector, hold the final result, and force CPU
    /// reset (the action protocol always leaves the CPU held for the next
    /// command). Returns the completed buffer for read actions.
    fn finish(&self, engine: &BusEngine, result: i32) {
        let mut inner = self.inner.lock().unwrap();
        let mut regs = engine.regs();
        regs.write_u16(OFF_RESET_VEC, inner.saved_reset_vec);
        drop(regs);
        if inner.result == -1 || result != -1 {
            inner.result = result;
        }
        inner.state = State::Idle;
        inner.deadline = None;
    }

    /// Take ownership of the completed read buffer (only meaningful after a
    /// read action has gone idle with result -1).
    pub fn take_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().buffer)
    }

    /// Task-context tick: force the action to idle with a timeout result if
    /// the watchdog deadline has passed.
    pub fn check_watchdog(&self, engine: &BusEngine) -> bool {
        let expired = {
            let inner = self.inner.lock().unwrap();
            matches!(inner.deadline, Some(d) if Instant::now() >= d) && inner.state != State::Idle
        };
        if expired {
            self.finish(engine, -2);
        }
        expired
    }
}

impl Default for ActionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp a transfer so `addr + clamped <= boundary`.
fn clamp_len(addr: u16, len: usize, boundary: u16) -> usize {
    let end = addr as u32 + len as u32;
    if end <= boundary as u32 {
        len
    } else if (addr as u32) >= boundary as u32 {
        0
    } else {
        (boundary as u32 - addr as u32) as usize
    }
}

fn write_write_routine(engine: &BusEngine, addr: u16, first_byte: u8) {
    let mut regs = engine.regs();
    let w = regs.as_mut_slice();
    w[OFF_ROUTINE] = 0xA9; // LDA #imm
    w[OFF_ROUTINE + 1] = first_byte;
    w[OFF_ROUTINE + 2] = 0x8D; // STA abs
    let [lo, hi] = addr.to_le_bytes();
    w[OFF_ROUTINE + 3] = lo;
    w[OFF_ROUTINE + 4] = hi;
    w[OFF_ROUTINE + 5] = 0x80; // BRA $FFF0
    w[OFF_ROUTINE + 6] = 0xF9; // rel -7
    w[OFF_ROUTINE + 7] = 0x80; // BRA $FFF7 (halt)
    w[OFF_ROUTINE + 8] = 0xFE; // rel -2
}

fn write_read_or_verify_routine(engine: &BusEngine, addr: u16, verify: bool) {
    let mut regs = engine.regs();
    let w = regs.as_mut_slice();
    w[OFF_ROUTINE] = 0xAD; // LDA abs
    let [lo, hi] = addr.to_le_bytes();
    w[OFF_ROUTINE + 1] = lo;
    w[OFF_ROUTINE + 2] = hi;
    w[OFF_ROUTINE + 3] = 0x8D; // STA abs (magic port)
    w[OFF_ROUTINE + 4] = if verify { 0xFC } else { 0xFD };
    w[OFF_ROUTINE + 5] = 0xFF;
    w[OFF_ROUTINE + 6] = 0x80; // BRA $FFF0
    w[OFF_ROUTINE + 7] = 0xF8; // rel -8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu6502::Cpu;

    fn drive_to_idle(engine: &BusEngine, action: &ActionController, cpu: &mut Cpu, rx: &std::sync::mpsc::Receiver<BusEvent>) {
        cpu.reset(engine);
        let mut guard = 0;
        while action.is_active() && guard < 100_000 {
            cpu.step(engine);
            while let Ok(ev) = rx.try_recv() {
                action.on_event(engine, ev);
            }
            guard += 1;
        }
        assert!(guard < 100_000, "action never completed");
    }

    #[test]
    fn write_then_read_round_trip() {
        let (engine, rx) = BusEngine::new();
        let action = ActionController::new();
        let mut cpu = Cpu::new();

        action
            .start_write(&engine, 0x0200, &[0x11, 0x22, 0x33], 1_000, 1_000)
            .unwrap();
        drive_to_idle(&engine, &action, &mut cpu, &rx);
        assert_eq!(action.result(), -1);

        action.start_read(&engine, 0x0200, 3, 1_000).unwrap();
        drive_to_idle(&engine, &action, &mut cpu, &rx);
        assert_eq!(action.result(), -1);
        assert_eq!(action.take_buffer(), vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn read_wholly_inside_forbidden_region_yields_zero_padded_buffer() {
        let (engine, _rx) = BusEngine::new();
        let action = ActionController::new();

        action.start_read(&engine, 0xFFF2, 4, 1_000).unwrap();
        assert!(!action.is_active());
        assert_eq!(action.result(), -1);
        assert_eq!(action.take_buffer(), vec![0u8; 4]);
    }

    #[test]
    fn verify_mismatch_reports_address() {
        let (engine, rx) = BusEngine::new();
        let action = ActionController::new();
        let mut cpu = Cpu::new();

        action
            .start_write(&engine, 0x0200, &[0x11, 0x22, 0x33], 1_000, 1_000)
            .unwrap();
        drive_to_idle(&engine, &action, &mut cpu, &rx);

        action
            .start_verify(&engine, 0x0200, &[0x11, 0x23, 0x33], 1_000)
            .unwrap();
        drive_to_idle(&engine, &action, &mut cpu, &rx);
        assert_eq!(action.result(), 0x0201);
    }

    #[test]
    fn slow_clock_write_uses_warm_up_iterations() {
        let (engine, rx) = BusEngine::new();
        let action = ActionController::new();
        let mut cpu = Cpu::new();

        action
            .start_write(&engine, 0x1000, &[0xAA, 0xBB, 0xCC, 0xDD], 500_000, 2)
            .unwrap();
        drive_to_idle(&engine, &action, &mut cpu, &rx);
        assert_eq!(action.result(), -1);

        action.start_read(&engine, 0x1000, 4, 1_000).unwrap();
        drive_to_idle(&engine, &action, &mut cpu, &rx);
        assert_eq!(action.take_buffer(), vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn second_action_while_active_is_rejected() {
        let (engine, _rx) = BusEngine::new();
        let action = ActionController::new();
        action.start_write(&engine, 0x0200, &[0x01], 1_000, 1_000).unwrap();
        assert!(action.is_active());
        let err = action.start_write(&engine, 0x0300, &[0x02], 1_000, 1_000);
        assert_eq!(err, Err(ProtocolError::ActionBusy));
    }

    #[test]
    fn watchdog_times_out_when_cpu_never_responds() {
        let (engine, _rx) = BusEngine::new();
        let action = ActionController::new();
        // reset_us = 0 microseconds + the 250ms floor; sleep past it without
        // ever driving the CPU, simulating a CPU wired not to respond.
        action.start_write(&engine, 0x0200, &[0x00], 0, 1_000).unwrap();
        std::thread::sleep(Duration::from_millis(260));
        assert!(action.check_watchdog(&engine));
        assert_eq!(action.result(), -2);
        assert!(!action.is_active());
    }

    #[test]
    fn write_crossing_forbidden_region_clamps_length() {
        // $FFF0 is the routine boundary; a transfer reaching past it is
        // clamped so the preceding bytes in plain RAM still land.
        let (engine, rx) = BusEngine::new();
        let action = ActionController::new();
        let mut cpu = Cpu::new();
        let data = vec![0xAB; 24];
        action.start_write(&engine, 0xFFDC, &data, 1_000, 1_000).unwrap();
        drive_to_idle(&engine, &action, &mut cpu, &rx);
        assert_eq!(action.result(), -1);
        assert_eq!(engine.cpu_ram_read(0xFFDC), 0xAB);
        assert_eq!(engine.cpu_ram_read(0xFFDF), 0xAB);
        // $FFDC..$FFF0 is 20 bytes; the remaining 4 were clamped away rather
        // than overwriting the synthesized routine.
        assert_eq!(clamp_len(0xFFDC, 24, FORBIDDEN_ADDR), 20);
    }

    #[test]
    fn clamp_len_stops_exactly_at_the_boundary() {
        assert_eq!(clamp_len(0xFFE0, 16, 0xFFF0), 16);
        assert_eq!(clamp_len(0xFFE8, 16, 0xFFF0), 8);
        assert_eq!(clamp_len(0xFFF0, 1, 0xFFF0), 0);
        assert_eq!(clamp_len(0x0200, 10, 0xFFF0), 10);
    }

    #[test]
    fn verify_forbidden_tail_is_meta_checked_without_running_cpu() {
        let (engine, _rx) = BusEngine::new();
        let action = ActionController::new();
        engine.regs().write(0x1A, 0x42); // byte at $FFFA
        action.start_verify(&engine, 0xFFFA, &[0x00], 1_000).unwrap();
        assert!(!action.is_active());
        assert_eq!(action.result(), 0xFFFA);
    }
}
