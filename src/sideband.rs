//! Sideband Link — a unidirectional FIFO of 32-bit messages to the companion
//! display/sound processor.
//!
//! Wire format: `1ddd cccc ssss ssss pppp pppp pppp pppp`, top bit always
//! set so the all-ones idle-insert pattern (reserved for the transmitter's
//! bus-idle filler) can never be confused with a real message.

use std::collections::VecDeque;
use std::sync::Mutex;

/// FIFO depth modeled after the hardware's 8-entry queue.
pub const FIFO_DEPTH: usize = 8;
/// Producers that cannot block back off once the FIFO is this full.
pub const READY_THRESHOLD: usize = 6;

/// Routing tag for the "xram" cursor-write producer (device id 0).
pub const DEVICE_XRAM: u8 = 0;

/// A single sideband message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message(u32);

impl Message {
    /// Build a message from its fields. `device` is 3 bits, `channel` 4
    /// bits; both are masked silently.
    pub fn new(device: u8, channel: u8, selector: u8, payload: u16) -> Self {
        let word = (1u32 << 31)
            | (((device & 0x7) as u32) << 28)
            | (((channel & 0xF) as u32) << 24)
            | ((selector as u32) << 16)
            | (payload as u32);
        Self(word)
    }

    /// The xram cursor-write producer's message shape: device 0, channel 0,
    /// the written byte as selector, the written address as payload.
    pub fn xram(address: u16, data: u8) -> Self {
        Self::new(DEVICE_XRAM, 0, data, address)
    }

    /// Raw wire word.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn device(self) -> u8 {
        ((self.0 >> 28) & 0x7) as u8
    }

    pub fn channel(self) -> u8 {
        ((self.0 >> 24) & 0xF) as u8
    }

    pub fn selector(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    pub fn payload(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// The bus-idle filler the transmitter inserts when the FIFO drains: all
/// four top bits set, distinguishing it from any real message (top bit of a
/// real message is always 1 but the next three device bits are never all 1
/// together with every device bit set here).
pub const IDLE_PATTERN: u32 = 0xF000_0000;

/// FIFO producer/consumer. `try_send` never blocks; `send_blocking` is for
/// the low-rate configuration path that is allowed to wait for space.
pub struct SidebandLink {
    queue: Mutex<VecDeque<Message>>,
}

impl SidebandLink {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(FIFO_DEPTH)),
        }
    }

    /// True while there is headroom for a non-blocking producer.
    pub fn ready(&self) -> bool {
        self.queue.lock().unwrap().len() < READY_THRESHOLD
    }

    /// Enqueue without blocking. Returns `false` and drops the message if
    /// the FIFO is full — acceptable because the downstream
    /// companion keeps its own shadow state.
    pub fn try_send(&self, msg: Message) -> bool {
        let mut q = self.queue.lock().unwrap();
        if q.len() >= FIFO_DEPTH {
            return false;
        }
        q.push_back(msg);
        true
    }

    /// Enqueue, spinning briefly if the FIFO is momentarily full. Intended
    /// only for low-rate configuration messages (e.g. the VGA-mode fan-out),
    /// never for the per-cycle xram producer.
    pub fn send_blocking(&self, msg: Message) {
        loop {
            if self.try_send(msg) {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Dequeue the oldest message, if any.
    pub fn try_recv(&self) -> Option<Message> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SidebandLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xram_message_round_trips_fields() {
        let msg = Message::xram(0x1234, 0x56);
        assert_eq!(msg.device(), DEVICE_XRAM);
        assert_eq!(msg.channel(), 0);
        assert_eq!(msg.selector(), 0x56);
        assert_eq!(msg.payload(), 0x1234);
        assert_ne!(msg.as_u32() & IDLE_PATTERN, IDLE_PATTERN);
    }

    #[test]
    fn fifo_is_order_preserving() {
        let link = SidebandLink::new();
        for i in 0..5u8 {
            assert!(link.try_send(Message::xram(i as u16, i)));
        }
        for i in 0..5u8 {
            assert_eq!(link.try_recv().unwrap().selector(), i);
        }
        assert!(link.try_recv().is_none());
    }

    #[test]
    fn ready_goes_false_before_full() {
        let link = SidebandLink::new();
        for _ in 0..READY_THRESHOLD {
            assert!(link.ready());
            link.try_send(Message::xram(0, 0));
        }
        assert!(!link.ready());
    }

    #[test]
    fn try_send_drops_when_full() {
        let link = SidebandLink::new();
        for _ in 0..FIFO_DEPTH {
            assert!(link.try_send(Message::xram(0, 0)));
        }
        assert!(!link.try_send(Message::xram(0, 0)));
        assert_eq!(link.len(), FIFO_DEPTH);
    }

    #[test]
    fn device_and_channel_are_masked() {
        let msg = Message::new(0xFF, 0xFF, 0xAB, 0x1234);
        assert_eq!(msg.device(), 0x7);
        assert_eq!(msg.channel(), 0xF);
    }
}
