//! Clock & Reset Controller — PHI2 frequency quantization and the RESB
//! reset-timing protocol.
//!
//! The real firmware reprograms three PIO clock dividers off one system clock;
//! this model keeps the one number that matters to callers — the divider
//! math that determines the *actual* quantized frequency — and leaves the
//! PIO-specific rebuild to the engine that owns the downstream state
//! machines.

use crate::error::ProtocolError;

/// Lower bound of the supported PHI2 range.
pub const MIN_PHI2_KHZ: u32 = 100;
/// Upper bound of the supported PHI2 range.
pub const MAX_PHI2_KHZ: u32 = 8000;
/// Reference system clock the PHI2 divider is derived from, matching the
/// RP2040 default the original firmware assumes.
pub const SYS_CLOCK_KHZ: u32 = 150_000;

/// Additional watchdog allowance layered onto the computed reset time;
/// owned by the Action Controller, but the constant lives here since it is
/// part of the reset-timing contract.
pub const WATCHDOG_EXTRA_US: u64 = 250_000;

/// Quantize a requested frequency to the nearest one the integer PHI2
/// divider can actually produce.
fn quantize(freq_khz: u32) -> u32 {
    let divider = ((SYS_CLOCK_KHZ as f64 / freq_khz as f64).round() as u32).max(1);
    SYS_CLOCK_KHZ / divider
}

/// The Clock & Reset Controller.
#[derive(Debug, Clone, Copy)]
pub struct ClockController {
    phi2_khz: u32,
    reset_ms: u8,
}

impl ClockController {
    /// Starts at the maximum supported rate, as the firmware does on a
    /// cold boot before any `SET PHI2` command.
    pub fn new() -> Self {
        Self {
            phi2_khz: quantize(MAX_PHI2_KHZ),
            reset_ms: 0,
        }
    }

    /// Current actual (quantized) PHI2 frequency in kHz.
    pub fn phi2_khz(&self) -> u32 {
        self.phi2_khz
    }

    /// Configured `reset_ms` (0 = auto-compute).
    pub fn reset_ms(&self) -> u8 {
        self.reset_ms
    }

    /// Quantize and apply a new PHI2 frequency. Returns the actual
    /// frequency plus whether it differs from the previous one — callers
    /// (the engine) must tear down and rebuild the downstream state
    /// machines only when `changed` is true.
    pub fn set_phi2_khz(&mut self, freq_khz: u32) -> Result<(u32, bool), ProtocolError> {
        if !(MIN_PHI2_KHZ..=MAX_PHI2_KHZ).contains(&freq_khz) {
            return Err(ProtocolError::UnsupportedFrequency(freq_khz));
        }
        let actual = quantize(freq_khz);
        let changed = actual != self.phi2_khz;
        self.phi2_khz = actual;
        Ok((actual, changed))
    }

    pub fn set_reset_ms(&mut self, ms: u8) {
        self.reset_ms = ms;
    }

    /// Microseconds RESB must stay low: `max(reset_ms, auto_min)`, where
    /// `auto_min` guarantees at least two complete PHI2 cycles.
    pub fn reset_us(&self) -> u64 {
        let auto_min = 2_000_u64.div_ceil(self.phi2_khz as u64);
        let manual = self.reset_ms as u64 * 1_000;
        manual.max(auto_min)
    }
}

impl Default for ClockController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_starts_at_max_rate() {
        let clk = ClockController::new();
        assert_eq!(clk.phi2_khz(), quantize(MAX_PHI2_KHZ));
    }

    #[test]
    fn quantized_frequency_is_within_bound() {
        let mut clk = ClockController::new();
        for target in [100, 1000, 3579, 8000] {
            let (actual, _) = clk.set_phi2_khz(target).unwrap();
            let err = (actual as f64 - target as f64).abs() / target as f64;
            assert!(err < 0.1, "target {target} actual {actual} err {err}");
        }
    }

    #[test]
    fn out_of_range_frequency_is_rejected() {
        let mut clk = ClockController::new();
        assert_eq!(
            clk.set_phi2_khz(99),
            Err(ProtocolError::UnsupportedFrequency(99))
        );
        assert_eq!(
            clk.set_phi2_khz(8001),
            Err(ProtocolError::UnsupportedFrequency(8001))
        );
    }

    #[test]
    fn repeated_set_is_idempotent_and_reports_no_change_on_second_call() {
        let mut clk = ClockController::new();
        let (first, changed1) = clk.set_phi2_khz(1234).unwrap();
        assert!(changed1);
        let (second, changed2) = clk.set_phi2_khz(1234).unwrap();
        assert_eq!(first, second);
        assert!(!changed2);
    }

    #[test]
    fn reset_us_grows_with_manual_reset_ms() {
        let mut clk = ClockController::new();
        clk.set_phi2_khz(1000).unwrap();
        let auto = clk.reset_us();
        clk.set_reset_ms(50);
        assert_eq!(clk.reset_us(), 50_000);
        assert!(50_000 > auto);
    }

    #[test]
    fn reset_us_covers_two_cycles_at_slowest_rate() {
        let mut clk = ClockController::new();
        clk.set_phi2_khz(MIN_PHI2_KHZ).unwrap();
        // two cycles at 100 kHz = 20 microseconds, exactly
        assert_eq!(clk.reset_us(), 20);
    }
}
