//! Local demo: brings up an `Engine`, drives the in-process 6502 model
//! against it, and walks through a write/read/verify cycle plus an XRAM
//! cursor write, printing the observed state at each step.
//!
//! Usage: cargo run --example boot_demo

use std::time::Duration;

use ria_core::cpu6502::{Bus, Cpu};
use ria_core::{Engine, EngineConfig};

fn drive_until_idle(engine: &Engine, cpu: &mut Cpu) {
    cpu.reset(engine.bus());
    while engine.is_action_active() {
        cpu.step(engine.bus());
        std::thread::sleep(Duration::from_micros(200));
    }
}

fn main() {
    env_logger::init();

    let engine = Engine::new(EngineConfig::new().with_phi2_khz(1000));
    let mut cpu = Cpu::new();
    println!("engine up at {} kHz", engine.phi2_khz());

    engine.write(0x2000, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    drive_until_idle(&engine, &mut cpu);
    println!("write result: {}", engine.action_result());

    engine.read(0x2000, 4).unwrap();
    drive_until_idle(&engine, &mut cpu);
    println!("read result: {} buffer: {:02X?}", engine.action_result(), engine.take_read_buffer());

    engine.verify(0x2000, &[0xDE, 0xAD, 0xBE, 0xEE]).unwrap();
    drive_until_idle(&engine, &mut cpu);
    println!("verify result (expect mismatch address): {:#06x}", engine.action_result());

    let addr_base = 0xFFE0 + ria_core::regs::OFF_XRAM_ADDR0 as u16;
    let step_addr = 0xFFE0 + ria_core::regs::OFF_XRAM_STEP0 as u16;
    let mirror_addr = 0xFFE0 + ria_core::regs::OFF_XRAM_RW0 as u16;
    engine.bus().cpu_write(addr_base, 0x00);
    engine.bus().cpu_write(addr_base + 1, 0x30);
    engine.bus().cpu_write(step_addr, 1);
    engine.bus().cpu_write(mirror_addr, 0x42);
    let msg = engine.bus().sideband().try_recv().unwrap();
    println!(
        "xram cursor write queued sideband message: device={} addr={:#06x} data={:#04x}",
        msg.device(),
        msg.payload(),
        msg.selector()
    );

    engine.stop();
    println!("cpu running after stop: {}", engine.is_cpu_running());
}
