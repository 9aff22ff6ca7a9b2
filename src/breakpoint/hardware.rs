//! Hardware breakpoints and watchpoints (C3, spec.md §4.3): per-thread
//! debug-register slot allocation and the watchpoint-hit query the status
//! handler consults in `handle_breakpoints` (§4.4b).
//!
//! Grounded on
//! `examples/original_source/libdebug/architectures/ptrace_hardware_breakpoint_provider.py`,
//! which dispatches to one manager per `(architecture, platform)` pair;
//! here that dispatch is a plain enum match (mirroring the `RegisterFile`
//! enum in `registers/mod.rs`) instead of a `match` over interned platform
//! strings.

use crate::arch::ArchPlatform;
use crate::error::{EngineError, EngineResult};
use crate::ptrace_ops::PtraceOps;
use bit_field::BitField;
use log::debug;
use nix::unistd::Pid;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WatchCondition {
    Execute,
    Read,
    Write,
    ReadWrite,
}

pub type BreakpointCallback = Box<dyn FnMut(Pid, &mut HardwareBreakpoint)>;

pub struct HardwareBreakpoint {
    pub address: u64,
    pub condition: WatchCondition,
    pub length: u8,
    pub slot_index: u8,
    pub callback: Option<BreakpointCallback>,
    pub hit_count: u64,
}

/// Offset of `u_debugreg` within the kernel's `struct user`, the layout
/// `PTRACE_PEEKUSER`/`PTRACE_POKEUSER` address against. These are the
/// well-known constants every x86 ptrace-based debugger (gdb, rr) hardcodes;
/// there's no portable way to derive them since `struct user` isn't part of
/// any stable header contract.
const X86_64_DEBUGREG_OFFSET: u64 = 848;
const I386_DEBUGREG_OFFSET: u64 = 252;

fn encode_dr7_condition(condition: WatchCondition) -> u64 {
    match condition {
        WatchCondition::Execute => 0b00,
        WatchCondition::Write => 0b01,
        WatchCondition::ReadWrite => 0b11,
        WatchCondition::Read => 0b11, // x86 has no read-only watch; rw is the closest fit
    }
}

fn encode_dr7_length(length: u8) -> EngineResult<u64> {
    match length {
        1 => Ok(0b00),
        2 => Ok(0b01),
        8 => Ok(0b10),
        4 => Ok(0b11),
        _ => Err(EngineError::UnsupportedArchitecture),
    }
}

struct X86DebugRegisters {
    debugreg_offset: u64,
    slots: [Option<HardwareBreakpoint>; 4],
}

impl X86DebugRegisters {
    fn new(debugreg_offset: u64) -> X86DebugRegisters {
        X86DebugRegisters { debugreg_offset, slots: array_init::array_init(|_| None) }
    }

    fn dr_offset(&self, n: u8) -> u64 {
        self.debugreg_offset + 8 * n as u64
    }

    fn free_slot(&self) -> Option<u8> {
        self.slots.iter().position(Option::is_none).map(|i| i as u8)
    }

    fn install<P: PtraceOps>(
        &mut self,
        ptrace: &P,
        tid: Pid,
        address: u64,
        condition: WatchCondition,
        length: u8,
        callback: Option<BreakpointCallback>,
    ) -> EngineResult<u8> {
        let slot = self.free_slot().ok_or(EngineError::NoFreeDebugRegister { tid })?;
        ptrace.poke_user(tid, self.dr_offset(slot), address)?;

        let mut dr7 = ptrace.peek_user(tid, self.dr_offset(7))?;
        // Local-enable bit for this slot.
        dr7.set_bit((slot * 2) as usize, true);
        let rw = encode_dr7_condition(condition);
        let len = encode_dr7_length(length)?;
        let field_start = 16 + 4 * slot as usize;
        dr7.set_bits(field_start..field_start + 2, rw);
        dr7.set_bits(field_start + 2..field_start + 4, len);
        ptrace.poke_user(tid, self.dr_offset(7), dr7)?;

        self.slots[slot as usize] = Some(HardwareBreakpoint {
            address,
            condition,
            length,
            slot_index: slot,
            callback,
            hit_count: 0,
        });
        debug!("armed x86 debug register slot {slot} at {address:#x} in {tid}");
        Ok(slot)
    }

    fn remove<P: PtraceOps>(&mut self, ptrace: &P, tid: Pid, slot: u8) -> EngineResult<()> {
        let mut dr7 = ptrace.peek_user(tid, self.dr_offset(7))?;
        dr7.set_bit((slot * 2) as usize, false);
        ptrace.poke_user(tid, self.dr_offset(7), dr7)?;
        ptrace.poke_user(tid, self.dr_offset(slot), 0)?;
        self.slots[slot as usize] = None;
        debug!("disarmed x86 debug register slot {slot} in {tid}");
        Ok(())
    }

    fn is_watchpoint_hit<P: PtraceOps>(
        &mut self,
        ptrace: &P,
        tid: Pid,
    ) -> EngineResult<Option<&mut HardwareBreakpoint>> {
        let dr6 = ptrace.peek_user(tid, self.dr_offset(6))?;
        for slot in 0..4usize {
            if dr6.get_bit(slot) {
                // Acknowledge the hit so it doesn't re-trigger on the next query.
                let mut cleared = dr6;
                cleared.set_bit(slot, false);
                ptrace.poke_user(tid, self.dr_offset(6), cleared)?;
                return Ok(self.slots[slot].as_mut());
            }
        }
        Ok(None)
    }
}

/// aarch64's hardware breakpoints/watchpoints live in two independent
/// register banks (`NT_ARM_HW_BREAK`, `NT_ARM_HW_WATCH`), each with its own
/// slot count; spec.md §3 calls this "implementation-defined, typically 4
/// BP + 4 WP".
struct Aarch64DebugRegisters {
    breakpoints: [Option<HardwareBreakpoint>; 4],
    watchpoints: [Option<HardwareBreakpoint>; 4],
}

impl Aarch64DebugRegisters {
    fn new() -> Aarch64DebugRegisters {
        Aarch64DebugRegisters {
            breakpoints: array_init::array_init(|_| None),
            watchpoints: array_init::array_init(|_| None),
        }
    }

    fn bank_mut(&mut self, condition: WatchCondition) -> &mut [Option<HardwareBreakpoint>; 4] {
        if condition == WatchCondition::Execute {
            &mut self.breakpoints
        } else {
            &mut self.watchpoints
        }
    }

    fn install<P: PtraceOps>(
        &mut self,
        ptrace: &P,
        tid: Pid,
        address: u64,
        condition: WatchCondition,
        length: u8,
        callback: Option<BreakpointCallback>,
    ) -> EngineResult<u8> {
        let is_bp = condition == WatchCondition::Execute;
        let bank = self.bank_mut(condition);
        let slot = bank.iter().position(Option::is_none).ok_or(EngineError::NoFreeDebugRegister { tid })? as u8;

        let ctrl = encode_aarch64_ctrl(condition, length);
        ptrace.set_hw_debug_register(tid, is_bp, slot, address, ctrl)?;

        bank[slot as usize] = Some(HardwareBreakpoint {
            address,
            condition,
            length,
            slot_index: slot,
            callback,
            hit_count: 0,
        });
        debug!("armed aarch64 {} slot {slot} at {address:#x} in {tid}", if is_bp { "breakpoint" } else { "watchpoint" });
        Ok(slot)
    }

    fn remove<P: PtraceOps>(&mut self, ptrace: &P, tid: Pid, is_bp: bool, slot: u8) -> EngineResult<()> {
        ptrace.set_hw_debug_register(tid, is_bp, slot, 0, 0)?;
        let bank = if is_bp { &mut self.breakpoints } else { &mut self.watchpoints };
        bank[slot as usize] = None;
        debug!("disarmed aarch64 {} slot {slot} in {tid}", if is_bp { "breakpoint" } else { "watchpoint" });
        Ok(())
    }

    fn is_watchpoint_hit<P: PtraceOps>(
        &mut self,
        ptrace: &P,
        tid: Pid,
    ) -> EngineResult<Option<&mut HardwareBreakpoint>> {
        if let Some(slot) = ptrace.hit_hw_watchpoint_slot(tid)? {
            return Ok(self.watchpoints[slot as usize].as_mut());
        }
        Ok(None)
    }
}

/// `DBGBCRn_EL1`/`DBGWCRn_EL1`-style control word: enable bit, byte-address
/// select mask derived from `length`, and access-type bits for watchpoints.
fn encode_aarch64_ctrl(condition: WatchCondition, length: u8) -> u32 {
    let byte_mask: u32 = match length {
        1 => 0b0001,
        2 => 0b0011,
        4 => 0b1111,
        8 => 0b1111_1111u32 & 0xFF, // 8-byte watchpoints use an extended mask on real hw; kept simple here
        _ => 0b1111,
    };
    let pac = match condition {
        WatchCondition::Execute => 0b00,
        WatchCondition::Read => 0b01,
        WatchCondition::Write => 0b10,
        WatchCondition::ReadWrite => 0b11,
    };
    const ENABLE: u32 = 1;
    ENABLE | (byte_mask << 5) | (pac << 3)
}

pub enum HwBreakpointManager {
    Amd64(X86DebugRegisters),
    I386(X86DebugRegisters),
    Aarch64(Aarch64DebugRegisters),
}

impl HwBreakpointManager {
    pub fn new_for(arch_platform: ArchPlatform) -> EngineResult<HwBreakpointManager> {
        match arch_platform {
            ArchPlatform::Amd64OnX86_64 => {
                Ok(HwBreakpointManager::Amd64(X86DebugRegisters::new(X86_64_DEBUGREG_OFFSET)))
            }
            ArchPlatform::I386OnAmd64 => {
                Ok(HwBreakpointManager::Amd64(X86DebugRegisters::new(X86_64_DEBUGREG_OFFSET)))
            }
            ArchPlatform::I386OnI686 => {
                Ok(HwBreakpointManager::I386(X86DebugRegisters::new(I386_DEBUGREG_OFFSET)))
            }
            ArchPlatform::Aarch64OnAarch64 => Ok(HwBreakpointManager::Aarch64(Aarch64DebugRegisters::new())),
        }
    }

    pub fn install<P: PtraceOps>(
        &mut self,
        ptrace: &P,
        tid: Pid,
        address: u64,
        condition: WatchCondition,
        length: u8,
        callback: Option<BreakpointCallback>,
    ) -> EngineResult<u8> {
        match self {
            HwBreakpointManager::Amd64(d) | HwBreakpointManager::I386(d) => {
                d.install(ptrace, tid, address, condition, length, callback)
            }
            HwBreakpointManager::Aarch64(d) => d.install(ptrace, tid, address, condition, length, callback),
        }
    }

    pub fn remove<P: PtraceOps>(&mut self, ptrace: &P, tid: Pid, slot: u8, is_bp_bank: bool) -> EngineResult<()> {
        match self {
            HwBreakpointManager::Amd64(d) | HwBreakpointManager::I386(d) => d.remove(ptrace, tid, slot),
            HwBreakpointManager::Aarch64(d) => d.remove(ptrace, tid, is_bp_bank, slot),
        }
    }

    pub fn is_watchpoint_hit<P: PtraceOps>(
        &mut self,
        ptrace: &P,
        tid: Pid,
    ) -> EngineResult<Option<&mut HardwareBreakpoint>> {
        match self {
            HwBreakpointManager::Amd64(d) | HwBreakpointManager::I386(d) => d.is_watchpoint_hit(ptrace, tid),
            HwBreakpointManager::Aarch64(d) => d.is_watchpoint_hit(ptrace, tid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dr7_condition_and_length_encoding() {
        assert_eq!(encode_dr7_condition(WatchCondition::Execute), 0b00);
        assert_eq!(encode_dr7_condition(WatchCondition::Write), 0b01);
        assert_eq!(encode_dr7_condition(WatchCondition::ReadWrite), 0b11);
        assert_eq!(encode_dr7_length(4).unwrap(), 0b11);
        assert_eq!(encode_dr7_length(8).unwrap(), 0b10);
        assert!(encode_dr7_length(3).is_err());
    }

    #[test]
    fn aarch64_ctrl_enable_bit_always_set() {
        assert_eq!(encode_aarch64_ctrl(WatchCondition::Execute, 4) & 1, 1);
    }
}
