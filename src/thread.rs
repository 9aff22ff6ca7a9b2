//! A traced thread (spec.md §3 "Thread"): owns its register views and the
//! transient bookkeeping the status handler needs between stops.

use crate::arch::ArchPlatform;
use crate::breakpoint::HwBreakpointManager;
use crate::error::EngineResult;
use crate::ptrace_ops::PtraceOps;
use crate::registers::vector::{Ymm, Zmm};
use crate::registers::{FpRegisterFile, GenericRegs, RegisterFile};
use nix::unistd::Pid;

/// One traced OS thread. Created on attach or on a clone-event, destroyed on
/// exit (spec.md §3).
pub struct Thread {
    pub tid: Pid,
    /// The tracee (thread-group leader) this thread belongs to, for
    /// `HookStateWhileRunning` context and log messages.
    pub owner_pid: Pid,
    pub arch_platform: ArchPlatform,
    pub registers: RegisterFile,
    pub fp_registers: Option<FpRegisterFile>,
    pub hw_manager: HwBreakpointManager,
    /// Pending signal this thread stopped with, awaiting delivery or
    /// suppression by the status handler (spec.md §3, §4.4).
    pub signal_number: Option<i32>,
    /// False until `fetch_regs` has been called at least once. Distinguishes
    /// the startup trap (before any register holder has real data) from a
    /// genuine breakpoint hit (spec.md §4.4b).
    pub registers_fetched: bool,
}

impl Thread {
    pub fn new(tid: Pid, owner_pid: Pid, arch_platform: ArchPlatform) -> EngineResult<Thread> {
        Ok(Thread {
            tid,
            owner_pid,
            arch_platform,
            registers: RegisterFile::new_for(arch_platform),
            fp_registers: None,
            hw_manager: HwBreakpointManager::new_for(arch_platform)?,
            signal_number: None,
            registers_fetched: false,
        })
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.registers.instruction_pointer()
    }

    pub fn set_instruction_pointer(&mut self, value: u64) {
        self.registers.set_instruction_pointer(value);
    }

    pub fn syscall_number(&self) -> i64 {
        self.registers.syscall_number()
    }

    pub fn syscall_arg(&self, index: u8) -> u64 {
        self.registers.syscall_arg(index)
    }

    pub fn syscall_return(&self) -> u64 {
        self.registers.syscall_return()
    }

    /// Refreshes `registers` from the tracee. Called by the control loop
    /// after every stop (spec.md §4.1 `wait_all_and_update_regs`).
    pub fn fetch_regs<P: PtraceOps>(&mut self, ptrace: &P) -> EngineResult<()> {
        self.registers = ptrace.get_regs(self.tid, self.arch_platform)?;
        self.registers_fetched = true;
        Ok(())
    }

    pub fn flush_regs<P: PtraceOps>(&mut self, ptrace: &P) -> EngineResult<()> {
        ptrace.set_regs(self.tid, &self.registers)
    }

    /// Reads the XSAVE area fresh from the tracee. Per spec.md §5, this must
    /// happen before every vector-register read — never reused across a
    /// resume.
    pub fn fetch_fp<P: PtraceOps>(&mut self, ptrace: &P) -> EngineResult<()> {
        self.fp_registers = Some(ptrace.get_fp_registers(self.tid, self.arch_platform)?);
        Ok(())
    }

    pub fn flush_fp<P: PtraceOps>(&mut self, ptrace: &P) -> EngineResult<()> {
        if let Some(fp) = &self.fp_registers {
            ptrace.set_fp_registers(self.tid, fp)?;
        }
        Ok(())
    }

    pub fn ymm<P: PtraceOps>(&mut self, ptrace: &P, i: u8) -> EngineResult<Ymm> {
        self.fetch_fp(ptrace)?;
        self.fp_registers.as_ref().unwrap().ymm(i)
    }

    pub fn set_ymm<P: PtraceOps>(&mut self, ptrace: &P, i: u8, value: Ymm) -> EngineResult<()> {
        self.fetch_fp(ptrace)?;
        self.fp_registers.as_mut().unwrap().set_ymm(i, value)?;
        self.flush_fp(ptrace)
    }

    pub fn zmm<P: PtraceOps>(&mut self, ptrace: &P, i: u8) -> EngineResult<Zmm> {
        self.fetch_fp(ptrace)?;
        self.fp_registers.as_ref().unwrap().zmm(i)
    }

    pub fn set_zmm<P: PtraceOps>(&mut self, ptrace: &P, i: u8, value: Zmm) -> EngineResult<()> {
        self.fetch_fp(ptrace)?;
        self.fp_registers.as_mut().unwrap().set_zmm(i, value)?;
        self.flush_fp(ptrace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_has_no_pending_signal() {
        let t = Thread::new(Pid::from_raw(1234), Pid::from_raw(1234), ArchPlatform::Amd64OnX86_64).unwrap();
        assert_eq!(t.signal_number, None);
        assert!(t.fp_registers.is_none());
        assert_eq!(t.owner_pid, Pid::from_raw(1234));
    }
}
