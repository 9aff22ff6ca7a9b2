//! The debugging session facade: ties the ptrace capability (C1), the
//! breakpoint engine (C3), the status handler (C4) and the hook executor
//! (C5) into the control loop described in spec.md §2.
//!
//! The orchestration operations spec.md §4.1 lists alongside the raw
//! syscalls (`cont_all_and_set_bps`, `wait_all_and_update_regs`,
//! `register_thread`, `unregister_thread`, `step_until`) live here rather
//! than on `PtraceOps`, since they need the breakpoint/thread/hook tables
//! `PtraceOps` itself has no notion of — see DESIGN.md.

use crate::arch::ArchPlatform;
use crate::breakpoint::{software, SoftwareBreakpoint};
use crate::error::EngineResult;
use crate::ptrace_ops::PtraceOps;
use crate::status_handler::StatusHandler;
use crate::tracee::{Resume, Tracee};
use log::debug;
use nix::unistd::Pid;

pub struct DebugSession<P: PtraceOps> {
    ptrace: P,
    pub tracee: Tracee,
    status_handler: StatusHandler,
}

impl<P: PtraceOps> DebugSession<P> {
    /// Attaches to `pid`, sets the standard tracing options, and registers
    /// the initial thread.
    pub fn attach(ptrace: P, pid: Pid, arch_platform: ArchPlatform) -> EngineResult<DebugSession<P>> {
        ptrace.attach(pid)?;
        ptrace.set_options(pid)?;
        let mut tracee = Tracee::new(pid, arch_platform);
        tracee.register_thread(pid)?;
        if let Some(thread) = tracee.threads.get_mut(&pid) {
            thread.fetch_regs(&ptrace)?;
        }
        Ok(DebugSession { ptrace, tracee, status_handler: StatusHandler::new() })
    }

    pub fn detach(&self) -> EngineResult<()> {
        debug!("detaching from {}", self.tracee.pid);
        self.ptrace.detach_all(self.tracee.pid)
    }

    pub fn install_software_breakpoint(&mut self, address: u64) -> EngineResult<()> {
        let bp = SoftwareBreakpoint::install(&self.ptrace, self.tracee.pid, address, self.tracee.arch_platform)?;
        self.tracee.software_breakpoints.insert(address, bp);
        Ok(())
    }

    pub fn register_thread(&mut self, tid: Pid) -> EngineResult<()> {
        self.tracee.register_thread(tid)
    }

    pub fn unregister_thread(&mut self, tid: Pid) {
        self.tracee.unregister_thread(tid)
    }

    /// Single-steps every thread a breakpoint hit left linked to it past the
    /// now-disabled trap word, then rearms that breakpoint. Run ahead of
    /// every resume so a software breakpoint's original byte is never left
    /// restored-but-unstepped (spec.md §4.3's restore -> single-step ->
    /// re-patch discipline).
    fn step_over_linked_breakpoints(&mut self) -> EngineResult<()> {
        let addrs: Vec<u64> = self
            .tracee
            .software_breakpoints
            .iter()
            .filter(|(_, bp)| !bp.linked_thread_ids.is_empty())
            .map(|(addr, _)| *addr)
            .collect();

        for addr in addrs {
            let tids = match self.tracee.software_breakpoints.get_mut(&addr) {
                Some(bp) => std::mem::take(&mut bp.linked_thread_ids),
                None => continue,
            };
            for tid in tids {
                if !self.tracee.threads.contains_key(&tid) {
                    continue;
                }
                self.ptrace.single_step(tid)?;
                let (stopped, _status) = self.ptrace.waitpid_raw(tid.as_raw())?;
                if let Some(thread) = self.tracee.threads.get_mut(&stopped) {
                    thread.fetch_regs(&self.ptrace)?;
                }
            }
            if let Some(bp) = self.tracee.software_breakpoints.get_mut(&addr) {
                bp.rearm(&self.ptrace, self.tracee.pid)?;
            }
        }
        Ok(())
    }

    /// Re-arms every enabled software breakpoint whose owning thread's IP
    /// isn't currently sitting on it, then resumes every thread (spec.md
    /// §4.1, §4.3).
    pub fn cont_all_and_set_bps(&mut self) -> EngineResult<()> {
        self.step_over_linked_breakpoints()?;

        let bp_size = software::breakpoint_size(self.tracee.arch_platform);
        let tids: Vec<Pid> = self.tracee.threads.keys().copied().collect();

        for tid in &tids {
            let ip = self.tracee.threads.get(tid).map(|t| t.instruction_pointer()).unwrap_or(0);
            for (addr, bp) in self.tracee.software_breakpoints.iter_mut() {
                if !bp.enabled {
                    continue;
                }
                if ip == *addr || ip == addr.wrapping_add(bp_size) {
                    // Owning thread's IP is on (or just past) this
                    // breakpoint but it wasn't linked for a step-over (e.g.
                    // a different thread's IP merely landed here): leave it
                    // unpatched this pass rather than trap the thread sitting
                    // on it.
                    continue;
                }
                bp.rearm(&self.ptrace, self.tracee.pid)?;
            }
        }

        self.tracee.running = true;
        for tid in &tids {
            let signal = self.tracee.threads.get_mut(tid).and_then(|t| t.signal_number.take());
            self.ptrace.cont(*tid, signal)?;
        }
        Ok(())
    }

    /// Blocks for the next wait-status, refreshes the stopped thread's GPR
    /// snapshot, and returns the batch observed. Dead threads are skipped
    /// rather than surfaced as errors (spec.md §4.1 "partial failures...
    /// tolerated").
    pub fn wait_all_and_update_regs(&mut self) -> EngineResult<Vec<(Pid, i32)>> {
        if self.tracee.threads.is_empty() {
            return Ok(Vec::new());
        }

        let (tid, status) = self.ptrace.waitpid_raw(-1)?;
        self.tracee.running = false;

        if let Some(thread) = self.tracee.threads.get_mut(&tid) {
            if thread.fetch_regs(&self.ptrace).is_err() {
                // The thread died between the wait and the regset query;
                // the status batch still reports its exit below.
            }
        }

        Ok(vec![(tid, status)])
    }

    /// The top-level continue operation (spec.md §2): arm, resume, wait,
    /// dispatch, repeat until the status handler says stop or the tracee is
    /// gone. Threads the status handler flagged for signal delivery
    /// (`thread.signal_number`) are carried through automatically: the next
    /// loop iteration's `cont_all_and_set_bps` reads and clears that field
    /// when it resumes each thread.
    pub fn continue_execution(&mut self) -> EngineResult<()> {
        loop {
            self.cont_all_and_set_bps()?;
            let batch = self.wait_all_and_update_regs()?;
            if batch.is_empty() {
                break;
            }

            self.status_handler.manage_change(&mut self.tracee, &self.ptrace, &batch)?;

            if self.tracee.resume_context.resume == Resume::NotResume {
                break;
            }
            if self.tracee.threads.is_empty() {
                break;
            }
        }
        Ok(())
    }

    pub fn single_step(&mut self, tid: Pid) -> EngineResult<()> {
        self.tracee.resume_context.is_a_step = true;
        self.tracee.running = true;
        self.ptrace.single_step(tid)?;
        let batch = self.wait_all_and_update_regs()?;
        if !batch.is_empty() {
            self.status_handler.manage_change(&mut self.tracee, &self.ptrace, &batch)?;
        }
        Ok(())
    }

    /// Single-steps `tid` until it reaches `addr` or `max_steps` is
    /// exhausted (spec.md §4.1 `step_until`).
    pub fn step_until(&mut self, tid: Pid, addr: u64, max_steps: u32) -> EngineResult<bool> {
        for _ in 0..max_steps {
            let ip = match self.tracee.threads.get(&tid) {
                Some(t) => t.instruction_pointer(),
                None => return Ok(false),
            };
            if ip == addr {
                return Ok(true);
            }
            self.single_step(tid)?;
        }
        Ok(self.tracee.threads.get(&tid).map(|t| t.instruction_pointer() == addr).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchPlatform;
    use crate::error::EngineError;
    use crate::registers::RegisterFile;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakePtrace {
        single_stepped: RefCell<Vec<Pid>>,
        poked: RefCell<Vec<(u64, u64)>>,
    }

    impl PtraceOps for FakePtrace {
        fn trace_me(&self) -> EngineResult<()> {
            Ok(())
        }
        fn attach(&self, _pid: Pid) -> EngineResult<()> {
            Ok(())
        }
        fn detach_all(&self, _pid: Pid) -> EngineResult<()> {
            Ok(())
        }
        fn detach_for_migration(&self, _pid: Pid) -> EngineResult<()> {
            Ok(())
        }
        fn reattach_from_gdb(&self, _pid: Pid) -> EngineResult<()> {
            Ok(())
        }
        fn set_options(&self, _pid: Pid) -> EngineResult<()> {
            Ok(())
        }
        fn peek_data(&self, _pid: Pid, _addr: u64) -> EngineResult<u64> {
            Ok(0)
        }
        fn poke_data(&self, _pid: Pid, addr: u64, data: u64) -> EngineResult<()> {
            self.poked.borrow_mut().push((addr, data));
            Ok(())
        }
        fn peek_user(&self, _pid: Pid, _offset: u64) -> EngineResult<u64> {
            Ok(0)
        }
        fn poke_user(&self, _pid: Pid, _offset: u64, _data: u64) -> EngineResult<()> {
            Ok(())
        }
        fn get_event_msg(&self, _pid: Pid) -> EngineResult<u64> {
            Ok(0)
        }
        fn get_regs(&self, _pid: Pid, arch_platform: ArchPlatform) -> EngineResult<RegisterFile> {
            Ok(RegisterFile::new_for(arch_platform))
        }
        fn set_regs(&self, _pid: Pid, _regs: &RegisterFile) -> EngineResult<()> {
            Ok(())
        }
        fn get_fp_registers(&self, _tid: Pid, _arch_platform: ArchPlatform) -> EngineResult<crate::registers::FpRegisterFile> {
            Err(EngineError::UnsupportedArchitecture)
        }
        fn set_fp_registers(&self, _tid: Pid, _fp: &crate::registers::FpRegisterFile) -> EngineResult<()> {
            Ok(())
        }
        fn single_step(&self, tid: Pid) -> EngineResult<()> {
            self.single_stepped.borrow_mut().push(tid);
            Ok(())
        }
        fn cont(&self, _tid: Pid, _signal: Option<i32>) -> EngineResult<()> {
            Ok(())
        }
        fn set_hw_debug_register(&self, _tid: Pid, _is_bp: bool, _slot: u8, _address: u64, _ctrl: u32) -> EngineResult<()> {
            Ok(())
        }
        fn hit_hw_watchpoint_slot(&self, _tid: Pid) -> EngineResult<Option<u8>> {
            Ok(None)
        }
        fn waitpid_raw(&self, pid: i32) -> EngineResult<(Pid, i32)> {
            Ok((Pid::from_raw(pid), (libc::SIGSTOP << 8) | 0x7f))
        }
    }

    fn session() -> DebugSession<FakePtrace> {
        let pid = Pid::from_raw(100);
        let mut tracee = Tracee::new(pid, ArchPlatform::Amd64OnX86_64);
        tracee.register_thread(pid).unwrap();
        DebugSession { ptrace: FakePtrace::default(), tracee, status_handler: StatusHandler::new() }
    }

    #[test]
    fn cont_all_and_set_bps_steps_linked_threads_over_and_rearms() {
        let mut session = session();
        let tid = Pid::from_raw(100);

        session.tracee.software_breakpoints.insert(
            0x4000,
            SoftwareBreakpoint {
                address: 0x4000,
                original_word: 0x1122_3344_5566_7788,
                patched_word: 0x1122_3344_5566_77CC,
                enabled: false,
                hit_count: 1,
                linked_thread_ids: vec![tid],
            },
        );

        session.cont_all_and_set_bps().unwrap();

        assert_eq!(session.ptrace.single_stepped.borrow().as_slice(), &[tid]);
        let bp = &session.tracee.software_breakpoints[&0x4000];
        assert!(bp.linked_thread_ids.is_empty());
        assert!(bp.enabled);
        assert!(session.ptrace.poked.borrow().iter().any(|(addr, data)| *addr == 0x4000 && *data == bp.patched_word));
    }
}
