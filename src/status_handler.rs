//! Status handler (C4, spec.md §4.4): demultiplexes a wait-status batch into
//! {breakpoint, syscall, signal, clone, exit, seccomp} and writes the
//! `ResumeContext` verdict.
//!
//! Grounded on
//! `examples/original_source/libdebug/ptrace/ptrace_status_handler.py`'s
//! `PtraceStatusHandler` — `manage_change`/`_handle_change`/
//! `_internal_signal_handler`/`_handle_breakpoints`/`_handle_clone` are
//! carried over near-verbatim in control flow, translated from Python's
//! dynamic dispatch to explicit `match`es over this crate's typed `Resume`/
//! event constants.

use crate::breakpoint::breakpoint_size;
use crate::error::EngineResult;
use crate::ptrace_ops::PtraceOps;
use crate::tracee::{Resume, Tracee};
use log::{debug, trace, warn};
use nix::unistd::Pid;

/// `SIGTRAP | 0x80`, the syscall-stop signal under `PTRACE_O_TRACESYSGOOD`.
const SYSCALL_SIGTRAP: i32 = libc::SIGTRAP | 0x80;
const PTRACE_EVENT_CLONE: i32 = 3;
const PTRACE_EVENT_EXIT: i32 = 6;
const PTRACE_EVENT_SECCOMP: i32 = 7;
/// `(SIGSTOP << 8) | 0x7f`: the literal wait-status of a SIGSTOP stop
/// (spec.md §6).
const SIGSTOP_STOPPED_STATUS: i32 = 4991;

fn wifstopped(status: i32) -> bool {
    status & 0xff == 0x7f
}

fn wstopsig(status: i32) -> i32 {
    (status >> 8) & 0xff
}

fn wifexited(status: i32) -> bool {
    status & 0x7f == 0
}

fn wifsignaled(status: i32) -> bool {
    let x = ((status & 0x7f) + 1) as i8;
    (x >> 1) > 0
}

pub fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

pub fn wtermsig(status: i32) -> i32 {
    status & 0x7f
}

/// One status handler per tracee. Holds the transient race-SIGSTOP flag and
/// the accumulator for threads whose pending signal still needs delivery
/// (spec.md §4.4's `assume_race_sigstop`/`threads_with_signals_to_deliver`).
#[derive(Default)]
pub struct StatusHandler {
    assume_race_sigstop: bool,
    threads_with_signals_to_deliver: Vec<Pid>,
}

impl StatusHandler {
    pub fn new() -> StatusHandler {
        StatusHandler::default()
    }

    /// Consumes a batch of `(tid, status)` pairs from `waitpid_raw`/
    /// `wait_all_and_update_regs`. Returns the threads that need a pending
    /// signal delivered on the next resume, or empty if the whole batch was
    /// judged a debugger-self-inflicted SIGSTOP race.
    pub fn manage_change<P: PtraceOps>(
        &mut self,
        tracee: &mut Tracee,
        ptrace: &P,
        batch: &[(Pid, i32)],
    ) -> EngineResult<Vec<Pid>> {
        self.assume_race_sigstop = true;
        self.threads_with_signals_to_deliver.clear();

        for &(pid, status) in batch {
            if pid.as_raw() == -1 {
                tracee.resume_context.resume = Resume::Resume;
            } else {
                self.handle_change(tracee, ptrace, pid, status, batch)?;
            }
        }

        if self.assume_race_sigstop {
            warn!("suppressing signal delivery: whole batch looked like a race SIGSTOP storm");
            tracee.resume_context.resume = Resume::Resume;
            return Ok(Vec::new());
        }

        Ok(std::mem::take(&mut self.threads_with_signals_to_deliver))
    }

    fn handle_change<P: PtraceOps>(
        &mut self,
        tracee: &mut Tracee,
        ptrace: &P,
        pid: Pid,
        status: i32,
        batch: &[(Pid, i32)],
    ) -> EngineResult<()> {
        if wifstopped(status) {
            let signum = wstopsig(status);
            if signum != libc::SIGSTOP {
                self.assume_race_sigstop = false;
            }

            self.internal_signal_handler(tracee, ptrace, pid, signum, status, batch)?;

            if tracee.threads.contains_key(&pid) {
                if let Some(thread) = tracee.threads.get_mut(&pid) {
                    thread.signal_number = Some(signum);
                }

                let has_signal_hook = tracee.hooks.signal_hook(signum).is_some();
                if has_signal_hook {
                    if let Some(thread) = tracee.threads.get_mut(&pid) {
                        tracee.hooks.handle_signal(thread)?;
                    }
                    tracee.resume_context.resume = Resume::Resume;
                }

                self.threads_with_signals_to_deliver.push(pid);
            }
        }

        if wifexited(status) || wifsignaled(status) {
            debug!("thread {pid} gone (exited or signaled), dropping from thread table");
            tracee.unregister_thread(pid);
            tracee.resume_context.resume = Resume::Resume;
        }

        Ok(())
    }

    fn internal_signal_handler<P: PtraceOps>(
        &mut self,
        tracee: &mut Tracee,
        ptrace: &P,
        pid: Pid,
        signum: i32,
        status: i32,
        batch: &[(Pid, i32)],
    ) -> EngineResult<()> {
        if signum == SYSCALL_SIGTRAP {
            trace!("thread {pid} stopped at syscall-stop");
            if let Some(thread) = tracee.threads.get_mut(&pid) {
                tracee.hooks.handle_syscall(thread)?;
            }
        } else if signum == libc::SIGSTOP && tracee.resume_context.force_interrupt {
            debug!("thread {pid} honoring a forced interrupt");
            tracee.resume_context.resume = Resume::NotResume;
            tracee.resume_context.force_interrupt = false;
        } else if signum == libc::SIGTRAP {
            self.handle_breakpoints(tracee, ptrace, pid)?;

            if tracee.resume_context.is_a_step {
                tracee.resume_context.resume = Resume::NotResume;
                tracee.resume_context.is_a_step = false;
            }

            let event = status >> 8;
            let clone_code = libc::SIGTRAP | (PTRACE_EVENT_CLONE << 8);
            let seccomp_code = libc::SIGTRAP | (PTRACE_EVENT_SECCOMP << 8);
            let exit_code = libc::SIGTRAP | (PTRACE_EVENT_EXIT << 8);

            if event == clone_code {
                let new_tid = Pid::from_raw(ptrace.get_event_msg(pid)? as i32);
                debug!("thread {pid} cloned new thread {new_tid}");
                self.handle_clone(tracee, ptrace, new_tid, batch)?;
                tracee.resume_context.resume = Resume::Resume;
            } else if event == seccomp_code {
                trace!("thread {pid} hit a seccomp-trace stop");
                tracee.resume_context.resume = Resume::Resume;
            } else if event == exit_code {
                // The tracee is still alive; unregistering happens on the
                // next wait that reports WIFEXITED/WIFSIGNALED.
                debug!("thread {pid} entered PTRACE_EVENT_EXIT");
                let _ = ptrace.get_event_msg(pid)?;
                tracee.resume_context.resume = Resume::Resume;
            }
        }

        Ok(())
    }

    /// §4.4b.
    fn handle_breakpoints<P: PtraceOps>(&mut self, tracee: &mut Tracee, ptrace: &P, tid: Pid) -> EngineResult<()> {
        let registers_fetched = match tracee.threads.get(&tid) {
            Some(t) => t.registers_fetched,
            None => return Ok(()),
        };
        if !registers_fetched {
            tracee.resume_context.resume = Resume::NotResume;
            return Ok(());
        }

        let bp_size = breakpoint_size(tracee.arch_platform);
        let ip = tracee.threads.get(&tid).unwrap().instruction_pointer();

        let mut hit_addr = None;
        if tracee.enabled_breakpoint_at(ip).is_some() {
            hit_addr = Some(ip);
        } else {
            let sw_addr = ip.wrapping_sub(bp_size);
            if tracee.enabled_breakpoint_at(sw_addr).is_some() {
                if let Some(thread) = tracee.threads.get_mut(&tid) {
                    thread.set_instruction_pointer(sw_addr);
                }
                hit_addr = Some(sw_addr);
            }
        }

        if let Some(addr) = hit_addr {
            debug!("thread {tid} hit software breakpoint at {addr:#x}");
            // Restore the original byte now and hand the thread to the
            // step-over discipline: `cont_all_and_set_bps` single-steps it
            // past `addr` and rearms the trap before resuming normally
            // (spec.md §4.3's restore -> single-step -> re-patch sequence).
            if let Some(bp) = tracee.software_breakpoints.get_mut(&addr) {
                bp.disable(ptrace, tid)?;
                bp.linked_thread_ids.push(tid);
                bp.hit_count += 1;
            }
            // This engine's software/hardware-address breakpoints carry no
            // user callback (spec.md §3) — a hit always stops the tracee
            // until the user resumes explicitly.
            tracee.resume_context.resume = Resume::NotResume;
            return Ok(());
        }

        let resume_after_watch = {
            let thread = match tracee.threads.get_mut(&tid) {
                Some(t) => t,
                None => return Ok(()),
            };
            match thread.hw_manager.is_watchpoint_hit(ptrace, tid)? {
                Some(hwbp) => {
                    debug!("thread {tid} hit watchpoint slot {}", hwbp.slot_index);
                    hwbp.hit_count += 1;
                    if hwbp.callback.is_some() {
                        let mut cb = hwbp.callback.take().unwrap();
                        cb(tid, hwbp);
                        hwbp.callback = Some(cb);
                        Some(true)
                    } else {
                        Some(false)
                    }
                }
                None => None,
            }
        };

        if let Some(has_callback) = resume_after_watch {
            tracee.resume_context.resume = if has_callback { Resume::Resume } else { Resume::NotResume };
        }

        Ok(())
    }

    /// §4.4c.
    fn handle_clone<P: PtraceOps>(
        &mut self,
        tracee: &mut Tracee,
        ptrace: &P,
        new_tid: Pid,
        batch: &[(Pid, i32)],
    ) -> EngineResult<()> {
        let already_consumed = batch.iter().any(|&(p, s)| p == new_tid && s == SIGSTOP_STOPPED_STATUS);
        if !already_consumed {
            trace!("waiting for clone child {new_tid}'s initial SIGSTOP");
            ptrace.waitpid_raw(new_tid.as_raw())?;
        }
        tracee.register_thread(new_tid)?;
        debug!("registered new thread {new_tid}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchPlatform;
    use crate::breakpoint::SoftwareBreakpoint;
    use crate::error::EngineError;
    use crate::registers::RegisterFile;
    use std::cell::RefCell;

    /// A `PtraceOps` double that records calls and returns canned data,
    /// used to drive the status handler without a real tracee.
    #[derive(Default)]
    struct FakePtrace {
        event_msg: RefCell<u64>,
        waitpid_calls: RefCell<Vec<i32>>,
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
        fn poke_data(&self, _pid: Pid, _addr: u64, _data: u64) -> EngineResult<()> {
            Ok(())
        }
        fn peek_user(&self, _pid: Pid, _offset: u64) -> EngineResult<u64> {
            Ok(0)
        }
        fn poke_user(&self, _pid: Pid, _offset: u64, _data: u64) -> EngineResult<()> {
            Ok(())
        }
        fn get_event_msg(&self, _pid: Pid) -> EngineResult<u64> {
            Ok(*self.event_msg.borrow())
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
        fn single_step(&self, _tid: Pid) -> EngineResult<()> {
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
            self.waitpid_calls.borrow_mut().push(pid);
            Ok((Pid::from_raw(pid), SIGSTOP_STOPPED_STATUS))
        }
    }

    fn setup_logging() {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init();
    }

    fn tracee() -> Tracee {
        Tracee::new(Pid::from_raw(100), ArchPlatform::Amd64OnX86_64)
    }

    #[test]
    fn startup_trap_before_register_fetch_does_not_resume() {
        setup_logging();
        let mut tracee = tracee();
        tracee.register_thread(Pid::from_raw(101)).unwrap();
        let ptrace = FakePtrace::default();
        let mut handler = StatusHandler::new();

        // SIGTRAP-stopped status: WSTOPSIG == SIGTRAP, WIFSTOPPED true.
        let trap_status = (libc::SIGTRAP << 8) | 0x7f;
        handler.manage_change(&mut tracee, &ptrace, &[(Pid::from_raw(101), trap_status)]).unwrap();

        assert_eq!(tracee.resume_context.resume, Resume::NotResume);
    }

    #[test]
    fn software_breakpoint_hit_rewinds_ip_and_stops() {
        setup_logging();
        let mut tracee = tracee();
        tracee.register_thread(Pid::from_raw(101)).unwrap();
        {
            let thread = tracee.threads.get_mut(&Pid::from_raw(101)).unwrap();
            thread.registers_fetched = true;
            thread.set_instruction_pointer(0x2001); // one past the trap byte
        }
        tracee.software_breakpoints.insert(
            0x2000,
            SoftwareBreakpoint {
                address: 0x2000,
                original_word: 0,
                patched_word: 0xCC,
                enabled: true,
                hit_count: 0,
                linked_thread_ids: Vec::new(),
            },
        );

        let ptrace = FakePtrace::default();
        let mut handler = StatusHandler::new();
        let trap_status = (libc::SIGTRAP << 8) | 0x7f;
        handler.manage_change(&mut tracee, &ptrace, &[(Pid::from_raw(101), trap_status)]).unwrap();

        let thread = tracee.threads.get(&Pid::from_raw(101)).unwrap();
        assert_eq!(thread.instruction_pointer(), 0x2000);
        let bp = &tracee.software_breakpoints[&0x2000];
        assert_eq!(bp.hit_count, 1);
        assert_eq!(bp.linked_thread_ids, vec![Pid::from_raw(101)]);
        assert!(!bp.enabled, "hit breakpoint must be disarmed pending the step-over discipline");
        assert_eq!(tracee.resume_context.resume, Resume::NotResume);
    }

    #[test]
    fn clone_event_registers_new_thread_without_extra_waitpid_when_already_in_batch() {
        setup_logging();
        let mut tracee = tracee();
        tracee.register_thread(Pid::from_raw(101)).unwrap();
        {
            let thread = tracee.threads.get_mut(&Pid::from_raw(101)).unwrap();
            thread.registers_fetched = true;
        }

        let ptrace = FakePtrace::default();
        *ptrace.event_msg.borrow_mut() = 202;
        let mut handler = StatusHandler::new();

        let clone_code = libc::SIGTRAP | (PTRACE_EVENT_CLONE << 8);
        let status = (clone_code << 8) | 0x7f;
        let batch = [(Pid::from_raw(101), status), (Pid::from_raw(202), SIGSTOP_STOPPED_STATUS)];
        handler.manage_change(&mut tracee, &ptrace, &batch).unwrap();

        assert!(tracee.threads.contains_key(&Pid::from_raw(202)));
        assert!(ptrace.waitpid_calls.borrow().is_empty());
    }

    #[test]
    fn race_sigstop_storm_suppresses_signal_delivery() {
        setup_logging();
        let mut tracee = tracee();
        tracee.register_thread(Pid::from_raw(101)).unwrap();
        let ptrace = FakePtrace::default();
        let mut handler = StatusHandler::new();

        let sigstop_status = (libc::SIGSTOP << 8) | 0x7f;
        let pending = handler.manage_change(&mut tracee, &ptrace, &[(Pid::from_raw(101), sigstop_status)]).unwrap();

        assert!(pending.is_empty());
        assert_eq!(tracee.resume_context.resume, Resume::Resume);
    }
}
