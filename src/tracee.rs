//! The traced process (spec.md §3 "Tracee"): owns the thread table, the
//! software breakpoint list, the hook tables, and the process-wide
//! `ResumeContext` the status handler writes and the control loop reads.

use crate::arch::ArchPlatform;
use crate::breakpoint::SoftwareBreakpoint;
use crate::error::EngineResult;
use crate::hooks::HookTables;
use crate::thread::Thread;
use nix::unistd::Pid;
use std::collections::HashMap;

/// The verdict the status handler leaves for the control loop after
/// processing a wait batch (spec.md §3, §4.4).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resume {
    Resume,
    NotResume,
}

/// Process-wide, mutated only by the status handler, read by the control
/// loop (spec.md §3).
#[derive(Debug)]
pub struct ResumeContext {
    pub resume: Resume,
    pub is_a_step: bool,
    pub force_interrupt: bool,
}

impl Default for ResumeContext {
    fn default() -> ResumeContext {
        ResumeContext { resume: Resume::Resume, is_a_step: false, force_interrupt: false }
    }
}

pub struct Tracee {
    pub pid: Pid,
    pub arch_platform: ArchPlatform,
    pub threads: HashMap<Pid, Thread>,
    pub software_breakpoints: HashMap<u64, SoftwareBreakpoint>,
    pub hooks: HookTables,
    pub resume_context: ResumeContext,
    /// Whether the tracee is currently resumed; gates hook enable/disable
    /// (spec.md §4.5, §7 `HookStateWhileRunning`).
    pub running: bool,
}

impl Tracee {
    pub fn new(pid: Pid, arch_platform: ArchPlatform) -> Tracee {
        Tracee {
            pid,
            arch_platform,
            threads: HashMap::new(),
            software_breakpoints: HashMap::new(),
            hooks: HookTables::new(),
            resume_context: ResumeContext::default(),
            running: false,
        }
    }

    pub fn register_thread(&mut self, tid: Pid) -> EngineResult<()> {
        let thread = Thread::new(tid, self.pid, self.arch_platform)?;
        self.threads.insert(tid, thread);
        Ok(())
    }

    pub fn unregister_thread(&mut self, tid: Pid) {
        self.threads.remove(&tid);
    }

    pub fn thread(&self, tid: Pid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Pid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Breakpoints whose address lies in an enabled, not-currently-stepped
    /// state (spec.md §4.4b "enabled set").
    pub fn enabled_breakpoint_at(&self, address: u64) -> Option<&SoftwareBreakpoint> {
        self.software_breakpoints.get(&address).filter(|bp| bp.enabled)
    }

    pub fn enabled_breakpoint_at_mut(&mut self, address: u64) -> Option<&mut SoftwareBreakpoint> {
        self.software_breakpoints.get_mut(&address).filter(|bp| bp.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_thread() {
        let mut tracee = Tracee::new(Pid::from_raw(100), ArchPlatform::Amd64OnX86_64);
        tracee.register_thread(Pid::from_raw(101)).unwrap();
        assert!(tracee.thread(Pid::from_raw(101)).is_some());
        tracee.unregister_thread(Pid::from_raw(101));
        assert!(tracee.thread(Pid::from_raw(101)).is_none());
    }

    #[test]
    fn default_resume_context_is_resume() {
        let tracee = Tracee::new(Pid::from_raw(100), ArchPlatform::Amd64OnX86_64);
        assert_eq!(tracee.resume_context.resume, Resume::Resume);
        assert!(!tracee.resume_context.force_interrupt);
    }
}
