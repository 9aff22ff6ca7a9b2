//! Hook chain executor (C5, spec.md §4.5): syscall/signal hook tables plus
//! the hijack-chain recursion and cycle detection described in §4.4a/§4.4d.
//!
//! Grounded on
//! `examples/original_source/libdebug/ptrace/ptrace_status_handler.py`'s
//! `_manage_syscall_on_enter`/`_manage_signal_callback`; the recursion there
//! threads a `hijacked_set` by value through each call, which this module
//! keeps (spec.md §9's "pass a `visited` set by value" redesign note) rather
//! than storing it on shared context.

pub mod signal_hook;
pub mod syscall_hook;

pub use signal_hook::SignalHook;
pub use syscall_hook::SyscallHook;

use crate::error::{EngineError, EngineResult};
use crate::registers::GenericRegs;
use crate::thread::Thread;
use log::{debug, error};
use std::collections::{HashMap, HashSet};

/// The syscall/signal hook tables for one tracee. Mutating a hook's
/// `enabled` flag while the tracee is running is rejected (spec.md §4.5) —
/// callers check `running` themselves and pass it in, since this table has
/// no notion of process state of its own.
#[derive(Default)]
pub struct HookTables {
    syscalls: HashMap<i64, SyscallHook>,
    signals: HashMap<i32, SignalHook>,
}

impl HookTables {
    pub fn new() -> HookTables {
        HookTables::default()
    }

    pub fn install_syscall_hook(&mut self, hook: SyscallHook) {
        self.syscalls.insert(hook.syscall_number, hook);
    }

    pub fn install_signal_hook(&mut self, hook: SignalHook) {
        self.signals.insert(hook.signal_number, hook);
    }

    pub fn syscall_hook(&self, number: i64) -> Option<&SyscallHook> {
        self.syscalls.get(&number)
    }

    pub fn syscall_hook_mut(&mut self, number: i64) -> Option<&mut SyscallHook> {
        self.syscalls.get_mut(&number)
    }

    pub fn signal_hook(&self, number: i32) -> Option<&SignalHook> {
        self.signals.get(&number)
    }

    pub fn set_syscall_hook_enabled(&mut self, number: i64, enabled: bool, running: bool) -> EngineResult<()> {
        if running {
            return Err(EngineError::HookStateWhileRunning);
        }
        if let Some(hook) = self.syscalls.get_mut(&number) {
            hook.enabled = enabled;
            hook.has_entered = false;
        }
        Ok(())
    }

    pub fn set_signal_hook_enabled(&mut self, number: i32, enabled: bool, running: bool) -> EngineResult<()> {
        if running {
            return Err(EngineError::HookStateWhileRunning);
        }
        if let Some(hook) = self.signals.get_mut(&number) {
            hook.enabled = enabled;
        }
        Ok(())
    }

    /// §4.4a, entering half. `hijacked` starts as `{number}` at the top-level
    /// call; every recursive hop adds the new number first, raising
    /// `SyscallHijackLoop` if it was already present.
    fn manage_syscall_on_enter(&mut self, number: i64, thread: &mut Thread, hijacked: &mut HashSet<i64>) -> EngineResult<()> {
        let has_user_enter = self.syscalls.get(&number).map(|h| h.enabled && h.on_enter_user.is_some()).unwrap_or(false);

        if has_user_enter {
            let old_args: [u64; 6] = std::array::from_fn(|i| thread.syscall_arg(i as u8));

            {
                let hook = self.syscalls.get_mut(&number).unwrap();
                let mut cb = hook.on_enter_user.take().unwrap();
                cb(thread, number);
                hook.on_enter_user = Some(cb);
            }

            let after = thread.syscall_number();
            if after != number {
                if let Some(hook) = self.syscalls.get_mut(&number) {
                    if let Some(pprint) = hook.on_enter_pprint.as_mut() {
                        pprint(thread, number, true, Some(old_args));
                    }
                }

                let target_hook_hijack = self.syscalls.get(&number).map(|h| h.hook_hijack).unwrap_or(false);
                if self.syscalls.contains_key(&after) {
                    if target_hook_hijack {
                        if !hijacked.insert(after) {
                            error!("syscall hijack cycle detected at syscall {after}, aborting chain");
                            return Err(EngineError::SyscallHijackLoop { syscall_number: after });
                        }
                        debug!("syscall {number} hijacked to {after}");
                        self.manage_syscall_on_enter(after, thread, hijacked)?;
                    } else {
                        let target = self.syscalls.get_mut(&after).unwrap();
                        if let Some(pprint) = target.on_enter_pprint.as_mut() {
                            pprint(thread, after, false, None);
                        }
                        target.has_entered = true;
                        target.skip_exit = true;
                    }
                }
            } else {
                let hook = self.syscalls.get_mut(&number).unwrap();
                if let Some(pprint) = hook.on_enter_pprint.as_mut() {
                    pprint(thread, number, true, None);
                }
                hook.has_entered = true;
            }
        } else if let Some(hook) = self.syscalls.get_mut(&number) {
            if let Some(pprint) = hook.on_enter_pprint.as_mut() {
                pprint(thread, number, false, None);
                hook.has_entered = true;
            } else if hook.on_exit_pprint.is_some() || hook.on_exit_user.is_some() {
                hook.has_entered = true;
            }
        }

        Ok(())
    }

    /// §4.4a. Returns whether the caller should resume (always true per
    /// spec — kept as a `Result` so `ThreadGone`/hijack-loop errors
    /// propagate to the control loop).
    pub fn handle_syscall(&mut self, thread: &mut Thread) -> EngineResult<()> {
        let number = thread.syscall_number();

        if !self.syscalls.contains_key(&number) {
            return Ok(());
        }

        let entered = self.syscalls.get(&number).unwrap().has_entered;

        if !entered {
            let mut hijacked = HashSet::new();
            hijacked.insert(number);
            self.manage_syscall_on_enter(number, thread, &mut hijacked)?;
        } else {
            let hook = self.syscalls.get_mut(&number).unwrap();
            if hook.enabled && !hook.skip_exit {
                hook.hit_count += 1;
            }

            if hook.enabled && !hook.skip_exit && hook.on_exit_user.is_some() {
                let before = thread.syscall_return();
                let mut cb = hook.on_exit_user.take().unwrap();
                cb(thread, number);
                let hook = self.syscalls.get_mut(&number).unwrap();
                hook.on_exit_user = Some(cb);
                let after = thread.syscall_return();
                if let Some(pprint) = hook.on_exit_pprint.as_mut() {
                    if after != before {
                        pprint(after, Some(before));
                    } else {
                        pprint(after, None);
                    }
                }
            } else if let Some(pprint) = hook.on_exit_pprint.as_mut() {
                pprint(thread.syscall_return(), None);
            }

            let hook = self.syscalls.get_mut(&number).unwrap();
            hook.has_entered = false;
            hook.skip_exit = false;
        }

        Ok(())
    }

    /// §4.4d.
    fn manage_signal_callback(&mut self, number: i32, thread: &mut Thread, hijacked: &mut HashSet<i32>) -> EngineResult<()> {
        let Some(hook) = self.signals.get_mut(&number) else { return Ok(()) };
        if !hook.enabled {
            return Ok(());
        }
        hook.hit_count += 1;

        if hook.callback.is_some() {
            let mut cb = hook.callback.take().unwrap();
            cb(thread, number);
            self.signals.get_mut(&number).unwrap().callback = Some(cb);

            let after = thread.signal_number.unwrap_or(number);
            if after != number {
                let hook_hijack = self.signals.get(&number).map(|h| h.hook_hijack).unwrap_or(false);
                if hook_hijack && self.signals.contains_key(&after) {
                    if !hijacked.insert(after) {
                        error!("signal hijack cycle detected at signal {after}, aborting chain");
                        return Err(EngineError::SignalHijackLoop { signal_number: after });
                    }
                    debug!("signal {number} hijacked to {after}");
                    self.manage_signal_callback(after, thread, hijacked)?;
                }
            }
        }

        Ok(())
    }

    pub fn handle_signal(&mut self, thread: &mut Thread) -> EngineResult<()> {
        let Some(signum) = thread.signal_number else { return Ok(()) };
        if self.signals.contains_key(&signum) {
            let mut hijacked = HashSet::new();
            hijacked.insert(signum);
            self.manage_signal_callback(signum, thread, &mut hijacked)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchPlatform;
    use nix::unistd::Pid;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn thread() -> Thread {
        Thread::new(Pid::from_raw(1), Pid::from_raw(1), ArchPlatform::Amd64OnX86_64).unwrap()
    }

    #[test]
    fn syscall_hook_alternates_enter_exit_and_counts_hits() {
        let mut tables = HookTables::new();
        let mut hook = SyscallHook::new(1);
        hook.on_exit_user = Some(Box::new(|_t, _n| {}));
        tables.install_syscall_hook(hook);

        let mut t = thread();
        t.registers.set_syscall_number(1);

        tables.handle_syscall(&mut t).unwrap();
        assert!(tables.syscall_hook(1).unwrap().has_entered());
        assert_eq!(tables.syscall_hook(1).unwrap().hit_count, 0);

        tables.handle_syscall(&mut t).unwrap();
        assert!(!tables.syscall_hook(1).unwrap().has_entered());
        assert_eq!(tables.syscall_hook(1).unwrap().hit_count, 1);
    }

    #[test]
    fn syscall_hijack_cycle_is_detected_and_clears_has_entered() {
        let mut tables = HookTables::new();

        let calls = Rc::new(RefCell::new(0));
        let calls_a = calls.clone();
        let mut hook_a = SyscallHook::new(10);
        hook_a.on_enter_user = Some(Box::new(move |t: &mut Thread, _n| {
            *calls_a.borrow_mut() += 1;
            t.registers.set_syscall_number(20);
        }));
        tables.install_syscall_hook(hook_a);

        let calls_b = calls.clone();
        let mut hook_b = SyscallHook::new(20);
        hook_b.on_enter_user = Some(Box::new(move |t: &mut Thread, _n| {
            *calls_b.borrow_mut() += 1;
            t.registers.set_syscall_number(10);
        }));
        tables.install_syscall_hook(hook_b);

        let mut t = thread();
        t.registers.set_syscall_number(10);

        let result = tables.handle_syscall(&mut t);
        assert!(matches!(result, Err(EngineError::SyscallHijackLoop { syscall_number: 10 })));
        assert!(!tables.syscall_hook(10).unwrap().has_entered());
    }
}
