//! Syscall hooks (spec.md §3 "Syscall hook", §4.4a). Grounded on
//! `examples/original_source/libdebug/data/syscall_hook.py`'s `SyscallHook`
//! dataclass; the pretty-print/user callback split and the `_has_entered`/
//! `_skip_exit` transient flags are carried over unchanged in meaning.

use crate::thread::Thread;

/// Old argument snapshot passed to `on_enter_pprint` when a hook changed the
/// syscall number out from under itself.
pub type SyscallArgs = [u64; 6];

pub type OnEnterUser = Box<dyn FnMut(&mut Thread, i64)>;
pub type OnExitUser = Box<dyn FnMut(&mut Thread, i64)>;
pub type OnEnterPprint = Box<dyn FnMut(&mut Thread, i64, bool, Option<SyscallArgs>)>;
pub type OnExitPprint = Box<dyn FnMut(u64, Option<u64>)>;

/// A hook bound to one syscall number. At most one hook may be registered
/// per number (spec.md §3 invariant); hijacking temporarily hands control to
/// a different hook for the duration of a single enter/exit pair.
pub struct SyscallHook {
    pub syscall_number: i64,
    pub on_enter_user: Option<OnEnterUser>,
    pub on_exit_user: Option<OnExitUser>,
    pub on_enter_pprint: Option<OnEnterPprint>,
    pub on_exit_pprint: Option<OnExitPprint>,
    pub hook_hijack: bool,
    pub enabled: bool,
    pub hit_count: u64,
    pub(crate) has_entered: bool,
    pub(crate) skip_exit: bool,
}

impl SyscallHook {
    pub fn new(syscall_number: i64) -> SyscallHook {
        SyscallHook {
            syscall_number,
            on_enter_user: None,
            on_exit_user: None,
            on_enter_pprint: None,
            on_exit_pprint: None,
            hook_hijack: true,
            enabled: true,
            hit_count: 0,
            has_entered: false,
            skip_exit: false,
        }
    }

    pub fn has_entered(&self) -> bool {
        self.has_entered
    }
}
