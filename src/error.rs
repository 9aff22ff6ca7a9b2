//! Error types surfaced by the engine. One enum per §7 of the design: every
//! fallible public operation returns `Result<T, EngineError>`.

use nix::unistd::Pid;
use thiserror::Error;

/// The errno-carrying identity of a failed ptrace (or related) syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallOp(pub &'static str);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ptrace syscall {op} failed: {errno}")]
    PtraceSyscallFailed { op: &'static str, errno: nix::errno::Errno },

    #[error("unsupported (architecture, platform) pair")]
    UnsupportedPlatform,

    #[error("unsupported architecture")]
    UnsupportedArchitecture,

    #[error("unsupported floating point layout: component_size={size}")]
    UnsupportedFpLayout { size: usize },

    #[error("syscall hijack loop detected at syscall {syscall_number}")]
    SyscallHijackLoop { syscall_number: i64 },

    #[error("signal hijack loop detected at signal {signal_number}")]
    SignalHijackLoop { signal_number: i32 },

    #[error("cannot enable/disable a hook while the tracee is running")]
    HookStateWhileRunning,

    #[error("no free debug register slot available for thread {tid}")]
    NoFreeDebugRegister { tid: Pid },

    #[error("thread {tid} is gone")]
    ThreadGone { tid: Pid },
}

impl EngineError {
    pub fn from_errno(op: &'static str, errno: nix::errno::Errno) -> Self {
        EngineError::PtraceSyscallFailed { op, errno }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
