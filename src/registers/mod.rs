//! Register views (C2): architecture-specific projections over the raw
//! tracee register blob and the XSAVE/vector area.
//!
//! Grounded on `isgasho-rd`'s `registers.rs`, which holds a tagged union
//! (`RegistersUnion { x86, x64 }`) keyed by `SupportedArch` and dispatches
//! accessors through `rd_get_reg!`/`rd_set_reg!` macros. That file only
//! needs `syscallno`/`syscall_result`/`flags` for record/replay bookkeeping;
//! this module generalizes the same tagged-union + macro-dispatch shape to
//! the full named-accessor surface spec.md §4.2 requires (GPR sub-register
//! overlays, `instruction_pointer`, `syscall_argN`) and adds the aarch64 and
//! vector-register (`ymm`/`zmm`) views that file never needed.

pub mod aarch64;
pub mod amd64;
pub mod i386;
pub mod vector;

use crate::arch::ArchPlatform;
use aarch64::Aarch64Gpr;
use amd64::Amd64Gpr;
use i386::I386Gpr;

/// Generic accessors every architecture's register view must provide so the
/// status handler and breakpoint engine can stay architecture-agnostic.
pub trait GenericRegs {
    fn instruction_pointer(&self) -> u64;
    fn set_instruction_pointer(&mut self, value: u64);

    fn syscall_number(&self) -> i64;
    fn set_syscall_number(&mut self, value: i64);

    fn syscall_return(&self) -> u64;
    fn set_syscall_return(&mut self, value: u64);

    fn syscall_arg(&self, index: u8) -> u64;
    fn set_syscall_arg(&mut self, index: u8, value: u64);
}

/// The raw register blob for a thread, tagged by which architecture's
/// layout it holds. One `RegisterFile` is owned per `Thread`.
#[derive(Copy, Clone, Debug)]
pub enum RegisterFile {
    Amd64(Amd64Gpr),
    I386(I386Gpr),
    Aarch64(Aarch64Gpr),
}

impl RegisterFile {
    pub fn new_for(arch_platform: ArchPlatform) -> RegisterFile {
        use crate::arch::Architecture::*;
        match arch_platform.architecture() {
            Amd64 => RegisterFile::Amd64(Amd64Gpr::default()),
            I386 => RegisterFile::I386(I386Gpr::default()),
            Aarch64 => RegisterFile::Aarch64(Aarch64Gpr::default()),
        }
    }

    pub fn as_amd64(&self) -> Option<&Amd64Gpr> {
        match self {
            RegisterFile::Amd64(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_amd64_mut(&mut self) -> Option<&mut Amd64Gpr> {
        match self {
            RegisterFile::Amd64(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_i386(&self) -> Option<&I386Gpr> {
        match self {
            RegisterFile::I386(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_i386_mut(&mut self) -> Option<&mut I386Gpr> {
        match self {
            RegisterFile::I386(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_aarch64(&self) -> Option<&Aarch64Gpr> {
        match self {
            RegisterFile::Aarch64(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_aarch64_mut(&mut self) -> Option<&mut Aarch64Gpr> {
        match self {
            RegisterFile::Aarch64(r) => Some(r),
            _ => None,
        }
    }
}

impl GenericRegs for RegisterFile {
    fn instruction_pointer(&self) -> u64 {
        match self {
            RegisterFile::Amd64(r) => r.instruction_pointer(),
            RegisterFile::I386(r) => r.instruction_pointer(),
            RegisterFile::Aarch64(r) => r.instruction_pointer(),
        }
    }

    fn set_instruction_pointer(&mut self, value: u64) {
        match self {
            RegisterFile::Amd64(r) => r.set_instruction_pointer(value),
            RegisterFile::I386(r) => r.set_instruction_pointer(value),
            RegisterFile::Aarch64(r) => r.set_instruction_pointer(value),
        }
    }

    fn syscall_number(&self) -> i64 {
        match self {
            RegisterFile::Amd64(r) => r.syscall_number(),
            RegisterFile::I386(r) => r.syscall_number(),
            RegisterFile::Aarch64(r) => r.syscall_number(),
        }
    }

    fn set_syscall_number(&mut self, value: i64) {
        match self {
            RegisterFile::Amd64(r) => r.set_syscall_number(value),
            RegisterFile::I386(r) => r.set_syscall_number(value),
            RegisterFile::Aarch64(r) => r.set_syscall_number(value),
        }
    }

    fn syscall_return(&self) -> u64 {
        match self {
            RegisterFile::Amd64(r) => r.syscall_return(),
            RegisterFile::I386(r) => r.syscall_return(),
            RegisterFile::Aarch64(r) => r.syscall_return(),
        }
    }

    fn set_syscall_return(&mut self, value: u64) {
        match self {
            RegisterFile::Amd64(r) => r.set_syscall_return(value),
            RegisterFile::I386(r) => r.set_syscall_return(value),
            RegisterFile::Aarch64(r) => r.set_syscall_return(value),
        }
    }

    fn syscall_arg(&self, index: u8) -> u64 {
        match self {
            RegisterFile::Amd64(r) => r.syscall_arg(index),
            RegisterFile::I386(r) => r.syscall_arg(index),
            RegisterFile::Aarch64(r) => r.syscall_arg(index),
        }
    }

    fn set_syscall_arg(&mut self, index: u8, value: u64) {
        match self {
            RegisterFile::Amd64(r) => r.set_syscall_arg(index, value),
            RegisterFile::I386(r) => r.set_syscall_arg(index, value),
            RegisterFile::Aarch64(r) => r.set_syscall_arg(index, value),
        }
    }
}

/// The XSAVE/vector-register area for a thread (x86-64 only). Carries the
/// two metadata fields C1 populates from the `PTRACE_GETREGSET`
/// `NT_X86_XSTATE` query (or CPUID leaf 0Dh): `component_size` and
/// `avx_offset`. Never cached across resumes — every read/write goes
/// through `fetch_fp`/`flush_fp` on the owning `Thread` (spec.md §9).
#[derive(Clone)]
pub struct FpRegisterFile {
    pub component_size: usize,
    pub avx_offset: usize,
    pub raw: Vec<u8>,
}

impl FpRegisterFile {
    pub const STANDARD_AVX_SIZE: usize = 896;
    pub const AVX512_SIZE: usize = 2560;
    /// FXSAVE legacy area plus XSAVE header; enough room for the standard
    /// AVX component at minimum.
    pub const MIN_RAW_LEN: usize = 4096;

    pub fn new(component_size: usize, avx_offset: usize) -> FpRegisterFile {
        FpRegisterFile {
            component_size,
            avx_offset,
            raw: vec![0u8; Self::MIN_RAW_LEN.max(component_size + avx_offset)],
        }
    }
}
