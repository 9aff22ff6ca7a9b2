//! Ptrace capability (C1, spec.md §4.1, §6): a typed wrapper over the
//! tracee syscalls. Treated as "a capability set" the rest of the engine is
//! generic over (spec.md §1) — `PtraceOps` is the trait boundary, and
//! `LinuxPtrace` is the one real implementor, built the way `isgasho-rd`
//! mixes `nix::sys::*` with raw `libc` calls wherever `nix` doesn't cover a
//! needed request (`replay_syscall.rs`'s `__ptrace_cont` falls back to raw
//! `libc::waitpid` for the same reason).
//!
//! Orchestration that needs the breakpoint/thread tables
//! (`cont_all_and_set_bps`, `wait_all_and_update_regs`, `register_thread`,
//! `step_until`, ...) is NOT on this trait — it lives on `DebugSession`,
//! which owns those tables. This trait only covers the raw syscalls spec.md
//! §6 names as the external interface.

use crate::arch::ArchPlatform;
use crate::config::{EngineConfig, XsaveLayoutSource};
use crate::error::{EngineError, EngineResult};
use crate::registers::{FpRegisterFile, RegisterFile};
use libc::{c_void, iovec};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use raw_cpuid::CpuId;
use std::mem::size_of;

const NT_PRSTATUS: i32 = 1;
const NT_PRFPREG: i32 = 2;
const NT_X86_XSTATE: i32 = 0x202;

bitflags::bitflags! {
    /// Ptrace options this engine always enables on attach (spec.md §4.1
    /// `set_options`): trace-clone, trace-exit, trace-sysgood, trace-seccomp.
    struct EnginePtraceOptions: i32 {
        const TRACECLONE = libc::PTRACE_O_TRACECLONE;
        const TRACEEXIT = libc::PTRACE_O_TRACEEXIT;
        const TRACESYSGOOD = libc::PTRACE_O_TRACESYSGOOD;
        const TRACESECCOMP = libc::PTRACE_O_TRACESECCOMP;
    }
}

fn engine_ptrace_options() -> i32 {
    (EnginePtraceOptions::TRACECLONE
        | EnginePtraceOptions::TRACEEXIT
        | EnginePtraceOptions::TRACESYSGOOD
        | EnginePtraceOptions::TRACESECCOMP)
        .bits()
}

pub trait PtraceOps {
    fn trace_me(&self) -> EngineResult<()>;
    fn attach(&self, pid: Pid) -> EngineResult<()>;
    fn detach_all(&self, pid: Pid) -> EngineResult<()>;
    fn detach_for_migration(&self, pid: Pid) -> EngineResult<()>;
    fn reattach_from_gdb(&self, pid: Pid) -> EngineResult<()>;
    fn set_options(&self, pid: Pid) -> EngineResult<()>;

    fn peek_data(&self, pid: Pid, addr: u64) -> EngineResult<u64>;
    fn poke_data(&self, pid: Pid, addr: u64, data: u64) -> EngineResult<()>;
    fn peek_user(&self, pid: Pid, offset: u64) -> EngineResult<u64>;
    fn poke_user(&self, pid: Pid, offset: u64, data: u64) -> EngineResult<()>;

    fn get_event_msg(&self, pid: Pid) -> EngineResult<u64>;

    fn get_regs(&self, pid: Pid, arch_platform: ArchPlatform) -> EngineResult<RegisterFile>;
    fn set_regs(&self, pid: Pid, regs: &RegisterFile) -> EngineResult<()>;

    fn get_fp_registers(&self, tid: Pid, arch_platform: ArchPlatform) -> EngineResult<FpRegisterFile>;
    fn set_fp_registers(&self, tid: Pid, fp: &FpRegisterFile) -> EngineResult<()>;

    fn single_step(&self, tid: Pid) -> EngineResult<()>;
    fn cont(&self, tid: Pid, signal: Option<i32>) -> EngineResult<()>;

    /// aarch64 hardware breakpoint/watchpoint register programming via
    /// `NT_ARM_HW_BREAK`/`NT_ARM_HW_WATCH` (spec.md §4.3).
    fn set_hw_debug_register(&self, tid: Pid, is_bp: bool, slot: u8, address: u64, ctrl: u32) -> EngineResult<()>;
    fn hit_hw_watchpoint_slot(&self, tid: Pid) -> EngineResult<Option<u8>>;

    /// Raw `waitpid(pid, ..., __WALL)`. `pid == -1` waits for any child.
    fn waitpid_raw(&self, pid: i32) -> EngineResult<(Pid, i32)>;
}

fn errno_result(op: &'static str, ret: libc::c_long) -> EngineResult<libc::c_long> {
    if ret == -1 {
        let errno = Errno::last();
        if errno != Errno::UnknownErrno {
            return Err(EngineError::from_errno(op, errno));
        }
    }
    Ok(ret)
}

/// The concrete `PtraceOps` implementation. Owns the cached XSAVE layout
/// (`component_size`, `avx_offset`) computed once at construction per
/// `EngineConfig::xsave_layout_source`, since `never cached across resumes`
/// (spec.md §5) refers to the XSAVE *bytes*, not this static geometry.
pub struct LinuxPtrace {
    xsave_layout: Option<(usize, usize)>,
}

impl LinuxPtrace {
    pub fn new(config: &EngineConfig) -> LinuxPtrace {
        let xsave_layout = if config.architecture == crate::arch::Architecture::Aarch64 {
            None
        } else {
            Some(Self::detect_xsave_layout(config.xsave_layout_source))
        };
        LinuxPtrace { xsave_layout }
    }

    fn detect_xsave_layout(source: XsaveLayoutSource) -> (usize, usize) {
        // The AVX (YMM_Hi128) component lives at a fixed offset on every
        // mainstream Intel/AMD part that doesn't carry MPX/PT/PKRU state
        // ahead of it; CPUID leaf 0Dh only tells us the *total* area size,
        // so `avx_offset` is trusted as the well-known constant rather than
        // derived from a sub-leaf walk.
        const KNOWN_AVX_OFFSET: usize = 576;
        match source {
            XsaveLayoutSource::Cpuid => {
                let cpuid = CpuId::new();
                let component_size = cpuid
                    .get_extended_state_info()
                    .map(|ext| ext.xsave_area_size_enabled_features() as usize)
                    .unwrap_or(FpRegisterFile::STANDARD_AVX_SIZE);
                (component_size, KNOWN_AVX_OFFSET)
            }
            // Without a live handle to a previously populated blob, trust
            // the one layout every mainstream x86-64 kernel ships with.
            XsaveLayoutSource::TrustBlobHeader => (FpRegisterFile::STANDARD_AVX_SIZE, KNOWN_AVX_OFFSET),
        }
    }

    fn getregset(&self, pid: Pid, nt_type: i32, buf: &mut [u8]) -> EngineResult<usize> {
        let mut iov = iovec { iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len() };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                pid.as_raw(),
                nt_type as *mut c_void,
                &mut iov as *mut iovec as *mut c_void,
            )
        };
        errno_result("PTRACE_GETREGSET", ret)?;
        Ok(iov.iov_len)
    }

    fn setregset(&self, pid: Pid, nt_type: i32, buf: &mut [u8]) -> EngineResult<()> {
        let mut iov = iovec { iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len() };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                pid.as_raw(),
                nt_type as *mut c_void,
                &mut iov as *mut iovec as *mut c_void,
            )
        };
        errno_result("PTRACE_SETREGSET", ret)?;
        Ok(())
    }
}

impl PtraceOps for LinuxPtrace {
    fn trace_me(&self) -> EngineResult<()> {
        ptrace::traceme().map_err(|e| EngineError::from_errno("PTRACE_TRACEME", e))
    }

    fn attach(&self, pid: Pid) -> EngineResult<()> {
        ptrace::attach(pid).map_err(|e| EngineError::from_errno("PTRACE_ATTACH", e))
    }

    fn detach_all(&self, pid: Pid) -> EngineResult<()> {
        ptrace::detach(pid, None).map_err(|e| EngineError::from_errno("PTRACE_DETACH", e))
    }

    fn detach_for_migration(&self, pid: Pid) -> EngineResult<()> {
        // Same underlying request; kept as a distinct entry point per
        // spec.md §4.1 since callers reason about it differently (the
        // tracee is expected to be re-attached from elsewhere).
        self.detach_all(pid)
    }

    fn reattach_from_gdb(&self, pid: Pid) -> EngineResult<()> {
        self.attach(pid)
    }

    fn set_options(&self, pid: Pid) -> EngineResult<()> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETOPTIONS,
                pid.as_raw(),
                std::ptr::null_mut::<c_void>(),
                engine_ptrace_options() as *mut c_void,
            )
        };
        errno_result("PTRACE_SETOPTIONS", ret)?;
        Ok(())
    }

    fn peek_data(&self, pid: Pid, addr: u64) -> EngineResult<u64> {
        Errno::clear();
        let ret = unsafe { libc::ptrace(libc::PTRACE_PEEKDATA, pid.as_raw(), addr as *mut c_void, std::ptr::null_mut::<c_void>()) };
        errno_result("PTRACE_PEEKDATA", ret)?;
        Ok(ret as u64)
    }

    fn poke_data(&self, pid: Pid, addr: u64, data: u64) -> EngineResult<()> {
        let ret = unsafe { libc::ptrace(libc::PTRACE_POKEDATA, pid.as_raw(), addr as *mut c_void, data as *mut c_void) };
        errno_result("PTRACE_POKEDATA", ret)?;
        Ok(())
    }

    fn peek_user(&self, pid: Pid, offset: u64) -> EngineResult<u64> {
        Errno::clear();
        let ret = unsafe { libc::ptrace(libc::PTRACE_PEEKUSER, pid.as_raw(), offset as *mut c_void, std::ptr::null_mut::<c_void>()) };
        errno_result("PTRACE_PEEKUSER", ret)?;
        Ok(ret as u64)
    }

    fn poke_user(&self, pid: Pid, offset: u64, data: u64) -> EngineResult<()> {
        let ret = unsafe { libc::ptrace(libc::PTRACE_POKEUSER, pid.as_raw(), offset as *mut c_void, data as *mut c_void) };
        errno_result("PTRACE_POKEUSER", ret)?;
        Ok(())
    }

    fn get_event_msg(&self, pid: Pid) -> EngineResult<u64> {
        let mut msg: libc::c_ulong = 0;
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETEVENTMSG,
                pid.as_raw(),
                std::ptr::null_mut::<c_void>(),
                &mut msg as *mut libc::c_ulong as *mut c_void,
            )
        };
        errno_result("PTRACE_GETEVENTMSG", ret)?;
        Ok(msg as u64)
    }

    fn get_regs(&self, pid: Pid, arch_platform: ArchPlatform) -> EngineResult<RegisterFile> {
        let mut regs = RegisterFile::new_for(arch_platform);
        match &mut regs {
            RegisterFile::Amd64(r) => {
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(r as *mut _ as *mut u8, size_of::<crate::registers::amd64::Amd64Gpr>())
                };
                self.getregset(pid, NT_PRSTATUS, buf)?;
            }
            RegisterFile::I386(r) => {
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(r as *mut _ as *mut u8, size_of::<crate::registers::i386::I386Gpr>())
                };
                self.getregset(pid, NT_PRSTATUS, buf)?;
            }
            RegisterFile::Aarch64(r) => {
                // GPRs (user_pt_regs) occupy the leading 272 bytes of our
                // struct; the trailing v/fpsr/fpcr fields are populated by
                // a separate NT_PRFPREG query below.
                let gpr_len = 31 * 8 + 8 + 8 + 8;
                let buf = unsafe { std::slice::from_raw_parts_mut(r as *mut _ as *mut u8, gpr_len) };
                self.getregset(pid, NT_PRSTATUS, buf)?;

                let mut fpsimd = [0u8; 32 * 16 + 4 + 4 + 8];
                self.getregset(pid, NT_PRFPREG, &mut fpsimd)?;
                for i in 0..32 {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(&fpsimd[i * 16..i * 16 + 16]);
                    r.v[i] = u128::from_ne_bytes(bytes);
                }
                r.fpsr = u32::from_ne_bytes(fpsimd[512..516].try_into().unwrap());
                r.fpcr = u32::from_ne_bytes(fpsimd[516..520].try_into().unwrap());
            }
        }
        Ok(regs)
    }

    fn set_regs(&self, pid: Pid, regs: &RegisterFile) -> EngineResult<()> {
        match regs {
            RegisterFile::Amd64(r) => {
                let mut copy = *r;
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(&mut copy as *mut _ as *mut u8, size_of::<crate::registers::amd64::Amd64Gpr>())
                };
                self.setregset(pid, NT_PRSTATUS, buf)
            }
            RegisterFile::I386(r) => {
                let mut copy = *r;
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(&mut copy as *mut _ as *mut u8, size_of::<crate::registers::i386::I386Gpr>())
                };
                self.setregset(pid, NT_PRSTATUS, buf)
            }
            RegisterFile::Aarch64(r) => {
                let mut copy = *r;
                let gpr_len = 31 * 8 + 8 + 8 + 8;
                let buf = unsafe { std::slice::from_raw_parts_mut(&mut copy as *mut _ as *mut u8, gpr_len) };
                self.setregset(pid, NT_PRSTATUS, buf)?;

                let mut fpsimd = [0u8; 32 * 16 + 4 + 4 + 8];
                for i in 0..32 {
                    fpsimd[i * 16..i * 16 + 16].copy_from_slice(&r.v[i].to_ne_bytes());
                }
                fpsimd[512..516].copy_from_slice(&r.fpsr.to_ne_bytes());
                fpsimd[516..520].copy_from_slice(&r.fpcr.to_ne_bytes());
                self.setregset(pid, NT_PRFPREG, &mut fpsimd)
            }
        }
    }

    fn get_fp_registers(&self, tid: Pid, arch_platform: ArchPlatform) -> EngineResult<FpRegisterFile> {
        if !arch_platform.is_x86_family() {
            return Err(EngineError::UnsupportedArchitecture);
        }
        let (component_size, avx_offset) = self.xsave_layout.unwrap_or((FpRegisterFile::STANDARD_AVX_SIZE, 576));
        let mut fp = FpRegisterFile::new(component_size, avx_offset);
        self.getregset(tid, NT_X86_XSTATE, &mut fp.raw)?;
        Ok(fp)
    }

    fn set_fp_registers(&self, tid: Pid, fp: &FpRegisterFile) -> EngineResult<()> {
        let mut raw = fp.raw.clone();
        self.setregset(tid, NT_X86_XSTATE, &mut raw)
    }

    fn single_step(&self, tid: Pid) -> EngineResult<()> {
        ptrace::step(tid, None).map_err(|e| EngineError::from_errno("PTRACE_SINGLESTEP", e))
    }

    fn cont(&self, tid: Pid, signal: Option<i32>) -> EngineResult<()> {
        let sig = signal.map(|s| Signal::try_from(s).unwrap_or(Signal::SIGCONT));
        ptrace::cont(tid, sig).map_err(|e| EngineError::from_errno("PTRACE_CONT", e))
    }

    fn set_hw_debug_register(&self, tid: Pid, is_bp: bool, slot: u8, address: u64, ctrl: u32) -> EngineResult<()> {
        const NT_ARM_HW_BREAK: i32 = 0x402;
        const NT_ARM_HW_WATCH: i32 = 0x403;
        let nt_type = if is_bp { NT_ARM_HW_BREAK } else { NT_ARM_HW_WATCH };

        // dbg_hw_regset: { u32 dbg_info; u32 pad; struct { u64 addr; u32 ctrl; u32 pad; } dbg_regs[16]; }
        let mut buf = vec![0u8; 8 + 16 * 16];
        self.getregset(tid, nt_type, &mut buf)?;
        let entry_off = 8 + slot as usize * 16;
        buf[entry_off..entry_off + 8].copy_from_slice(&address.to_ne_bytes());
        buf[entry_off + 8..entry_off + 12].copy_from_slice(&ctrl.to_ne_bytes());
        self.setregset(tid, nt_type, &mut buf)
    }

    fn hit_hw_watchpoint_slot(&self, tid: Pid) -> EngineResult<Option<u8>> {
        // PTRACE_PEEKSIGINFO-free approximation: real kernels report the hit
        // watchpoint via the siginfo si_addr for SIGTRAP; callers that need
        // the slot index cross-reference this with their recorded
        // addresses. This engine asks `get_event_msg`-style plumbing isn't
        // available for this query, so we report "no match" here and let
        // the per-thread manager's address table resolve the hit from
        // `peek_user`-free polling the caller already did via siginfo.
        let _ = tid;
        Ok(None)
    }

    fn waitpid_raw(&self, pid: i32) -> EngineResult<(Pid, i32)> {
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::__WALL) };
        if ret == -1 {
            return Err(EngineError::from_errno("waitpid", Errno::last()));
        }
        Ok((Pid::from_raw(ret), status))
    }
}
