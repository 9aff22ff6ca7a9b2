//! Software breakpoints (C3, spec.md §4.3): code patching with a trap
//! byte/word plus the step-over discipline required to resume after a hit.

use crate::arch::ArchPlatform;
use crate::error::EngineResult;
use crate::ptrace_ops::PtraceOps;
use log::debug;
use nix::unistd::Pid;

/// One trap byte on x86/x86-64; `BRK #0` (4 bytes) on aarch64.
pub fn breakpoint_size(arch_platform: ArchPlatform) -> u64 {
    if arch_platform.is_x86_family() {
        1
    } else {
        4
    }
}

/// Patches `original` with the architecture's trap instruction, preserving
/// every other byte of the containing machine word.
pub fn install_breakpoint(original: u64, arch_platform: ArchPlatform) -> u64 {
    if arch_platform.is_x86_family() {
        (original & !0xFFu64) | 0xCC
    } else {
        // BRK #0 = 0xD4200000, little-endian in the low 4 bytes of the word.
        (original & !0xFFFF_FFFFu64) | 0xD420_0000
    }
}

#[derive(Debug)]
pub struct SoftwareBreakpoint {
    pub address: u64,
    pub original_word: u64,
    pub patched_word: u64,
    pub enabled: bool,
    pub hit_count: u64,
    /// Threads that hit this breakpoint and must single-step past it before
    /// it is rearmed on their behalf.
    pub linked_thread_ids: Vec<Pid>,
}

impl SoftwareBreakpoint {
    pub fn install<P: PtraceOps>(
        ptrace: &P,
        pid: Pid,
        address: u64,
        arch_platform: ArchPlatform,
    ) -> EngineResult<SoftwareBreakpoint> {
        let original_word = ptrace.peek_data(pid, address)?;
        let patched_word = install_breakpoint(original_word, arch_platform);
        ptrace.poke_data(pid, address, patched_word)?;
        debug!("installed software breakpoint at {address:#x} in {pid}");
        Ok(SoftwareBreakpoint {
            address,
            original_word,
            patched_word,
            enabled: true,
            hit_count: 0,
            linked_thread_ids: Vec::new(),
        })
    }

    pub fn disable<P: PtraceOps>(&mut self, ptrace: &P, pid: Pid) -> EngineResult<()> {
        ptrace.poke_data(pid, self.address, self.original_word)?;
        self.enabled = false;
        debug!("disarmed software breakpoint at {:#x} in {pid}", self.address);
        Ok(())
    }

    /// Re-patches the trap word and marks the breakpoint enabled again,
    /// completing the `disable` -> single-step -> `rearm` step-over pairing.
    pub fn rearm<P: PtraceOps>(&mut self, ptrace: &P, pid: Pid) -> EngineResult<()> {
        ptrace.poke_data(pid, self.address, self.patched_word)?;
        self.enabled = true;
        debug!("rearmed software breakpoint at {:#x} in {pid}", self.address);
        Ok(())
    }

    /// True while `byte_at(address)` (as last observed) equals the
    /// architecture's trap encoding — testable property 1.
    pub fn is_patched(&self, arch_platform: ArchPlatform) -> bool {
        let word = self.patched_word;
        if arch_platform.is_x86_family() {
            word & 0xFF == 0xCC
        } else {
            word & 0xFFFF_FFFF == 0xD420_0000
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_patches_low_byte_only() {
        let original = 0x1122_3344_5566_7788;
        let patched = install_breakpoint(original, ArchPlatform::Amd64OnX86_64);
        assert_eq!(patched, 0x1122_3344_5566_77CC);
    }

    #[test]
    fn aarch64_patches_low_word_only() {
        let original = 0x1122_3344_5566_7788;
        let patched = install_breakpoint(original, ArchPlatform::Aarch64OnAarch64);
        assert_eq!(patched, 0x1122_3344_D420_0000);
    }

    #[test]
    fn breakpoint_sizes_match_arch() {
        assert_eq!(breakpoint_size(ArchPlatform::Amd64OnX86_64), 1);
        assert_eq!(breakpoint_size(ArchPlatform::I386OnI686), 1);
        assert_eq!(breakpoint_size(ArchPlatform::Aarch64OnAarch64), 4);
    }
}
