//! Engine configuration, grounded on `isgasho-rd`'s `flags::Flags` shape
//! (`src/flags.rs`): a plain struct of knobs built once and handed to the
//! engine explicitly, rather than a process-wide `lazy_static!` singleton —
//! see DESIGN.md and spec.md §9 for why the singleton form was dropped.

use crate::arch::{host_platform, Architecture, Platform};

/// How the engine should learn the XSAVE `component_size`/`avx_offset` pair
/// for a given thread's extended register state (spec §4.2, §6).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum XsaveLayoutSource {
    /// Query CPUID leaf 0Dh on the host at provisioning time.
    Cpuid,
    /// Trust the header already present on the per-thread FP register blob
    /// (set by whoever populated it, e.g. a prior `PTRACE_GETREGSET` call).
    TrustBlobHeader,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub architecture: Architecture,
    pub platform: Platform,
    pub xsave_layout_source: XsaveLayoutSource,
}

impl EngineConfig {
    pub fn new(architecture: Architecture) -> EngineConfig {
        EngineConfig {
            architecture,
            platform: host_platform(),
            xsave_layout_source: XsaveLayoutSource::Cpuid,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> EngineConfig {
        self.platform = platform;
        self
    }

    pub fn with_xsave_layout_source(mut self, source: XsaveLayoutSource) -> EngineConfig {
        self.xsave_layout_source = source;
        self
    }
}
