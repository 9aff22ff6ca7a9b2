//! Architecture / host-platform identification (spec §6 "Platform detection").

use crate::error::{EngineError, EngineResult};

/// The architecture requested for the tracee.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Architecture {
    Amd64,
    I386,
    Aarch64,
}

/// The runtime platform of the host kernel/CPU.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Platform {
    X86_64,
    I686,
    Aarch64,
}

/// The four valid (architecture, platform) pairs a register/breakpoint
/// holder can be provisioned for. `I386OnAmd64` is the compatibility-mode
/// case: a 32-bit tracee running on a 64-bit kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArchPlatform {
    Amd64OnX86_64,
    I386OnAmd64,
    I386OnI686,
    Aarch64OnAarch64,
}

impl ArchPlatform {
    pub fn resolve(architecture: Architecture, platform: Platform) -> EngineResult<ArchPlatform> {
        use Architecture::*;
        use Platform::*;
        match (architecture, platform) {
            (Amd64, X86_64) => Ok(ArchPlatform::Amd64OnX86_64),
            (I386, X86_64) => Ok(ArchPlatform::I386OnAmd64),
            (I386, I686) => Ok(ArchPlatform::I386OnI686),
            (Aarch64, Aarch64) => Ok(ArchPlatform::Aarch64OnAarch64),
            _ => Err(EngineError::UnsupportedPlatform),
        }
    }

    pub fn architecture(self) -> Architecture {
        match self {
            ArchPlatform::Amd64OnX86_64 => Architecture::Amd64,
            ArchPlatform::I386OnAmd64 | ArchPlatform::I386OnI686 => Architecture::I386,
            ArchPlatform::Aarch64OnAarch64 => Architecture::Aarch64,
        }
    }

    pub fn is_x86_family(self) -> bool {
        !matches!(self, ArchPlatform::Aarch64OnAarch64)
    }
}

/// Detects the host platform this engine process is itself running on. Used
/// as the default `platform` in `EngineConfig` when the caller doesn't
/// override it (e.g. for cross-architecture debugging under an emulator).
pub fn host_platform() -> Platform {
    if cfg!(target_arch = "x86_64") {
        Platform::X86_64
    } else if cfg!(target_arch = "x86") {
        Platform::I686
    } else if cfg!(target_arch = "aarch64") {
        Platform::Aarch64
    } else {
        // Best-effort default; EngineConfig construction will fail loudly
        // via UnsupportedPlatform if this is wrong for the requested arch.
        Platform::X86_64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_pairs_resolve() {
        assert_eq!(
            ArchPlatform::resolve(Architecture::Amd64, Platform::X86_64).unwrap(),
            ArchPlatform::Amd64OnX86_64
        );
        assert_eq!(
            ArchPlatform::resolve(Architecture::I386, Platform::X86_64).unwrap(),
            ArchPlatform::I386OnAmd64
        );
        assert_eq!(
            ArchPlatform::resolve(Architecture::I386, Platform::I686).unwrap(),
            ArchPlatform::I386OnI686
        );
        assert_eq!(
            ArchPlatform::resolve(Architecture::Aarch64, Platform::Aarch64).unwrap(),
            ArchPlatform::Aarch64OnAarch64
        );
    }

    #[test]
    fn invalid_pairs_fail() {
        assert!(matches!(
            ArchPlatform::resolve(Architecture::Aarch64, Platform::X86_64),
            Err(EngineError::UnsupportedPlatform)
        ));
        assert!(matches!(
            ArchPlatform::resolve(Architecture::Amd64, Platform::I686),
            Err(EngineError::UnsupportedPlatform)
        ));
    }
}
