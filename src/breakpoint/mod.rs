//! Breakpoint engine (C3, spec.md §4.3).

pub mod hardware;
pub mod software;

pub use hardware::{BreakpointCallback, HardwareBreakpoint, HwBreakpointManager, WatchCondition};
pub use software::{breakpoint_size, install_breakpoint, SoftwareBreakpoint};
