//! Signal hooks (spec.md §3 "Signal hook", §4.4d).

use crate::thread::Thread;

pub type SignalCallback = Box<dyn FnMut(&mut Thread, i32)>;

pub struct SignalHook {
    pub signal_number: i32,
    pub callback: Option<SignalCallback>,
    pub hook_hijack: bool,
    pub enabled: bool,
    pub hit_count: u64,
}

impl SignalHook {
    pub fn new(signal_number: i32) -> SignalHook {
        SignalHook {
            signal_number,
            callback: None,
            hook_hijack: true,
            enabled: true,
            hit_count: 0,
        }
    }
}
