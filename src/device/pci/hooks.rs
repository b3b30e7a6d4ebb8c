//! Per-endpoint hook/filter registry.
//!
//! Policy modules attach callbacks at the request phase (before a URB is
//! submitted to the real device) and the reply phase (after the device
//! completes it). A callback matches on a buffer pattern and returns a
//! verdict; `Discard` causes the core to drop the request (request phase)
//! or to report the transfer as failed to the guest (reply phase) instead
//! of the real outcome.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Which stage of a transfer a hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Runs before the shadow request is handed to the real device.
    Request,
    /// Runs after the real device has completed the request.
    Reply,
}

/// What a hook callback decided to do with the transfer it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    /// Let the transfer proceed (or its completion be mirrored) unmodified.
    Pass,
    /// Drop the request, or report the completion as a failure to the guest.
    Discard,
}

/// The USB token/Packet ID a buffer was captured under: the Setup stage of a
/// control transfer, or the data stage of an IN or OUT transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbPid {
    Setup,
    In,
    Out,
}

/// One (pid, byte-offset, mask, value) constraint on the buffer a hook is
/// matched against. The comparison is always done on an 8-byte little-endian
/// word starting at `byte_offset`; a hook with no constraints matches every
/// buffer for its (phase, slot, endpoint).
///
/// The buffer passed to `run_phase` is always a single, already-assembled
/// contiguous slice (the nusb-based worker paths hand hooks a fully
/// materialized header or data buffer rather than raw TRB buffer-list
/// nodes), so `matches` does not walk across buffer-node boundaries the way
/// a pattern over a raw multi-node buffer list would have to.
#[derive(Debug, Clone, Copy)]
pub struct PatternMatch {
    pub pid: UsbPid,
    pub byte_offset: usize,
    pub mask: u64,
    pub value: u64,
}

impl PatternMatch {
    fn matches(self, pid: UsbPid, buffer: &[u8]) -> bool {
        if self.pid != pid {
            return false;
        }
        let end = self.byte_offset + 8;
        if end > buffer.len() {
            return false;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&buffer[self.byte_offset..end]);
        (u64::from_le_bytes(word) & self.mask) == (self.value & self.mask)
    }
}

pub type HookCallback = Arc<dyn Fn(&[u8]) -> HookVerdict + Send + Sync>;

/// An opaque handle returned by [`HookRegistry::register`], used to remove
/// the hook again via [`HookRegistry::unregister`].
pub type HookHandle = u64;

struct Hook {
    handle: HookHandle,
    phase: HookPhase,
    slot_id: u8,
    endpoint_id: u8,
    pattern: Vec<PatternMatch>,
    exec_once: bool,
    callback: HookCallback,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("handle", &self.handle)
            .field("phase", &self.phase)
            .field("slot_id", &self.slot_id)
            .field("endpoint_id", &self.endpoint_id)
            .field("pattern", &self.pattern)
            .field("exec_once", &self.exec_once)
            .finish_non_exhaustive()
    }
}

impl Hook {
    fn applies_to(
        &self,
        phase: HookPhase,
        slot_id: u8,
        endpoint_id: u8,
        pid: UsbPid,
        buffer: &[u8],
    ) -> bool {
        self.phase == phase
            && self.slot_id == slot_id
            && self.endpoint_id == endpoint_id
            && self
                .pattern
                .iter()
                .all(|pattern| pattern.matches(pid, buffer))
    }
}

/// Registry of hooks for one controller, matched by (phase, slot, endpoint,
/// buffer pattern).
///
/// Hooks run in insertion order, except that `try_exec_first` inserts at the
/// front of the list instead of the back.
#[derive(Debug, Default)]
pub struct HookRegistry {
    next_handle: AtomicU64,
    hooks: Mutex<Vec<Hook>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register a new hook.
    ///
    /// `try_exec_first` causes the hook to be inserted ahead of all other
    /// currently registered hooks rather than appended. `exec_once` causes
    /// the hook to be removed automatically after the first time its
    /// callback actually runs (i.e. after its pattern matched once).
    pub fn register(
        &self,
        phase: HookPhase,
        slot_id: u8,
        endpoint_id: u8,
        pattern: Vec<PatternMatch>,
        try_exec_first: bool,
        exec_once: bool,
        callback: HookCallback,
    ) -> HookHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let hook = Hook {
            handle,
            phase,
            slot_id,
            endpoint_id,
            pattern,
            exec_once,
            callback,
        };

        let mut hooks = self.hooks.lock().unwrap();
        if try_exec_first {
            hooks.insert(0, hook);
        } else {
            hooks.push(hook);
        }
        handle
    }

    pub fn unregister(&self, handle: HookHandle) {
        self.hooks.lock().unwrap().retain(|hook| hook.handle != handle);
    }

    /// Run every hook registered for `phase`/`slot_id`/`endpoint_id` whose
    /// pattern matches `buffer`, in order. Returns `Discard` as soon as any
    /// hook returns `Discard`; still runs every matching hook before
    /// returning (matching the "all hooks observe the transfer" semantics
    /// even when an earlier one already decided to drop it).
    pub fn run_phase(
        &self,
        phase: HookPhase,
        slot_id: u8,
        endpoint_id: u8,
        pid: UsbPid,
        buffer: &[u8],
    ) -> HookVerdict {
        let mut verdict = HookVerdict::Pass;
        let mut exhausted = Vec::new();

        let mut hooks = self.hooks.lock().unwrap();
        for hook in hooks.iter() {
            if !hook.applies_to(phase, slot_id, endpoint_id, pid, buffer) {
                continue;
            }
            if (hook.callback)(buffer) == HookVerdict::Discard {
                verdict = HookVerdict::Discard;
            }
            if hook.exec_once {
                exhausted.push(hook.handle);
            }
        }
        if !exhausted.is_empty() {
            hooks.retain(|hook| !exhausted.contains(&hook.handle));
        }

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn hook_without_pattern_matches_everything() {
        let registry = HookRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        registry.register(
            HookPhase::Request,
            1,
            2,
            vec![],
            false,
            false,
            Arc::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                HookVerdict::Pass
            }),
        );

        assert_eq!(
            registry.run_phase(HookPhase::Request, 1, 2, UsbPid::Out, &[0; 16]),
            HookVerdict::Pass
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        // Different endpoint: hook must not fire.
        registry.run_phase(HookPhase::Request, 1, 3, UsbPid::Out, &[0; 16]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pattern_gates_on_masked_value() {
        let registry = HookRegistry::new();
        registry.register(
            HookPhase::Reply,
            1,
            1,
            vec![PatternMatch {
                pid: UsbPid::In,
                byte_offset: 0,
                mask: 0xff,
                value: 0x42,
            }],
            false,
            false,
            Arc::new(|_| HookVerdict::Discard),
        );

        let mut matching_buffer = [0u8; 16];
        matching_buffer[0] = 0x42;
        assert_eq!(
            registry.run_phase(HookPhase::Reply, 1, 1, UsbPid::In, &matching_buffer),
            HookVerdict::Discard
        );

        let non_matching_buffer = [0u8; 16];
        assert_eq!(
            registry.run_phase(HookPhase::Reply, 1, 1, UsbPid::In, &non_matching_buffer),
            HookVerdict::Pass
        );

        // Same buffer, but tagged with a different pid: must not match.
        assert_eq!(
            registry.run_phase(HookPhase::Reply, 1, 1, UsbPid::Out, &matching_buffer),
            HookVerdict::Pass
        );
    }

    #[test]
    fn exec_once_removes_hook_after_first_match() {
        let registry = HookRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        registry.register(
            HookPhase::Request,
            1,
            1,
            vec![],
            false,
            true,
            Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                HookVerdict::Pass
            }),
        );

        registry.run_phase(HookPhase::Request, 1, 1, UsbPid::Setup, &[]);
        registry.run_phase(HookPhase::Request, 1, 1, UsbPid::Setup, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_exec_first_runs_before_existing_hooks() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_clone = order.clone();
        registry.register(
            HookPhase::Request,
            1,
            1,
            vec![],
            false,
            false,
            Arc::new(move |_| {
                order_clone.lock().unwrap().push("first-registered");
                HookVerdict::Pass
            }),
        );
        let order_clone = order.clone();
        registry.register(
            HookPhase::Request,
            1,
            1,
            vec![],
            true,
            false,
            Arc::new(move |_| {
                order_clone.lock().unwrap().push("try-exec-first");
                HookVerdict::Pass
            }),
        );

        registry.run_phase(HookPhase::Request, 1, 1, UsbPid::Setup, &[]);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["try-exec-first", "first-registered"]
        );
    }
}
