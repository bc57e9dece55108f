//! Real-time scheduling for I/O threads
//!
//! Best-effort: without the needed privilege the thread keeps its normal
//! policy and a warning is logged.

use thread_priority::{ThreadPriority, ThreadPriorityValue};

/// Priority the timing tools request when asked for real-time scheduling
pub const DEFAULT_REALTIME_PRIORITY: i32 = 3;

fn priority_value(priority: i32) -> Option<ThreadPriority> {
    let clamped = priority.clamp(0, 99) as u8;
    ThreadPriorityValue::try_from(clamped)
        .ok()
        .map(ThreadPriority::Crossplatform)
}

/// Move the calling thread to `SCHED_FIFO` at `priority`
///
/// Returns whether the policy was applied.
#[cfg(unix)]
pub fn promote_current_thread(priority: i32) -> bool {
    use thread_priority::unix::{
        set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
        ThreadSchedulePolicy,
    };

    let Some(value) = priority_value(priority) else {
        tracing::warn!(priority, "Real-time priority out of range");
        return false;
    };
    let policy = ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo);
    match set_thread_priority_and_policy(thread_native_id(), value, policy) {
        Ok(()) => {
            tracing::info!(priority, "I/O thread running with SCHED_FIFO");
            true
        }
        Err(e) => {
            tracing::warn!(
                priority,
                error = ?e,
                "Could not enable real-time scheduling; continuing with default policy"
            );
            false
        }
    }
}

#[cfg(not(unix))]
pub fn promote_current_thread(priority: i32) -> bool {
    let Some(value) = priority_value(priority) else {
        tracing::warn!(priority, "Real-time priority out of range");
        return false;
    };
    match thread_priority::set_current_thread_priority(value) {
        Ok(()) => {
            tracing::info!(priority, "I/O thread priority raised");
            true
        }
        Err(e) => {
            tracing::warn!(priority, error = ?e, "Could not raise thread priority");
            false
        }
    }
}

/// Apply the configured priority, if any
pub fn apply(priority: Option<i32>) -> bool {
    priority.map(promote_current_thread).unwrap_or(false)
}
