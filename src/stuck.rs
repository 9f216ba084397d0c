//! Liveness / stuck detection (§4.5).
//!
//! Kept as a pure function of timestamps so tests can inject a fake clock,
//! per the design notes; [`crate::matcher::PcapCursor`] owns the mutable
//! `waiting_since` state and only calls into this module.

use std::time::Duration;

use crate::urb::UrbQueue;

/// The recording-time slack added before a wait is considered stuck,
/// absorbing long idle periods that are themselves part of the recording.
pub const SLACK: Duration = Duration::from_secs(2);

/// A snapshot of one queued URB, for the advisory dump in a stuck report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedUrbSnapshot {
    pub transfer_type: Option<u8>,
    pub endpoint: u8,
    pub buffer_length: u32,
    pub submitted: bool,
}

/// Everything §4.5 says a stuck report must contain.
#[derive(Debug, Clone)]
pub struct StuckReport {
    pub waited: Duration,
    pub expected: Duration,
    pub pending_event_type: char,
    pub pending_transfer_type: u8,
    pub pending_endpoint: u8,
    pub pending_length: u32,
    pub queued_urbs: Vec<QueuedUrbSnapshot>,
}

/// Decide whether `now - waiting_since` has exceeded the recording-time gap
/// (plus [`SLACK`]) since `last_matched_pkt_micros`, and if so, build the
/// report and the new `waiting_since` to install.
///
/// `record_time_micros` and `last_matched_pkt_micros` are both absolute
/// microsecond timestamps taken from the recording; their difference is the
/// expected wait the detector compares against.
#[must_use]
pub fn check(
    now: Duration,
    waiting_since: Duration,
    record_time_micros: i64,
    last_matched_pkt_micros: i64,
    pending: (char, u8, u8, u32),
    queue: &UrbQueue,
) -> Option<(StuckReport, Duration)> {
    let expected_micros = (record_time_micros - last_matched_pkt_micros).max(0) as u64;
    let expected = Duration::from_micros(expected_micros) + SLACK;
    let waited = now.saturating_sub(waiting_since);

    if waited <= expected {
        return None;
    }

    let (pending_event_type, pending_transfer_type, pending_endpoint, pending_length) = pending;
    let queued_urbs = queue
        .iter()
        .map(|entry| QueuedUrbSnapshot {
            transfer_type: entry.transfer_type().map(|t| t as u8),
            endpoint: entry.endpoint(),
            buffer_length: entry.buffer_length(),
            submitted: !entry.is_unsubmitted(),
        })
        .collect();

    let report = StuckReport {
        waited,
        expected,
        pending_event_type,
        pending_transfer_type,
        pending_endpoint,
        pending_length,
        queued_urbs,
    };

    Some((report, now))
}
