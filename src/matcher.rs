//! The pcap cursor and matcher: the core algorithm of §4.4.

use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::constants::TransferType;
use crate::error::ReplayError;
use crate::pcap::{PcapRecord, PcapSource};
use crate::stuck;
use crate::urb::{BusDeviceFilter, UrbEntry, UrbQueue};

/// The one-record pcap look-ahead plus the timestamps that drive stuck
/// detection (§3 "Pcap cursor").
pub struct PcapCursor {
    source: Box<dyn PcapSource>,
    filter: BusDeviceFilter,
    cur_record: Option<PcapRecord>,
    last_matched_pkt_micros: i64,
    waiting_since: std::time::Duration,
    clock: Box<dyn Clock>,
    records_consumed: u64,
    records_skipped: u64,
}

impl std::fmt::Debug for PcapCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapCursor")
            .field("filter", &self.filter)
            .field("has_cur_record", &self.cur_record.is_some())
            .finish()
    }
}

impl PcapCursor {
    pub fn new(source: Box<dyn PcapSource>, filter: BusDeviceFilter, clock: Box<dyn Clock>) -> Self {
        let waiting_since = clock.now();
        Self {
            source,
            filter,
            cur_record: None,
            last_matched_pkt_micros: 0,
            waiting_since,
            clock,
            records_consumed: 0,
            records_skipped: 0,
        }
    }

    /// Total pcap records pulled from the source so far (§4.7).
    #[must_use]
    pub const fn records_consumed(&self) -> u64 {
        self.records_consumed
    }

    /// Of those, how many were dropped for not matching the bus/device
    /// filter (§4.7).
    #[must_use]
    pub const fn records_skipped(&self) -> u64 {
        self.records_skipped
    }

    /// Pull the next record that passes the bus/device filter, if the
    /// look-ahead is currently empty (§4.4 step: "bus/device filter").
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying [`PcapSource`].
    fn fill(&mut self) -> Result<(), ReplayError> {
        while self.cur_record.is_none() {
            let Some(record) = self.source.next_record()? else {
                return Ok(());
            };
            self.records_consumed += 1;
            let header = &record.header;
            if !self.filter.matches(header.bus_id, header.device_address) {
                self.records_skipped += 1;
                trace!(
                    "skipping record id={} bus={} device={} outside filter",
                    header.id, header.bus_id, header.device_address
                );
                continue;
            }
            self.cur_record = Some(record);
            self.waiting_since = self.clock.now();
        }
        Ok(())
    }

    fn run_stuck_check(&mut self, queue: &UrbQueue) {
        let Some(record) = &self.cur_record else {
            return;
        };
        let now = self.clock.now();
        let pending = (
            record.header.event_type,
            record.header.transfer_type,
            record.header.endpoint_number,
            record.header.urb_len,
        );
        let record_time_micros = record.header.time.seconds * 1_000_000 + i64::from(record.header.time.microseconds);
        if let Some((report, new_waiting_since)) = stuck::check(
            now,
            self.waiting_since,
            record_time_micros,
            self.last_matched_pkt_micros,
            pending,
            queue,
        ) {
            warn!(
                waited_ms = report.waited.as_millis() as u64,
                expected_ms = report.expected.as_millis() as u64,
                pending_event_type = %report.pending_event_type,
                pending_transfer_type = report.pending_transfer_type,
                pending_endpoint = report.pending_endpoint,
                pending_length = report.pending_length,
                "replay appears stuck waiting for the next matching URB"
            );
            for urb in &report.queued_urbs {
                debug!(
                    transfer_type = ?urb.transfer_type,
                    endpoint = urb.endpoint,
                    buffer_length = urb.buffer_length,
                    submitted = urb.submitted,
                    "queued URB"
                );
            }
            self.waiting_since = new_waiting_since;
        }
    }

    fn mark_matched(&mut self, record_time: &crate::pcap::RecordTime) {
        self.last_matched_pkt_micros = record_time.seconds * 1_000_000 + i64::from(record_time.microseconds);
    }
}

/// True if a transfer type value is control, used by the "cannot reap now"
/// fallback that silently discards kernel-internal control submits.
fn is_control(transfer_type: u8) -> bool {
    TransferType::from_raw(transfer_type) == Some(TransferType::Control)
}

/// Advance the cursor and attempt to produce one reapable URB (§4.4).
///
/// Returns `Ok(None)` when nothing is reapable right now (the dispatcher
/// then completes the reap with `EAGAIN`); the look-ahead record, if any, is
/// left in place so a later call can retry against it.
///
/// # Errors
///
/// Propagates errors from the underlying [`PcapSource`], reports
/// [`ReplayError::UnsupportedEventType`] for an 'E' record (matching the
/// source's construction-time assumption failure for error-event URBs), and
/// reports [`ReplayError::UnsupportedStartFrame`] for a completion record
/// whose `start_frame` is non-zero, so recordings that would otherwise
/// silently mis-replay fail loudly instead.
pub fn advance(cursor: &mut PcapCursor, queue: &mut UrbQueue) -> Result<Option<UrbEntry>, ReplayError> {
    loop {
        cursor.fill()?;
        if cursor.cur_record.is_none() {
            return Ok(None);
        }
        cursor.run_stuck_check(queue);
        let record = cursor.cur_record.take().expect("checked above");

        match record.header.event_type {
            'S' => match try_match_submit(queue, &record) {
                MatchOutcome::Bound => {
                    cursor.mark_matched(&record.header.time);
                    // Record consumed; continue the outer loop against the next one.
                    continue;
                }
                MatchOutcome::NoMatch => {
                    if is_control(record.header.transfer_type) {
                        debug!(
                            "discarding unmatched control submit id={} (kernel-internal)",
                            record.header.id
                        );
                        continue;
                    }
                    trace!(
                        "no queued URB matches submit id={}; leaving it as the look-ahead",
                        record.header.id
                    );
                    cursor.cur_record = Some(record);
                    return Ok(None);
                }
            },
            'C' => {
                if let Some(entry) = queue.take_by_pcap_id(record.header.id) {
                    if record.header.data_len > 0 {
                        entry.write_buffer(&record.payload);
                    }
                    if record.header.start_frame != 0 {
                        return Err(ReplayError::UnsupportedStartFrame {
                            id: record.header.id,
                            start_frame: record.header.start_frame,
                        });
                    }
                    entry.complete_from_record(record.header.status, record.header.urb_len, record.header.start_frame);
                    cursor.mark_matched(&record.header.time);
                    return Ok(Some(entry));
                }
                debug!(
                    "completion id={} matches no queued URB (kernel-internal transfer)",
                    record.header.id
                );
                continue;
            }
            'E' => {
                return Err(ReplayError::UnsupportedEventType { event_type: 'E' });
            }
            other => {
                return Err(ReplayError::UnsupportedEventType { event_type: other });
            }
        }
    }
}

enum MatchOutcome {
    Bound,
    NoMatch,
}

/// Try to bind `record` (a submit) to an unsubmitted queued URB, per the
/// structural-fingerprint rules of §4.4.
fn try_match_submit(queue: &mut UrbQueue, record: &PcapRecord) -> MatchOutcome {
    let header = &record.header;
    for entry in queue.iter_mut() {
        if !entry.is_unsubmitted() {
            continue;
        }
        if entry.transfer_type().map(|t| t as u8) != Some(header.transfer_type) {
            continue;
        }
        if entry.endpoint() != header.endpoint_number {
            continue;
        }
        if entry.buffer_length() != header.urb_len {
            continue;
        }
        if header.data_len > 0 {
            if !entry.is_out() {
                continue;
            }
            if header.data_len != entry.buffer_length() {
                continue;
            }
            if entry.buffer_bytes() != record.payload {
                continue;
            }
        }
        entry.mark_submitted(header.id);
        return MatchOutcome::Bound;
    }
    MatchOutcome::NoMatch
}

#[cfg(test)]
use crate::memory::HeapClientMemory;
#[cfg(test)]
use std::collections::VecDeque;

#[cfg(test)]
#[derive(Debug)]
struct ScriptedSource {
    records: VecDeque<PcapRecord>,
}

#[cfg(test)]
impl PcapSource for ScriptedSource {
    fn next_record(&mut self) -> Result<Option<PcapRecord>, ReplayError> {
        Ok(self.records.pop_front())
    }
}

#[cfg(test)]
fn submit_record(id: u64, transfer_type: u8, endpoint: u8, urb_len: u32, data: &[u8]) -> PcapRecord {
    use crate::pcap::{RecordTime, UsbRecordHeader};
    PcapRecord {
        header: UsbRecordHeader {
            id,
            event_type: 'S',
            transfer_type,
            endpoint_number: endpoint,
            device_address: 5,
            bus_id: 1,
            time: RecordTime { seconds: 0, microseconds: 0 },
            status: 0,
            urb_len,
            data_len: data.len() as u32,
            start_frame: 0,
        },
        payload: data.to_vec(),
    }
}

#[cfg(test)]
fn completion_record(id: u64, status: i32, urb_len: u32, data: &[u8]) -> PcapRecord {
    use crate::pcap::{RecordTime, UsbRecordHeader};
    PcapRecord {
        header: UsbRecordHeader {
            id,
            event_type: 'C',
            transfer_type: 0,
            endpoint_number: 0,
            device_address: 5,
            bus_id: 1,
            time: RecordTime { seconds: 0, microseconds: 0 },
            status,
            urb_len,
            data_len: data.len() as u32,
            start_frame: 0,
        },
        payload: data.to_vec(),
    }
}

#[cfg(test)]
fn make_urb(heap: &HeapClientMemory, transfer_type: u8, endpoint: u8, buffer_length: u32) -> UrbEntry {
    use crate::constants::urb_offsets;
    let mut urb_bytes = vec![0u8; 56];
    urb_bytes[urb_offsets::TYPE] = transfer_type;
    urb_bytes[urb_offsets::ENDPOINT] = endpoint;
    urb_bytes[urb_offsets::BUFFER_LENGTH..urb_offsets::BUFFER_LENGTH + 4].copy_from_slice(&buffer_length.to_le_bytes());
    let urb_addr = heap.alloc(&urb_bytes);
    let buffer_addr = heap.alloc(&vec![0u8; buffer_length as usize]);
    let urb_view = heap.resolve(urb_addr, 56, true, true).unwrap();
    let buffer_view = heap.resolve(buffer_addr, buffer_length as usize, true, true).unwrap();
    UrbEntry::new(urb_view, buffer_view)
}

#[cfg(test)]
fn make_out_urb(heap: &HeapClientMemory, transfer_type: u8, endpoint: u8, buffer: &[u8]) -> UrbEntry {
    use crate::constants::urb_offsets;
    let mut urb_bytes = vec![0u8; 56];
    urb_bytes[urb_offsets::TYPE] = transfer_type;
    urb_bytes[urb_offsets::ENDPOINT] = endpoint;
    urb_bytes[urb_offsets::BUFFER_LENGTH..urb_offsets::BUFFER_LENGTH + 4]
        .copy_from_slice(&(buffer.len() as u32).to_le_bytes());
    let urb_addr = heap.alloc(&urb_bytes);
    let buffer_addr = heap.alloc(buffer);
    let urb_view = heap.resolve(urb_addr, 56, true, true).unwrap();
    let buffer_view = heap.resolve(buffer_addr, buffer.len(), true, true).unwrap();
    UrbEntry::new(urb_view, buffer_view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn happy_in_transfer_round_trip() {
        let heap = HeapClientMemory::new();
        let mut queue = UrbQueue::new();
        queue.submit(make_urb(&heap, 1, 0x82, 8));

        let records = VecDeque::from(vec![
            submit_record(7, 1, 0x82, 8, &[]),
            completion_record(7, 0, 8, &[1, 2, 3, 4, 5, 6, 7, 8]),
        ]);
        let source: Box<dyn PcapSource> = Box::new(ScriptedSource { records });
        let mut cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));

        let result = advance(&mut cursor, &mut queue).unwrap();
        let urb = result.expect("should reap the completed URB");
        assert_eq!(urb.buffer_bytes(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn happy_out_transfer_with_byte_match() {
        let heap = HeapClientMemory::new();
        let mut queue = UrbQueue::new();
        queue.submit(make_out_urb(&heap, 3, 0x01, &[0xAA, 0xBB, 0xCC, 0xDD]));

        let records = VecDeque::from(vec![
            submit_record(9, 3, 0x01, 4, &[0xAA, 0xBB, 0xCC, 0xDD]),
            completion_record(9, 0, 4, &[]),
        ]);
        let source: Box<dyn PcapSource> = Box::new(ScriptedSource { records });
        let mut cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));

        let result = advance(&mut cursor, &mut queue).unwrap();
        assert!(result.is_some(), "should reap the completed URB");
        assert!(queue.is_empty(), "the matched URB should have left the queue");
    }

    #[test]
    fn out_mismatch_keeps_record_pending() {
        let heap = HeapClientMemory::new();
        let mut queue = UrbQueue::new();
        queue.submit(make_out_urb(&heap, 3, 0x01, &[0x00, 0x00, 0x00, 0x00]));

        let records = VecDeque::from(vec![submit_record(9, 3, 0x01, 4, &[0xAA, 0xBB, 0xCC, 0xDD])]);
        let source: Box<dyn PcapSource> = Box::new(ScriptedSource { records });
        let mut cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));

        let result = advance(&mut cursor, &mut queue).unwrap();
        assert!(result.is_none());
        assert!(cursor.cur_record.is_some(), "record must stay in the look-ahead");

        // Retrying without changing anything still yields no match.
        let result2 = advance(&mut cursor, &mut queue).unwrap();
        assert!(result2.is_none());
    }

    #[test]
    fn unmatched_control_submit_is_discarded() {
        let mut queue = UrbQueue::new();
        let records = VecDeque::from(vec![submit_record(1, 2, 0x80, 8, &[])]);
        let source: Box<dyn PcapSource> = Box::new(ScriptedSource { records });
        let mut cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));

        let result = advance(&mut cursor, &mut queue).unwrap();
        assert!(result.is_none());
        assert!(cursor.cur_record.is_none(), "control submit should be discarded, not retained");
    }

    #[test]
    fn completion_with_no_owner_is_skipped() {
        let mut queue = UrbQueue::new();
        let records = VecDeque::from(vec![completion_record(42, 0, 0, &[])]);
        let source: Box<dyn PcapSource> = Box::new(ScriptedSource { records });
        let mut cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));

        let result = advance(&mut cursor, &mut queue).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn records_outside_filter_are_skipped() {
        let mut queue = UrbQueue::new();
        let mut outside = submit_record(1, 1, 0x82, 8, &[]);
        outside.header.device_address = 9;
        let records = VecDeque::from(vec![outside]);
        let source: Box<dyn PcapSource> = Box::new(ScriptedSource { records });
        let mut cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));

        let result = advance(&mut cursor, &mut queue).unwrap();
        assert!(result.is_none());
        assert!(cursor.cur_record.is_none());
        assert_eq!(cursor.records_consumed(), 1);
        assert_eq!(cursor.records_skipped(), 1);
    }
}

/// Property tests over arbitrary submit records against a single queued
/// URB, checking the quantified fingerprint-matching invariant of §4.4/§8:
/// a submit record binds the queued URB if and only if transfer type,
/// endpoint, and buffer length all agree, and `advance` never panics
/// regardless of the generated field combination.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::clock::FakeClock;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fingerprint_match_is_exact(
            record_transfer_type in 0u8..4,
            record_endpoint in 0u8..4,
            record_urb_len in 0u32..16,
            queued_transfer_type in 0u8..4,
            queued_endpoint in 0u8..4,
            queued_urb_len in 0u32..16,
        ) {
            let heap = HeapClientMemory::new();
            let mut queue = UrbQueue::new();
            queue.submit(make_urb(&heap, queued_transfer_type, queued_endpoint, queued_urb_len));

            let record = submit_record(1, record_transfer_type, record_endpoint, record_urb_len, &[]);
            let records = VecDeque::from(vec![record]);
            let source: Box<dyn PcapSource> = Box::new(ScriptedSource { records });
            let mut cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));

            let before = queue.len();
            let result = advance(&mut cursor, &mut queue);
            prop_assert!(result.is_ok());
            let after = queue.len();

            let fingerprint_matches = record_transfer_type == queued_transfer_type
                && record_endpoint == queued_endpoint
                && record_urb_len == queued_urb_len;

            if fingerprint_matches {
                prop_assert_eq!(after, before - 1, "a matching fingerprint must bind and remove the queued URB");
            } else {
                prop_assert_eq!(after, before, "a non-matching fingerprint must leave the queue untouched");
            }
        }
    }
}
