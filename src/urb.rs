//! The URB queue: an ordered collection of in-flight URBs owned by the
//! client, plus the discard list (§3, §5).

use std::collections::VecDeque;

use crate::constants::{endpoint_is_out, urb_offsets, TransferType};
use crate::memory::ClientView;

/// A `(bus, device)` pair identifying which captured device this handler
/// replays traffic for.
///
/// Widths match `usb_header_mmapped::bus_id` (u16) and `::device_address`
/// (u8) so no truncation occurs when comparing a record's addressing
/// against the configured filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusDeviceFilter {
    pub bus: u16,
    pub device: u8,
}

impl BusDeviceFilter {
    #[must_use]
    pub const fn new(bus: u16, device: u8) -> Self {
        Self { bus, device }
    }

    #[must_use]
    pub const fn matches(&self, bus: u16, device: u8) -> bool {
        self.bus == bus && self.device == device
    }
}

/// One in-flight URB: the client's view over its `usb_devfs_urb` structure,
/// a view over its data buffer, and the bookkeeping the matcher needs.
#[derive(Debug, Clone)]
pub struct UrbEntry {
    /// Identity: the client pointer value passed to `SUBMITURB`.
    client_address: u64,
    urb_view: ClientView,
    buffer_view: ClientView,
    /// Zero until a submit record binds this URB; then the matched record's id.
    pcap_id: u64,
}

impl UrbEntry {
    #[must_use]
    pub fn new(urb_view: ClientView, buffer_view: ClientView) -> Self {
        Self {
            client_address: urb_view.client_addr(),
            urb_view,
            buffer_view,
            pcap_id: 0,
        }
    }

    #[must_use]
    pub const fn client_address(&self) -> u64 {
        self.client_address
    }

    #[must_use]
    pub const fn pcap_id(&self) -> u64 {
        self.pcap_id
    }

    /// A queued-but-unsubmitted (not yet bound to a recorded submit) URB.
    #[must_use]
    pub const fn is_unsubmitted(&self) -> bool {
        self.pcap_id == 0
    }

    pub fn mark_submitted(&mut self, pcap_id: u64) {
        debug_assert_ne!(pcap_id, 0, "pcap_id 0 means unsubmitted");
        self.pcap_id = pcap_id;
    }

    #[must_use]
    pub fn transfer_type(&self) -> Option<TransferType> {
        TransferType::from_raw(self.urb_view.read_u8(urb_offsets::TYPE))
    }

    #[must_use]
    pub fn endpoint(&self) -> u8 {
        self.urb_view.read_u8(urb_offsets::ENDPOINT)
    }

    #[must_use]
    pub fn buffer_length(&self) -> u32 {
        self.urb_view.read_u32_le(urb_offsets::BUFFER_LENGTH)
    }

    #[must_use]
    pub fn buffer_bytes(&self) -> Vec<u8> {
        self.buffer_view.read()
    }

    /// Whether `endpoint()`'s direction bit marks this an outbound transfer.
    #[must_use]
    pub fn is_out(&self) -> bool {
        endpoint_is_out(self.endpoint())
    }

    /// Copy `data` into the client's buffer view and mark it dirty.
    pub fn write_buffer(&self, data: &[u8]) {
        self.buffer_view.write_bytes(0, data);
        self.buffer_view.dirty(false);
    }

    /// Write back the fields a completion record supplies, per §4.4.
    pub fn complete_from_record(&self, status: i32, actual_length: u32, start_frame: i32) {
        self.urb_view.write_i32_le(urb_offsets::STATUS, status);
        self.urb_view.write_u32_le(urb_offsets::ACTUAL_LENGTH, actual_length);
        self.urb_view.write_i32_le(urb_offsets::START_FRAME, start_frame);
        self.urb_view.dirty(false);
    }

    /// Write `-ENOENT` into `status` for a drained discard, per §4.3 step 1.
    pub fn complete_discarded(&self, negative_status: i32) {
        self.urb_view.write_i32_le(urb_offsets::STATUS, negative_status);
        self.urb_view.dirty(false);
    }
}

/// The ordered queue of in-flight URBs plus the discard list (§3, §5).
///
/// A `client_address` appears in at most one of the two collections at any
/// time; `submit`/`discard`/`take_*` enforce that invariant.
#[derive(Debug, Default)]
pub struct UrbQueue {
    queue: VecDeque<UrbEntry>,
    discarded: VecDeque<UrbEntry>,
}

impl UrbQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, entry: UrbEntry) {
        self.queue.push_back(entry);
    }

    /// Oldest-first iterator over currently-queued (not discarded) URBs.
    pub fn iter(&self) -> impl Iterator<Item = &UrbEntry> {
        self.queue.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UrbEntry> {
        self.queue.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Move the queued entry with this client address onto the discard
    /// list, preserving discard order. Returns `false` if not found.
    pub fn discard(&mut self, client_address: u64) -> bool {
        let Some(index) = self
            .queue
            .iter()
            .position(|entry| entry.client_address() == client_address)
        else {
            return false;
        };
        let entry = self.queue.remove(index).expect("index just found");
        self.discarded.push_back(entry);
        true
    }

    #[must_use]
    pub fn has_discarded(&self) -> bool {
        !self.discarded.is_empty()
    }

    #[must_use]
    pub fn discarded_len(&self) -> usize {
        self.discarded.len()
    }

    /// Take the oldest discarded entry, if any (§4.3 step 1).
    pub fn take_oldest_discarded(&mut self) -> Option<UrbEntry> {
        self.discarded.pop_front()
    }

    /// Remove the queued entry whose `pcap_id` equals `pcap_id` (§4.4,
    /// completion record binding).
    pub fn take_by_pcap_id(&mut self, pcap_id: u64) -> Option<UrbEntry> {
        let index = self.queue.iter().position(|entry| entry.pcap_id() == pcap_id)?;
        self.queue.remove(index)
    }
}
