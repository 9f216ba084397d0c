//! Opcode routing for a single ioctl call (§4.1, §4.2, §4.3).

use tracing::{trace, warn};

use crate::constants::{
    self, urb_offsets, CLAIMINTERFACE, CLEAR_HALT, DISCARDURB, GET_CAPABILITIES, REAPURB,
    REAPURBNDELAY, RELEASEINTERFACE, RESET, RESETEP, SUBMITURB,
};
use crate::errno::Errno;
use crate::error::ReplayError;
use crate::matcher::{self, PcapCursor};
use crate::memory::ClientMemory;
use crate::urb::UrbEntry;
use crate::urb::UrbQueue;

/// What the dispatcher needs from the transport carrying a single ioctl call.
///
/// An implementation owns the actual ioctl request/response wire format;
/// this core only asks for the request code, the argument's client address,
/// access to client memory, and a way to report completion.
pub trait IoctlClient {
    /// The ioctl request code (e.g. [`crate::constants::SUBMITURB`]).
    fn request(&self) -> u64;

    /// The client address of the ioctl argument, if any (`None` for
    /// `DISCARDURB`/`RESET`, which carry their argument out-of-band or not at all).
    fn arg_addr(&self) -> Option<u64>;

    /// Access to the client's address space.
    fn memory(&self) -> &dyn ClientMemory;

    /// Report the ioctl's return value: `0` or a positive byte count on
    /// success, a negative `errno` on failure.
    fn complete(&mut self, result: i32);
}

/// Routes ioctl calls against a recording-backed queue and cursor (§4.1).
#[derive(Debug)]
pub struct Dispatcher {
    queue: UrbQueue,
    cursor: PcapCursor,
    urbs_submitted: u64,
    urbs_reaped: u64,
    urbs_discarded: u64,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(queue: UrbQueue, cursor: PcapCursor) -> Self {
        Self {
            queue,
            cursor,
            urbs_submitted: 0,
            urbs_reaped: 0,
            urbs_discarded: 0,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &UrbQueue {
        &self.queue
    }

    #[must_use]
    pub const fn cursor(&self) -> &PcapCursor {
        &self.cursor
    }

    /// Cumulative count of `SUBMITURB` calls that queued a URB (§4.7).
    #[must_use]
    pub const fn urbs_submitted(&self) -> u64 {
        self.urbs_submitted
    }

    /// Cumulative count of URBs handed back to the client via `REAPURB`/
    /// `REAPURBNDELAY` (§4.7).
    #[must_use]
    pub const fn urbs_reaped(&self) -> u64 {
        self.urbs_reaped
    }

    /// Cumulative count of `DISCARDURB` calls that moved a URB onto the
    /// discard list (§4.7).
    #[must_use]
    pub const fn urbs_discarded(&self) -> u64 {
        self.urbs_discarded
    }

    /// Handle one ioctl call end to end.
    ///
    /// Returns `Ok(true)` once `client.complete` has been called. Returns
    /// `Ok(false)` without calling `complete` when the argument could not be
    /// resolved against client memory (§4.1, §7 plane 2: "unhandled"), so the
    /// framework can fall through to another handler.
    ///
    /// # Errors
    ///
    /// Propagates a fatal [`ReplayError`] only for recording-format problems
    /// the matcher cannot recover from (an unsupported event type).
    pub fn handle(&mut self, client: &mut dyn IoctlClient) -> Result<bool, ReplayError> {
        let request = client.request();
        match request {
            GET_CAPABILITIES => Ok(self.handle_get_capabilities(client)),
            CLAIMINTERFACE | RELEASEINTERFACE | CLEAR_HALT | RESET | RESETEP => {
                trace!(request, "no-op ioctl acknowledged");
                client.complete(0);
                Ok(true)
            }
            SUBMITURB => Ok(self.handle_submiturb(client)),
            DISCARDURB => Ok(self.handle_discardurb(client)),
            REAPURB | REAPURBNDELAY => self.handle_reapurb(client),
            other => {
                trace!(request = other, "unknown ioctl request");
                client.complete(Errno::NoTty.negative_status());
                Ok(true)
            }
        }
    }

    /// Resolve the argument at `addr` for `length` bytes, reporting and
    /// signalling "unhandled" on failure per §4.1/§7.
    fn resolve_arg(
        client: &mut dyn IoctlClient,
        addr: Option<u64>,
        length: usize,
        writable: bool,
    ) -> Option<crate::memory::ClientView> {
        let Some(addr) = addr else {
            warn!("ioctl {:#x} carried no argument address", client.request());
            return None;
        };
        match client.memory().resolve(addr, length, true, writable) {
            Ok(view) => Some(view),
            Err(error) => {
                warn!(%error, addr, length, "failed to resolve ioctl argument; leaving unhandled");
                None
            }
        }
    }

    fn handle_get_capabilities(&self, client: &mut dyn IoctlClient) -> bool {
        let size = constants::request_size(client.request());
        let Some(view) = Self::resolve_arg(client, client.arg_addr(), size, true) else {
            return false;
        };
        view.write_u32_le(0, constants::capabilities::MASK);
        view.dirty(false);
        view.flush_if_dirty();
        client.complete(0);
        true
    }

    fn handle_submiturb(&mut self, client: &mut dyn IoctlClient) -> bool {
        let size = constants::request_size(client.request());
        let Some(urb_view) = Self::resolve_arg(client, client.arg_addr(), size, true) else {
            return false;
        };
        let buffer_ptr = urb_view.read_u64_le(urb_offsets::BUFFER);
        let buffer_length = urb_view.read_u32_le(urb_offsets::BUFFER_LENGTH) as usize;
        let Some(buffer_view) = Self::resolve_arg(client, Some(buffer_ptr), buffer_length, true) else {
            return false;
        };
        self.queue.submit(UrbEntry::new(urb_view, buffer_view));
        self.urbs_submitted += 1;
        client.complete(0);
        true
    }

    fn handle_discardurb(&mut self, client: &mut dyn IoctlClient) -> bool {
        let Some(addr) = client.arg_addr() else {
            client.complete(Errno::Inval.negative_status());
            return true;
        };
        if self.queue.discard(addr) {
            self.urbs_discarded += 1;
            client.complete(0);
        } else {
            client.complete(Errno::Inval.negative_status());
        }
        true
    }

    fn handle_reapurb(&mut self, client: &mut dyn IoctlClient) -> Result<bool, ReplayError> {
        if let Some(discarded) = self.queue.take_oldest_discarded() {
            discarded.complete_discarded(Errno::NoEnt.negative_status());
            return Ok(self.complete_reap(client, &discarded));
        }

        match matcher::advance(&mut self.cursor, &mut self.queue)? {
            Some(urb) => Ok(self.complete_reap(client, &urb)),
            None => {
                client.complete(Errno::Again.negative_status());
                Ok(true)
            }
        }
    }

    fn complete_reap(&mut self, client: &mut dyn IoctlClient, urb: &UrbEntry) -> bool {
        let size = constants::request_size(client.request());
        let Some(out_view) = Self::resolve_arg(client, client.arg_addr(), size, true) else {
            return false;
        };
        out_view.write_u64_le(0, urb.client_address());
        out_view.dirty(false);
        out_view.flush_if_dirty();
        client.complete(0);
        self.urbs_reaped += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::memory::{ClientMemory, HeapClientMemory};
    use crate::pcap::PcapSource;
    use crate::urb::BusDeviceFilter;
    use std::cell::RefCell;

    #[derive(Debug)]
    struct EmptySource;
    impl PcapSource for EmptySource {
        fn next_record(&mut self) -> Result<Option<crate::pcap::PcapRecord>, ReplayError> {
            Ok(None)
        }
    }

    struct FakeClient<'a> {
        request: u64,
        arg_addr: Option<u64>,
        memory: &'a dyn ClientMemory,
        result: RefCell<Option<i32>>,
    }

    impl IoctlClient for FakeClient<'_> {
        fn request(&self) -> u64 {
            self.request
        }
        fn arg_addr(&self) -> Option<u64> {
            self.arg_addr
        }
        fn memory(&self) -> &dyn ClientMemory {
            self.memory
        }
        fn complete(&mut self, result: i32) {
            *self.result.borrow_mut() = Some(result);
        }
    }

    fn new_dispatcher() -> Dispatcher {
        let source: Box<dyn PcapSource> = Box::new(EmptySource);
        let cursor = PcapCursor::new(source, BusDeviceFilter::new(1, 5), Box::new(FakeClock::new()));
        Dispatcher::new(UrbQueue::new(), cursor)
    }

    #[test]
    fn get_capabilities_writes_mask() {
        let heap = HeapClientMemory::new();
        let addr = heap.alloc(&[0u8; 4]);
        let mut dispatcher = new_dispatcher();
        let mut client = FakeClient {
            request: GET_CAPABILITIES,
            arg_addr: Some(addr),
            memory: &heap,
            result: RefCell::new(None),
        };
        dispatcher.handle(&mut client).unwrap();
        assert_eq!(*client.result.borrow(), Some(0));
        assert_eq!(heap.read_at(addr, 4), constants::capabilities::MASK.to_le_bytes());
    }

    #[test]
    fn unknown_request_returns_enotty() {
        let mut dispatcher = new_dispatcher();
        let heap = HeapClientMemory::new();
        let mut client = FakeClient {
            request: 0xDEAD_BEEF,
            arg_addr: None,
            memory: &heap,
            result: RefCell::new(None),
        };
        dispatcher.handle(&mut client).unwrap();
        assert_eq!(*client.result.borrow(), Some(Errno::NoTty.negative_status()));
    }

    #[test]
    fn reap_with_empty_queue_and_recording_returns_eagain() {
        let mut dispatcher = new_dispatcher();
        let heap = HeapClientMemory::new();
        let out_addr = heap.alloc(&[0u8; 8]);
        let mut client = FakeClient {
            request: REAPURBNDELAY,
            arg_addr: Some(out_addr),
            memory: &heap,
            result: RefCell::new(None),
        };
        dispatcher.handle(&mut client).unwrap();
        assert_eq!(*client.result.borrow(), Some(Errno::Again.negative_status()));
    }

    #[test]
    fn discard_unknown_urb_returns_einval() {
        let mut dispatcher = new_dispatcher();
        let heap = HeapClientMemory::new();
        let mut client = FakeClient {
            request: DISCARDURB,
            arg_addr: Some(0x9999),
            memory: &heap,
            result: RefCell::new(None),
        };
        dispatcher.handle(&mut client).unwrap();
        assert_eq!(*client.result.borrow(), Some(Errno::Inval.negative_status()));
    }

    #[test]
    fn submit_then_discard_then_reap_drains_enoent() {
        let mut dispatcher = new_dispatcher();
        let heap = HeapClientMemory::new();

        let mut urb_bytes = vec![0u8; constants::USBDEVFS_URB_SIZE];
        let buffer_addr = heap.alloc(&[0u8; 8]);
        urb_bytes[urb_offsets::BUFFER..urb_offsets::BUFFER + 8].copy_from_slice(&buffer_addr.to_le_bytes());
        urb_bytes[urb_offsets::BUFFER_LENGTH..urb_offsets::BUFFER_LENGTH + 4].copy_from_slice(&8u32.to_le_bytes());
        let urb_addr = heap.alloc(&urb_bytes);

        let mut submit_client = FakeClient {
            request: SUBMITURB,
            arg_addr: Some(urb_addr),
            memory: &heap,
            result: RefCell::new(None),
        };
        dispatcher.handle(&mut submit_client).unwrap();
        assert_eq!(*submit_client.result.borrow(), Some(0));

        let mut discard_client = FakeClient {
            request: DISCARDURB,
            arg_addr: Some(urb_addr),
            memory: &heap,
            result: RefCell::new(None),
        };
        dispatcher.handle(&mut discard_client).unwrap();
        assert_eq!(*discard_client.result.borrow(), Some(0));

        let out_addr = heap.alloc(&[0u8; 8]);
        let mut reap_client = FakeClient {
            request: REAPURBNDELAY,
            arg_addr: Some(out_addr),
            memory: &heap,
            result: RefCell::new(None),
        };
        dispatcher.handle(&mut reap_client).unwrap();
        assert_eq!(*reap_client.result.borrow(), Some(0));
        assert_eq!(heap.read_at(out_addr, 8), urb_addr.to_le_bytes());

        let status = i32::from_le_bytes(
            heap.read_at(urb_addr + urb_offsets::STATUS as u64, 4)
                .try_into()
                .unwrap(),
        );
        assert_eq!(status, Errno::NoEnt.negative_status());

        assert_eq!(dispatcher.urbs_submitted(), 1);
        assert_eq!(dispatcher.urbs_discarded(), 1);
        assert_eq!(dispatcher.urbs_reaped(), 1);
    }

    #[test]
    fn unresolvable_argument_is_left_unhandled() {
        let mut dispatcher = new_dispatcher();
        let heap = HeapClientMemory::new();
        let mut client = FakeClient {
            request: GET_CAPABILITIES,
            arg_addr: Some(0xDEAD_0000),
            memory: &heap,
            result: RefCell::new(None),
        };
        let handled = dispatcher.handle(&mut client).unwrap();
        assert!(!handled);
        assert_eq!(*client.result.borrow(), None, "complete must not be called when unhandled");
    }
}
