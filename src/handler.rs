//! [`ReplayHandler`]: construction and statistics (§4.7, ambient).

use std::path::{Path, PathBuf};

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{Dispatcher, IoctlClient};
use crate::error::ReplayError;
use crate::matcher::PcapCursor;
use crate::pcap::OfflinePcapSource;
use crate::urb::{BusDeviceFilter, UrbQueue};

/// A snapshot of handler activity, exposed for diagnostics and the CLI's
/// end-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayStats {
    /// URBs currently queued, not yet reaped or discarded.
    pub urbs_queued: usize,
    /// URBs currently on the discard list, waiting to be reaped with `-ENOENT`.
    pub urbs_discarded_pending: usize,
    /// Cumulative URBs queued via `SUBMITURB` over the handler's lifetime.
    pub urbs_submitted: u64,
    /// Cumulative URBs handed back via `REAPURB`/`REAPURBNDELAY`.
    pub urbs_reaped: u64,
    /// Cumulative URBs moved onto the discard list via `DISCARDURB`.
    pub urbs_discarded: u64,
    /// Total pcap records pulled from the recording so far.
    pub pcap_records_consumed: u64,
    /// Of those, how many were dropped for not matching the configured filter.
    pub pcap_records_skipped: u64,
}

/// Owns a recording and replays it against ioctl calls from a traced client.
#[derive(Debug)]
pub struct ReplayHandler {
    recording_path: PathBuf,
    filter: BusDeviceFilter,
    dispatcher: Dispatcher,
}

impl ReplayHandler {
    /// Open `recording_path`, validate it, and build a handler that will
    /// only replay traffic for `filter`'s bus/device.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] if the recording cannot be opened or uses an
    /// unsupported link type.
    pub fn new(recording_path: impl AsRef<Path>, filter: BusDeviceFilter) -> Result<Self, ReplayError> {
        Self::with_clock(recording_path, filter, Box::new(SystemClock::new()))
    }

    /// As [`Self::new`], but with an injectable clock (used by tests that
    /// need deterministic stuck-detection timing).
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_clock(
        recording_path: impl AsRef<Path>,
        filter: BusDeviceFilter,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ReplayError> {
        let recording_path = recording_path.as_ref().to_path_buf();
        let source = OfflinePcapSource::open(&recording_path)?;
        let cursor = PcapCursor::new(Box::new(source), filter, clock);
        let dispatcher = Dispatcher::new(UrbQueue::new(), cursor);
        Ok(Self {
            recording_path,
            filter,
            dispatcher,
        })
    }

    #[must_use]
    pub fn recording_path(&self) -> &Path {
        &self.recording_path
    }

    #[must_use]
    pub const fn filter(&self) -> BusDeviceFilter {
        self.filter
    }

    /// Handle one ioctl call. See [`Dispatcher::handle`].
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::handle`].
    pub fn handle(&mut self, client: &mut dyn IoctlClient) -> Result<bool, ReplayError> {
        self.dispatcher.handle(client)
    }

    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            urbs_queued: self.dispatcher.queue().len(),
            urbs_discarded_pending: self.dispatcher.queue().discarded_len(),
            urbs_submitted: self.dispatcher.urbs_submitted(),
            urbs_reaped: self.dispatcher.urbs_reaped(),
            urbs_discarded: self.dispatcher.urbs_discarded(),
            pcap_records_consumed: self.dispatcher.cursor().records_consumed(),
            pcap_records_skipped: self.dispatcher.cursor().records_skipped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_recording_fails_construction() {
        let result = ReplayHandler::new("/nonexistent/does-not-exist.pcap", BusDeviceFilter::new(1, 5));
        assert!(matches!(result, Err(ReplayError::Pcap { .. }) | Err(ReplayError::Io { .. })));
    }

    #[test]
    fn stats_start_empty() {
        // Construction itself is exercised above; here we only check the
        // snapshot shape on a handler whose dispatcher has nothing queued.
        let queue = UrbQueue::new();
        let stats = ReplayStats {
            urbs_queued: queue.len(),
            urbs_discarded_pending: queue.discarded_len(),
            ..ReplayStats::default()
        };
        assert_eq!(stats, ReplayStats::default());
    }
}
