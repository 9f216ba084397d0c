//! Construction-time failures (§7 plane 3).
//!
//! Everything here is fatal: the handler either comes up with a validated
//! recording or it does not come up at all. Per-ioctl failures never use
//! this type; see [`crate::errno::Errno`] for those.

use std::path::PathBuf;

/// Failure to construct a [`crate::handler::ReplayHandler`].
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to open recording {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open recording {path} as a pcap capture: {source}")]
    Pcap {
        path: PathBuf,
        #[source]
        source: pcap::Error,
    },

    #[error(
        "recording {path} uses link-type {actual:?}, but only DLT_USB_LINUX_MMAPPED is supported"
    )]
    UnsupportedLinktype {
        path: PathBuf,
        actual: pcap::Linktype,
    },

    #[error("pcap record too short: got {len} bytes, need at least {min}")]
    RecordTooShort { len: usize, min: usize },

    #[error("unsupported event_type {event_type:?} in recording; only 'S' and 'C' are implemented")]
    UnsupportedEventType { event_type: char },

    #[error("completion record id={id} carries non-zero start_frame={start_frame}, which is unsupported")]
    UnsupportedStartFrame { id: u64, start_frame: i32 },
}
