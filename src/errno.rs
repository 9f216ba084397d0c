//! The small set of errno values this core ever completes an ioctl with.

/// Client-observable errno values produced by the replay core.
///
/// The dispatcher never invents errno values beyond this set; see
/// the error handling design for the full rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Unknown ioctl request code.
    NoTty = libc::ENOTTY,
    /// `DISCARDURB` referenced an address that is not queued.
    Inval = libc::EINVAL,
    /// Reap has nothing to deliver right now.
    Again = libc::EAGAIN,
    /// Stored in a discarded URB's `status` field, not returned as an errno.
    NoEnt = libc::ENOENT,
}

impl Errno {
    pub const fn raw(self) -> i32 {
        self as i32
    }

    /// The value stored in `usb_devfs_urb::status` for a drained discard.
    pub const fn negative_status(self) -> i32 {
        -(self as i32)
    }
}
