//! USB device-filesystem ioctl opcode numbers, the advertised capability
//! bitmask, and the on-wire layouts this core reads and writes.
//!
//! The opcode numbers follow the conventional Linux ioctl request encoding
//! (`<linux/ioctl.h>`: a direction, a type ("magic") byte, a number, and a
//! size, packed into the bits of an `unsigned long`), the same encoding the
//! real `usbdevice_fs.h` header uses to build `USBDEVFS_*` constants.

/// Linux `_IOC` bit-field layout (see `asm-generic/ioctl.h`).
mod ioc {
    pub const NRBITS: u32 = 8;
    pub const TYPEBITS: u32 = 8;
    pub const SIZEBITS: u32 = 14;

    pub const NRSHIFT: u32 = 0;
    pub const TYPESHIFT: u32 = NRSHIFT + NRBITS;
    pub const SIZESHIFT: u32 = TYPESHIFT + TYPEBITS;
    pub const DIRSHIFT: u32 = SIZESHIFT + SIZEBITS;

    pub const NONE: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const READ: u64 = 2;

    pub const SIZE_MASK: u64 = (1 << SIZEBITS) - 1;

    pub const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
        (dir << DIRSHIFT) | ((ty as u64) << TYPESHIFT) | ((nr as u64) << NRSHIFT) | ((size as u64) << SIZESHIFT)
    }

    pub const fn io(ty: u8, nr: u8) -> u64 {
        ioc(NONE, ty, nr, 0)
    }

    pub const fn ior(ty: u8, nr: u8, size: usize) -> u64 {
        ioc(READ, ty, nr, size)
    }

    pub const fn iow(ty: u8, nr: u8, size: usize) -> u64 {
        ioc(WRITE, ty, nr, size)
    }

    pub const fn iowr(ty: u8, nr: u8, size: usize) -> u64 {
        ioc(READ | WRITE, ty, nr, size)
    }
}

/// Extract the declared argument size from an ioctl request code.
///
/// This is the "standard ioctl request-encoding bit-fields" the dispatcher
/// consults before resolving the argument against client memory.
#[must_use]
pub const fn request_size(request: u64) -> usize {
    ((request >> ioc::SIZESHIFT) & ioc::SIZE_MASK) as usize
}

/// The `usbdevfs_urb` struct is 56 bytes wide on a 64-bit client.
pub const USBDEVFS_URB_SIZE: usize = 56;

/// `sizeof(void *)` on a 64-bit client, used only to size the `USBDEVFS_REAPURB`
/// argument (a pointer to a pointer).
const PTR_SIZE: usize = 8;

/// `sizeof(unsigned int)`.
const UINT_SIZE: usize = 4;

const USB_MAGIC: u8 = b'U';

pub const GET_CAPABILITIES: u64 = ioc::ior(USB_MAGIC, 26, UINT_SIZE);
pub const CLAIMINTERFACE: u64 = ioc::ior(USB_MAGIC, 15, UINT_SIZE);
pub const RELEASEINTERFACE: u64 = ioc::ior(USB_MAGIC, 16, UINT_SIZE);
pub const CLEAR_HALT: u64 = ioc::ior(USB_MAGIC, 21, UINT_SIZE);
pub const RESET: u64 = ioc::io(USB_MAGIC, 20);
pub const RESETEP: u64 = ioc::ior(USB_MAGIC, 3, UINT_SIZE);
pub const SUBMITURB: u64 = ioc::ior(USB_MAGIC, 10, USBDEVFS_URB_SIZE);
pub const DISCARDURB: u64 = ioc::io(USB_MAGIC, 11);
pub const REAPURB: u64 = ioc::iow(USB_MAGIC, 12, PTR_SIZE);
pub const REAPURBNDELAY: u64 = ioc::iow(USB_MAGIC, 13, PTR_SIZE);

/// Offsets within `struct usbdevfs_urb` on a 64-bit client, as laid out by
/// the Linux kernel header (fields not read or written by this core, such as
/// `flags` and `signr`, are omitted).
pub mod urb_offsets {
    pub const TYPE: usize = 0;
    pub const ENDPOINT: usize = 1;
    pub const STATUS: usize = 4;
    pub const BUFFER: usize = 16;
    pub const BUFFER_LENGTH: usize = 24;
    pub const ACTUAL_LENGTH: usize = 28;
    pub const START_FRAME: usize = 32;
}

/// USB transfer type values used in both `usbdevfs_urb::type` and the pcap
/// header's `transfer_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Isochronous = 0,
    Interrupt = 1,
    Control = 2,
    Bulk = 3,
}

impl TransferType {
    #[must_use]
    pub const fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Isochronous),
            1 => Some(Self::Interrupt),
            2 => Some(Self::Control),
            3 => Some(Self::Bulk),
            _ => None,
        }
    }
}

/// Whether an endpoint number is outbound (host-to-device), used only when
/// deciding whether a submit record's payload must byte-match a queued
/// URB's buffer. This core keys off bit 0 of the endpoint number, not the
/// conventional USB bit 7, matching the recording format it replays.
#[must_use]
pub const fn endpoint_is_out(endpoint: u8) -> bool {
    endpoint & 0x01 != 0
}

/// Capability bits advertised by `GET_CAPABILITIES`, matching the Linux
/// `USBDEVFS_CAP_*` assignments.
pub mod capabilities {
    pub const BULK_CONTINUATION: u32 = 1 << 0;
    pub const NO_PACKET_SIZE_LIM: u32 = 1 << 1;
    pub const BULK_SCATTER_GATHER: u32 = 1 << 2;
    pub const REAP_AFTER_DISCONNECT: u32 = 1 << 3;
    pub const ZERO_PACKET: u32 = 1 << 4;

    /// The fixed mask this core reports: `0x1F`, the OR of all five bits.
    pub const MASK: u32 = BULK_CONTINUATION | NO_PACKET_SIZE_LIM | BULK_SCATTER_GATHER | REAP_AFTER_DISCONNECT | ZERO_PACKET;
}

/// Byte offsets within the 64-byte `usb_header_mmapped` pcap record header
/// (`DLT_USB_LINUX_MMAPPED` / linktype 220).
pub mod usb_header_mmapped {
    pub const SIZE: usize = 64;

    pub const ID: usize = 0;
    pub const EVENT_TYPE: usize = 8;
    pub const TRANSFER_TYPE: usize = 9;
    pub const ENDPOINT_NUMBER: usize = 10;
    pub const DEVICE_ADDRESS: usize = 11;
    pub const BUS_ID: usize = 12;
    pub const TS_SEC: usize = 16;
    pub const TS_USEC: usize = 24;
    pub const STATUS: usize = 28;
    pub const URB_LEN: usize = 32;
    pub const DATA_LEN: usize = 36;
    pub const START_FRAME: usize = 52;
}
