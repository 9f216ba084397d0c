//! Parsing of `DLT_USB_LINUX_MMAPPED` pcap records (§6) and the
//! [`PcapSource`] contract the matcher pulls records through.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::usb_header_mmapped as layout;
use crate::error::ReplayError;

/// A timestamp as carried by a pcap record, kept at microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordTime {
    pub seconds: i64,
    pub microseconds: i32,
}

impl RecordTime {
    /// Signed microsecond delta `self - other`, used by the stuck detector
    /// to compute the recording-time gap between two records.
    #[must_use]
    pub fn delta_micros(&self, other: &Self) -> i64 {
        (self.seconds - other.seconds) * 1_000_000 + i64::from(self.microseconds - other.microseconds)
    }
}

/// The parsed fields of a 64-byte `usb_header_mmapped` record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbRecordHeader {
    pub id: u64,
    pub event_type: char,
    pub transfer_type: u8,
    pub endpoint_number: u8,
    pub device_address: u8,
    pub bus_id: u16,
    pub time: RecordTime,
    pub status: i32,
    pub urb_len: u32,
    pub data_len: u32,
    pub start_frame: i32,
}

impl UsbRecordHeader {
    /// Parse the 64-byte header from the front of a pcap record's payload.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::RecordTooShort`] if fewer than
    /// [`layout::SIZE`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Result<Self, ReplayError> {
        if bytes.len() < layout::SIZE {
            return Err(ReplayError::RecordTooShort {
                len: bytes.len(),
                min: layout::SIZE,
            });
        }
        let read_u64 = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        let read_u32 = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let read_i32 = |off: usize| read_u32(off) as i32;
        let read_u16 = |off: usize| u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap());
        let read_i64 = |off: usize| i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());

        Ok(Self {
            id: read_u64(layout::ID),
            event_type: bytes[layout::EVENT_TYPE] as char,
            transfer_type: bytes[layout::TRANSFER_TYPE],
            endpoint_number: bytes[layout::ENDPOINT_NUMBER],
            device_address: bytes[layout::DEVICE_ADDRESS],
            bus_id: read_u16(layout::BUS_ID),
            time: RecordTime {
                seconds: read_i64(layout::TS_SEC),
                microseconds: read_i32(layout::TS_USEC),
            },
            status: read_i32(layout::STATUS),
            urb_len: read_u32(layout::URB_LEN),
            data_len: read_u32(layout::DATA_LEN),
            start_frame: read_i32(layout::START_FRAME),
        })
    }
}

/// A parsed pcap record: the fixed header plus its payload bytes (only
/// present, per `data_len`, on submit records with outbound data and on
/// completion records with inbound data).
#[derive(Debug, Clone)]
pub struct PcapRecord {
    pub header: UsbRecordHeader,
    pub payload: Vec<u8>,
}

impl PcapRecord {
    fn parse(bytes: &[u8]) -> Result<Self, ReplayError> {
        let header = UsbRecordHeader::parse(bytes)?;
        let payload = bytes[layout::SIZE..].to_vec();
        Ok(Self { header, payload })
    }
}

/// Source of capture-ordered USB records, pulled on demand by the matcher.
///
/// This is the "pcap reader" external collaborator (§6): something else is
/// responsible for demultiplexing files and link types at a higher level;
/// this core only ever asks for the next record.
pub trait PcapSource: fmt::Debug {
    /// Return the next record, or `None` at end of capture.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying capture cannot be read or a
    /// record fails to parse.
    fn next_record(&mut self) -> Result<Option<PcapRecord>, ReplayError>;
}

/// A [`PcapSource`] reading an offline `.pcap`/`.pcapng` file via the
/// system `pcap` library, validating the link-type at open time.
pub struct OfflinePcapSource {
    path: PathBuf,
    capture: pcap::Capture<pcap::Offline>,
}

impl fmt::Debug for OfflinePcapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflinePcapSource").field("path", &self.path).finish()
    }
}

impl OfflinePcapSource {
    /// Open `path` and verify it reports `DLT_USB_LINUX_MMAPPED`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Io`] if `path` cannot be stat'd, [`ReplayError::Pcap`]
    /// if it cannot be opened as a capture, or [`ReplayError::UnsupportedLinktype`]
    /// if it uses a different link type.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        std::fs::metadata(&path).map_err(|source| ReplayError::Io {
            path: path.clone(),
            source,
        })?;
        let capture = pcap::Capture::from_file(&path).map_err(|source| ReplayError::Pcap {
            path: path.clone(),
            source,
        })?;
        let linktype = capture.get_datalink();
        if linktype != pcap::Linktype::USB_LINUX_MMAPPED {
            return Err(ReplayError::UnsupportedLinktype {
                path,
                actual: linktype,
            });
        }
        Ok(Self { path, capture })
    }
}

impl PcapSource for OfflinePcapSource {
    fn next_record(&mut self) -> Result<Option<PcapRecord>, ReplayError> {
        match self.capture.next_packet() {
            Ok(packet) => PcapRecord::parse(packet.data).map(Some),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(source) => Err(ReplayError::Pcap {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(id: u64, event_type: u8, transfer_type: u8, endpoint: u8, status: i32, urb_len: u32, data_len: u32, start_frame: i32) -> Vec<u8> {
        let mut bytes = vec![0u8; layout::SIZE];
        bytes[layout::ID..layout::ID + 8].copy_from_slice(&id.to_le_bytes());
        bytes[layout::EVENT_TYPE] = event_type;
        bytes[layout::TRANSFER_TYPE] = transfer_type;
        bytes[layout::ENDPOINT_NUMBER] = endpoint;
        bytes[layout::DEVICE_ADDRESS] = 5;
        bytes[layout::BUS_ID..layout::BUS_ID + 2].copy_from_slice(&1u16.to_le_bytes());
        bytes[layout::STATUS..layout::STATUS + 4].copy_from_slice(&status.to_le_bytes());
        bytes[layout::URB_LEN..layout::URB_LEN + 4].copy_from_slice(&urb_len.to_le_bytes());
        bytes[layout::DATA_LEN..layout::DATA_LEN + 4].copy_from_slice(&data_len.to_le_bytes());
        bytes[layout::START_FRAME..layout::START_FRAME + 4].copy_from_slice(&start_frame.to_le_bytes());
        bytes
    }

    #[test]
    fn parses_header_fields() {
        let bytes = header_bytes(7, b'S', 1, 0x82, 0, 8, 0, 0);
        let header = UsbRecordHeader::parse(&bytes).unwrap();
        assert_eq!(header.id, 7);
        assert_eq!(header.event_type, 'S');
        assert_eq!(header.transfer_type, 1);
        assert_eq!(header.endpoint_number, 0x82);
        assert_eq!(header.urb_len, 8);
    }

    #[test]
    fn too_short_record_is_rejected() {
        let err = UsbRecordHeader::parse(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ReplayError::RecordTooShort { len: 10, min } if min == layout::SIZE));
    }

    #[test]
    fn record_carries_payload_after_header() {
        let mut bytes = header_bytes(9, b'S', 3, 0x01, 0, 4, 4, 0);
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let record = PcapRecord::parse(&bytes).unwrap();
        assert_eq!(record.payload, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }
}
