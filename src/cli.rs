//! This module implements the CLI interface.

use std::path::PathBuf;

use clap::Parser;

use crate::urb::BusDeviceFilter;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to the `DLT_USB_LINUX_MMAPPED` pcap recording to replay.
    #[arg(long)]
    pub recording: PathBuf,

    /// The captured device to replay, as `bus:device` (both decimal, as
    /// reported by `usb_header_mmapped::bus_id`/`::device_address`).
    #[arg(long, value_parser = parse_bus_device)]
    pub device: BusDeviceFilter,
}

fn parse_bus_device(value: &str) -> Result<BusDeviceFilter, String> {
    let (bus, device) = value
        .split_once(':')
        .ok_or_else(|| format!("expected bus:device, got {value:?}"))?;
    let bus: u16 = bus.parse().map_err(|_| format!("invalid bus number {bus:?}"))?;
    let device: u8 = device.parse().map_err(|_| format!("invalid device number {device:?}"))?;
    Ok(BusDeviceFilter::new(bus, device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_bus_device() {
        let filter = parse_bus_device("1:5").unwrap();
        assert_eq!(filter, BusDeviceFilter::new(1, 5));
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_bus_device("15").is_err());
    }

    #[test]
    fn rejects_non_numeric_parts() {
        assert!(parse_bus_device("a:b").is_err());
    }
}
