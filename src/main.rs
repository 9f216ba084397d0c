#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate
)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! usbreplayd

mod cli;
mod clock;
mod constants;
mod dispatcher;
mod errno;
mod error;
mod handler;
mod matcher;
mod memory;
mod pcap;
mod stuck;
mod urb;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cli::Cli;
use constants::{GET_CAPABILITIES, REAPURBNDELAY};
use dispatcher::IoctlClient;
use handler::ReplayHandler;
use memory::{ClientMemory, HeapClientMemory};

/// How many reap attempts the smoke-test loop drives before giving up,
/// bounding its runtime against a recording that never produces an
/// `EAGAIN`-worthy end state for whatever reason.
const MAX_REAP_ATTEMPTS: u32 = 1_000_000;

/// A minimal [`IoctlClient`] driving the handler from a single in-process
/// address space, used by the CLI's recording smoke test. A real transport
/// (ptrace, a shared-memory device model, …) would implement this trait
/// against its own client instead.
struct SmokeTestClient<'a> {
    request: u64,
    arg_addr: Option<u64>,
    memory: &'a dyn ClientMemory,
    last_result: i32,
}

impl IoctlClient for SmokeTestClient<'_> {
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
        self.last_result = result;
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    // Log messages from the log crate as well.
    tracing_log::LogTracer::init()?;

    let mut handler = ReplayHandler::new(&args.recording, args.device)
        .context("Failed to open recording")?;

    info!(
        recording = %handler.recording_path().display(),
        bus = handler.filter().bus,
        device = handler.filter().device,
        "replay handler ready"
    );

    let heap = HeapClientMemory::new();
    let caps_addr = heap.alloc(&[0u8; 4]);
    let mut caps_client = SmokeTestClient {
        request: GET_CAPABILITIES,
        arg_addr: Some(caps_addr),
        memory: &heap,
        last_result: 0,
    };
    handler
        .handle(&mut caps_client)
        .context("GET_CAPABILITIES failed")?;
    info!(result = caps_client.last_result, "queried capabilities");

    let out_addr = heap.alloc(&[0u8; 8]);
    let mut reaped = 0u32;
    for _ in 0..MAX_REAP_ATTEMPTS {
        let mut reap_client = SmokeTestClient {
            request: REAPURBNDELAY,
            arg_addr: Some(out_addr),
            memory: &heap,
            last_result: 0,
        };
        handler.handle(&mut reap_client).context("REAPURB failed")?;
        if reap_client.last_result == errno::Errno::Again.negative_status() {
            break;
        }
        reaped += 1;
    }

    let stats = handler.stats();
    info!(
        reaped,
        urbs_queued = stats.urbs_queued,
        urbs_discarded_pending = stats.urbs_discarded_pending,
        urbs_submitted = stats.urbs_submitted,
        urbs_reaped = stats.urbs_reaped,
        urbs_discarded = stats.urbs_discarded,
        pcap_records_consumed = stats.pcap_records_consumed,
        pcap_records_skipped = stats.pcap_records_skipped,
        "replay smoke test finished"
    );

    Ok(())
}
