//! Using the blocking facade from plain threads, no async runtime in sight.

use std::time::Duration;

use anyhow::{Context, Result};
use can_io_mock::VirtualBus;
use isotp_net::{ConnectionOptions, SyncNetwork};

fn main() -> Result<()> {
    env_logger::init();

    let bus = VirtualBus::new();
    let tester = SyncNetwork::open(bus.attach())?;
    let ecu = SyncNetwork::open(bus.attach())?;

    let mut request = tester.create_sync_connection(0x7E0, 0x7E8, ConnectionOptions::default())?;
    let mut respond = ecu.create_sync_connection(0x7E8, 0x7E0, ConnectionOptions::default())?;

    request.send(&vec![0x22; 600])?;
    request.flush()?;

    let received = respond
        .recv(Some(Duration::from_secs(1)))?
        .context("no request within a second")?;
    println!("ecu side received {} bytes", received.len());

    respond.send(b"\x62\xF1\x90ok")?;
    respond.flush()?;

    let answer = request
        .recv(Some(Duration::from_secs(1)))?
        .context("no response within a second")?;
    println!("tester side received {} bytes", answer.len());

    tester.close();
    ecu.close();
    Ok(())
}
