//! Echo server and client talking ISO-TP over an in-process virtual bus.
//!
//! Swap `VirtualBus` for `can_io_socketcan::SocketCan::open("vcan0")` to run
//! the same code against a real (or virtual) CAN interface.

use anyhow::Result;
use can_io_mock::VirtualBus;
use isotp_net::{ConnectionOptions, Network};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let bus = VirtualBus::new();
    let server_net = Network::open(bus.attach());
    let client_net = Network::open(bus.attach());

    // The server side: read a message, write it straight back.
    let (mut server_reader, mut server_writer) = server_net
        .open_connection(0x456, 0x123, ConnectionOptions::default())
        .await?;
    tokio::spawn(async move {
        while let Ok(payload) = server_reader.read(4095).await {
            if server_writer.write(&payload).await.is_err() {
                break;
            }
        }
    });

    let (mut reader, mut writer) = client_net
        .open_connection(0x123, 0x456, ConnectionOptions::default())
        .await?;

    let request = b"hello over iso-tp; long enough to need segmentation".repeat(4);
    writer.write(&request).await?;
    writer.drain().await?;

    let reply = reader.read(4095).await?;
    println!(
        "echoed {} bytes back intact: {}",
        reply.len(),
        reply == request
    );

    client_net.close().await;
    server_net.close().await;
    Ok(())
}
