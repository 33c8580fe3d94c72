//! Two peers on localhost: connect, exchange a few messages with different delivery
//!  guarantees, disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use netchannel::{
    ConnectionStatus, DeliveryMethod, DeliveryQueue, IncomingMessage, Peer, PeerConfig,
};
use tracing::{info, Level};

struct LoggingDelivery;

impl DeliveryQueue for LoggingDelivery {
    fn on_message(&self, message: IncomingMessage) {
        info!(
            "received {} byte message from {:?}: {:?}",
            message.data.len(),
            message.sender,
            String::from_utf8_lossy(&message.data)
        );
    }

    fn on_status_change(&self, remote: SocketAddr, status: ConnectionStatus, reason: &str) {
        info!("{:?} is now {:?} ({})", remote, status, reason);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let delivery = Arc::new(LoggingDelivery);

    let a = Arc::new(Peer::bind(PeerConfig::new("127.0.0.1:0".parse()?), delivery.clone()).await?);
    let b = Arc::new(Peer::bind(PeerConfig::new("127.0.0.1:0".parse()?), delivery.clone()).await?);

    let cloned_a = a.clone();
    let cloned_b = b.clone();
    tokio::spawn(async move { cloned_a.run().await });
    tokio::spawn(async move { cloned_b.run().await });

    let conn = a.connect(b.local_addr())?;
    while conn.status() != ConnectionStatus::Connected {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    info!("connected, round trip estimate pending");

    let mut msg = a.create_message(32);
    msg.write(b"reliable and in order");
    conn.send_message(msg, DeliveryMethod::ReliableOrdered, 0)?;

    let mut msg = a.create_message(32);
    msg.write(b"latest position update");
    conn.send_message(msg, DeliveryMethod::UnreliableSequenced, 1)?;

    let mut big = a.create_message(8192);
    big.write(&vec![b'x'; 8192]);
    conn.send_message(big, DeliveryMethod::ReliableOrdered, 0)?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    conn.disconnect("demo over");
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!(
        "sent {} packets / {} bytes, received {} packets",
        conn.statistics().sent_packets(),
        conn.statistics().sent_bytes(),
        conn.statistics().received_packets()
    );
    Ok(())
}
