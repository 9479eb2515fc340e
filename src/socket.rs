//! Multicast socket bring-up and the two socket tasks.
//!
//! The receiver pushes raw datagrams onto the inbound FIFO and drops its own
//! reflections; the sender drains the outbound FIFO toward the group. Both
//! pace themselves with short sleeps so neither can starve the engine.

use crate::buffer::PacketFifo;
use crate::config::{
    DRAIN_CHECK_INTERVAL, DRAIN_MAX_PACKETS, DRAIN_MIN_MESSAGE_RATE, DRAIN_TIMEOUT, IDLE_DELAY,
    MAX_DATAGRAM_BYTES, MULTICAST_GROUP, MULTICAST_PORT, MULTICAST_TTL, SOCKET_RECV_DELAY,
    SOCKET_SEND_DELAY,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

/// Open, configure, and join the overlay's multicast group. TTL 1 keeps
/// traffic on the segment; loopback is off because the receiver filters by
/// source address anyway.
pub fn open_multicast_socket() -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Best-effort discovery of the local interface address, used to filter our
/// own datagrams off the group. A node that cannot determine it still runs,
/// it just relies on the loopback setting.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect((MULTICAST_GROUP, MULTICAST_PORT)).ok()?;
    match probe.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

/// Receiver task: datagrams from the group onto the inbound FIFO. When the
/// message rate climbs past the threshold the socket backlog is drained so
/// the engine works on fresh traffic.
pub async fn receive_loop(socket: Arc<UdpSocket>, inbound: Arc<PacketFifo>, local_ip: Option<Ipv4Addr>) {
    info!("receiver ready on {}:{}", MULTICAST_GROUP, MULTICAST_PORT);
    let mut buf = [0u8; MAX_DATAGRAM_BYTES];
    let mut message_counter: u32 = 0;
    let mut window_start = Instant::now();

    loop {
        if message_counter >= DRAIN_CHECK_INTERVAL {
            let elapsed = window_start.elapsed().as_secs_f64().max(0.001);
            let rate = f64::from(message_counter) / elapsed;
            if rate > DRAIN_MIN_MESSAGE_RATE {
                info!("receive rate {rate:.1} msg/s, draining backlog");
                let mut drained: u32 = 0;
                while let Ok(Ok(_)) = timeout(DRAIN_TIMEOUT, socket.recv_from(&mut buf)).await {
                    drained += 1;
                    if drained > DRAIN_MAX_PACKETS {
                        break;
                    }
                }
                info!("drained {drained} packet(s)");
            }
            message_counter = 0;
            window_start = Instant::now();
        }

        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("multicast receive failed: {e}");
                continue;
            }
        };
        message_counter += 1;

        // Our own sends come back via the group; never feed them to the
        // engine.
        if let (Some(local), IpAddr::V4(src)) = (local_ip, peer.ip()) {
            if src == local {
                debug!("ignoring datagram from self");
                continue;
            }
        }

        debug!("received {len} bytes from {peer}");
        if inbound.push(buf[..len].to_vec()).is_err() {
            error!("receive buffer full, dropping {len} byte datagram");
        }

        sleep(SOCKET_RECV_DELAY).await;
    }
}

/// Sender task: outbound FIFO to the multicast group.
pub async fn send_loop(socket: Arc<UdpSocket>, outbound: Arc<PacketFifo>) {
    let destination = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);
    info!("sender ready toward {destination}");

    loop {
        let Some(packet) = outbound.pop() else {
            sleep(IDLE_DELAY).await;
            continue;
        };
        match socket.send_to(&packet, destination).await {
            Ok(sent) => debug!("sent {sent} bytes to {destination}"),
            Err(e) => error!("multicast send failed: {e}"),
        }
        sleep(SOCKET_SEND_DELAY).await;
    }
}
