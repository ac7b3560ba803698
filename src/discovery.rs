//! UDP discovery: bind the two broadcast ports and decode the beacons
//! that devices emit. Port 6666 carries plaintext v3.1 beacons, port 6667
//! carries v3.3 beacons encrypted with the shared discovery key. The host
//! only ever listens; beacons are broadcast by the devices.

use crate::crypto::discovery_key;
use crate::error::Result;
use crate::messages::{self, Beacon};
use crate::protocol;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// v3.1 devices announce themselves here in the clear.
pub const PLAIN_PORT: u16 = 6666;
/// v3.3 and later devices announce themselves here, encrypted.
pub const ENCRYPTED_PORT: u16 = 6667;

/// Bind one discovery port: broadcast-capable, address reuse, nonblocking,
/// handed to tokio.
pub fn bind(port: u16) -> Result<UdpSocket> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("cannot set reuse_address on port {port}: {e}");
    }
    if let Err(e) = socket.set_broadcast(true) {
        warn!("cannot enable broadcast on port {port}: {e}");
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;
    info!("UDP discovery port {port} is now open");
    Ok(socket)
}

/// Decode one received datagram into a beacon. Malformed packets are
/// reported as errors for the caller to log and drop.
pub fn decode_beacon(port: u16, datagram: &[u8]) -> Result<Beacon> {
    let msg = if port == ENCRYPTED_PORT {
        protocol::unpack_frame(datagram, Some(&discovery_key()), None)?
    } else {
        protocol::unpack_frame(datagram, None, None)?
    };
    debug!(
        "beacon on port {port}: {}",
        String::from_utf8_lossy(&msg.payload)
    );
    messages::parse_beacon(&msg.payload)
}
