// UDP transport
//
// Sockets are created with socket2 in non-blocking mode and handed to tokio,
// so readiness comes from the runtime's reactor and send/receive never wait.
// Every function that builds a socket must run inside a tokio runtime.
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::buffer::Datagram;
use crate::error::{Result, TftpError};

/// Wildcard host used when no bind address is configured
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Open the well-known socket that receives every client's first request.
///
/// `bind_host` is resolved and each candidate address is tried in turn; the
/// first one that binds wins.
pub fn open_portal(bind_host: Option<&str>, port: u16) -> Result<UdpSocket> {
    let host = bind_host.unwrap_or(WILDCARD_HOST);
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(TftpError::Bind)?
        .collect();

    let mut last_error = None;
    for addr in candidates {
        match bind_portal(addr) {
            Ok(socket) => {
                debug!("Portal socket bound to {}", addr);
                return Ok(socket);
            }
            Err(e) => {
                debug!("Cannot bind {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(TftpError::Bind(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} resolved to no address", host),
        )
    })))
}

fn bind_portal(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Open a per-session socket associated with `peer`.
///
/// When `local` carries a specific address the socket is bound to it (on an
/// ephemeral port) so replies leave from the interface the request arrived
/// on. Once connected, only `peer`'s datagrams are delivered.
pub fn open_transfer(local: Option<SocketAddr>, peer: SocketAddr) -> Result<UdpSocket> {
    let connect = || -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if let Some(local) = local.filter(|addr| !addr.ip().is_unspecified()) {
            socket.bind(&SocketAddr::new(local.ip(), 0).into())?;
        }
        socket.connect(&peer.into())?;
        UdpSocket::from_std(socket.into())
    };

    connect().map_err(|e| {
        warn!("Cannot open transfer socket to {}: {}", peer, e);
        TftpError::Connect(e)
    })
}

/// Transmit `datagram` to the socket's associated peer. The datagram is
/// released whether or not the send succeeds.
pub fn send(socket: &UdpSocket, datagram: Datagram) -> Result<usize> {
    let sent = socket.try_send(datagram.payload()).map_err(TftpError::Send)?;
    debug!(
        "Sent {} byte datagram to {}",
        sent,
        datagram.peer_addr()
    );
    Ok(sent)
}

/// Read one datagram from a socket the scheduler has seen become readable.
///
/// Returns `Ok(None)` when the readiness turned out to be spurious.
pub fn receive(socket: &UdpSocket) -> Result<Option<Datagram>> {
    let local = socket.local_addr().map_err(TftpError::Receive)?;
    let mut datagram = Datagram::for_receive(local);

    match socket.try_recv_from(datagram.payload_mut()) {
        Ok((len, peer)) => {
            datagram.truncate_received(len, peer);
            debug!("Received {} byte datagram from {}", len, peer);
            Ok(Some(datagram))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(TftpError::Receive(e)),
    }
}

/// Close a socket. Taking ownership makes a second close impossible.
pub fn close(socket: UdpSocket) {
    if let Ok(addr) = socket.local_addr() {
        debug!("Closing socket {}", addr);
    }
    drop(socket);
}
