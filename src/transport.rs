//! Unicast UDP transport: one socket per role instance, `bincode` framing.
//!
//! Every reply (PROMISE, NACK, CATCHUP-REPLY) is addressed point-to-point,
//! and ACCEPTED fans out to an explicit learner set, so every role instance
//! binds its own configured unicast address and callers address sends
//! explicitly rather than relying on group membership.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use bincode::{deserialize, serialize};
use log::debug;

use crate::message::Message;

/// Datagrams are small (one Paxos message each); this comfortably bounds
/// the largest expected `Accepted`/`CatchupReply` carrying a client value.
const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn send(&self, message: &Message, to: SocketAddr) -> io::Result<()> {
        let encoded = serialize(message).expect("message encoding never fails");
        self.socket.send_to(&encoded, to)?;
        Ok(())
    }

    /// Blocks until a message arrives. Malformed datagrams are dropped and
    /// logged rather than surfaced as an error; the returned count is how
    /// many were dropped before the one this call returns, so the caller can
    /// fold it into its own `malformed_datagram_count` with full context
    /// (role id, current slot).
    pub fn recv(&self) -> io::Result<(Message, SocketAddr, u64)> {
        let mut dropped = 0u64;
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            let (len, src) = self.socket.recv_from(&mut buf)?;
            match deserialize::<Message>(&buf[..len]) {
                Ok(message) => return Ok((message, src, dropped)),
                Err(e) => {
                    dropped += 1;
                    debug!("dropping malformed datagram from {}: {}", src, e);
                    continue;
                }
            }
        }
    }

    /// Like `recv`, but returns `Ok(None)` if nothing arrives within `timeout`
    /// instead of blocking indefinitely. Used by proposer retransmit timers
    /// and learner catch-up timeouts.
    pub fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<(Message, SocketAddr, u64)>> {
        self.socket.set_read_timeout(Some(timeout))?;
        match self.recv() {
            Ok(triple) => Ok(Some(triple)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
