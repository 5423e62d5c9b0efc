//! UDP socket setup for the capture stage.
//!
//! The socket is bound to the capture port and, unless the sender is the
//! literal `"any"`, connected to the resolved sender address so stray
//! datagrams from other hosts never reach the pipeline. Receives are
//! non-blocking; readiness comes from `poll` with a 1-second timeout so
//! the stage can publish its waiting state and check the run flag at a
//! steady cadence.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use tracing::warn;

use crate::NetError;
use crate::packet::Packet;

/// Target kernel receive buffer. Best-effort; sampler bursts overrun the
/// default buffer long before a scheduling hiccup ends.
const RCVBUF_BYTES: libc::c_int = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    Timeout,
}

/// The capture stage's socket. Owned exclusively by that stage.
pub struct UdpCapture {
    socket: UdpSocket,
}

impl UdpCapture {
    /// Bind on `port`, optionally restrict to `sender`, and tune the
    /// socket for sustained capture.
    pub fn open(port: u16, sender: &str) -> Result<Self, NetError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| NetError::Socket { port, source })?;

        if sender != "any" {
            let peer: SocketAddr = (sender, port)
                .to_socket_addrs()
                .map_err(|_| NetError::Resolve(sender.to_string()))?
                .find(SocketAddr::is_ipv4)
                .ok_or_else(|| NetError::Resolve(sender.to_string()))?;
            socket
                .connect(peer)
                .map_err(|source| NetError::Socket { port, source })?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|source| NetError::Socket { port, source })?;

        // SAFETY: plain setsockopt on a socket we own; the option value
        // outlives the call.
        let rv = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &RCVBUF_BYTES as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rv != 0 {
            warn!(
                port,
                error = %std::io::Error::last_os_error(),
                "could not enlarge socket receive buffer"
            );
        }

        Ok(Self { socket })
    }

    /// Wait for the socket to become readable.
    pub fn wait(&self, timeout: Duration) -> Result<WaitStatus, NetError> {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: pfd is a valid pollfd for the lifetime of the call.
            let rv = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
            return match rv {
                1 => Ok(WaitStatus::Ready),
                0 => Ok(WaitStatus::Timeout),
                _ => {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    Err(NetError::Poll(err))
                }
            };
        }
    }

    /// Receive one datagram into `pkt`. Returns false when the socket had
    /// nothing after all (spurious readiness); any real failure is fatal
    /// to the stage.
    pub fn recv(&self, pkt: &mut Packet) -> Result<bool, NetError> {
        match self.socket.recv(pkt.recv_buf()) {
            Ok(n) => {
                pkt.set_len(n);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(NetError::Recv(e)),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_datagram_round_trip() {
        let rx = UdpCapture::open(0, "any").unwrap();
        let port = rx.local_port();
        let tx = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let frame = vec![0xABu8; 544];
        tx.send_to(&frame, (Ipv4Addr::LOCALHOST, port)).unwrap();

        assert_eq!(
            rx.wait(Duration::from_secs(1)).unwrap(),
            WaitStatus::Ready
        );
        let mut pkt = Packet::new();
        assert!(rx.recv(&mut pkt).unwrap());
        assert_eq!(pkt.len(), 544);
        assert_eq!(pkt.bytes()[0], 0xAB);
    }

    #[test]
    fn wait_times_out_on_silence() {
        let rx = UdpCapture::open(0, "any").unwrap();
        assert_eq!(
            rx.wait(Duration::from_millis(50)).unwrap(),
            WaitStatus::Timeout
        );
    }
}
