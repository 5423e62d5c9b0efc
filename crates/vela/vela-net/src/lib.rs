//! `vela-net`: UDP packet formats and the capture stage.
//!
//! The sampling board emits fixed-size UDP datagrams; the format of a
//! datagram is identified purely by its byte count. The capture stage
//! turns that unreliable stream into gap-filled, sequence-aligned blocks
//! in the first databuf: every packet lands at the offset its sequence
//! number dictates, missing slots are zeroed and accounted as drops, and
//! block headers carry the observation parameters plus per-block packet
//! bookkeeping for the downstream stages.

mod capture;
mod packet;
mod socket;
mod vdif;

use thiserror::Error;

pub use capture::{CaptureConfig, CaptureCounters, CaptureState, ParkesParams, run_capture};
pub use packet::{MAX_PACKET_SIZE, Packet, PacketFormat, parkes_rescale};
pub use socket::{UdpCapture, WaitStatus};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to open UDP socket on port {port}")]
    Socket {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("could not resolve sender host '{0}'")]
    Resolve(String),
    #[error("poll on UDP socket failed")]
    Poll(#[source] std::io::Error),
    #[error("receive on UDP socket failed")]
    Recv(#[source] std::io::Error),
    #[error("packet size {0} matches no known format")]
    UnsupportedSize(usize),
    #[error(transparent)]
    Databuf(#[from] vela_databuf::DatabufError),
    #[error(transparent)]
    Status(#[from] vela_status::StatusError),
    #[error(transparent)]
    Cards(#[from] vela_cards::CardsError),
    #[error("shutdown requested")]
    Shutdown,
}
