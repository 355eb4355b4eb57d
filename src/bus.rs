use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Socket};

use crate::registers::PAYLOAD_LEN;

/// One register request or reply on the bus.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Frame {
    pub channel: u16,
    pub data: [u8; PAYLOAD_LEN],
}

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("could not open CAN interface `{1}`")]
    Open(#[source] std::io::Error, String),
    #[error("{0:#x} is not a valid standard CAN id")]
    InvalidChannel(u16),
    #[error("could not transmit a CAN frame")]
    Transmit(#[source] std::io::Error),
}

/// Fire-and-forget transmit capability.
///
/// The engine is the only holder of this; nothing else transmits. Reception arrives separately
/// through [`crate::engine::Engine::on_frame`].
pub trait Bus {
    fn send(&mut self, frame: &Frame) -> Result<(), BusError>;
}

/// Linux SocketCAN-backed transmitter.
pub struct SocketCanBus {
    socket: CanSocket,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self, BusError> {
        let socket = CanSocket::open(interface)
            .map_err(|e| BusError::Open(e, interface.to_string()))?;
        Ok(Self { socket })
    }
}

impl Bus for SocketCanBus {
    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        let id = socketcan::StandardId::new(frame.channel)
            .ok_or(BusError::InvalidChannel(frame.channel))?;
        let can = CanFrame::new(id, &frame.data)
            .ok_or(BusError::InvalidChannel(frame.channel))?;
        self.socket.write_frame(&can).map_err(BusError::Transmit)
    }
}

/// Convert a received CAN frame into the engine's view of it.
///
/// Extended-id and remote frames are not part of the register protocol; they yield `None` and
/// the caller drops them. Short payloads are zero-padded, the reply matcher discards anything
/// that does not correlate anyway.
pub fn frame_from_can(frame: &CanFrame) -> Option<Frame> {
    let socketcan::Id::Standard(id) = frame.id() else {
        return None;
    };
    let payload = frame.data();
    let mut data = [0; PAYLOAD_LEN];
    let length = payload.len().min(PAYLOAD_LEN);
    data[..length].copy_from_slice(&payload[..length]);
    Some(Frame { channel: id.as_raw(), data })
}
