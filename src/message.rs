//! The high-level message handed to and received from an [`crate::endpoint::Endpoint`].

use crate::frame::RawCanFrame;
use crate::id;

bitflags::bitflags! {
    /// Ancillary flags attached to a received message, mirroring the
    /// `MSG_*` flags `recvmsg` reports for a loopback/own-message frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// This frame originated from some endpoint on this host, not the wire.
        const DONTROUTE = 0x01;
        /// This frame originated from the receiving endpoint itself.
        const CONFIRM = 0x02;
    }
}

/// A single-frame ISOBUS application message: a PGN-tagged payload with its
/// source and destination addresses.
#[derive(Debug, Clone)]
pub struct IsobusMessage {
    pub pgn: u32,
    pub priority: u8,
    pub saddr: u8,
    pub daddr: u8,
    pub payload: Vec<u8>,
    pub flags: MsgFlags,
}

impl IsobusMessage {
    #[must_use]
    pub fn new(pgn: u32, payload: Vec<u8>) -> Self {
        Self {
            pgn,
            priority: 6,
            saddr: id::NULL_ADDR,
            daddr: id::GLOBAL_ADDR,
            payload,
            flags: MsgFlags::empty(),
        }
    }

    /// Encode this message, as sent by `saddr`, into a raw CAN frame.
    #[must_use]
    pub fn to_frame(&self) -> RawCanFrame {
        let can_id = id::encode(self.priority, self.pgn, self.daddr, self.saddr);
        RawCanFrame::new(can_id, &self.payload)
    }

    /// Decode a raw CAN frame received off the wire into a message. Returns
    /// `None` for frames outside the ISO 11783 namespace (EDP bit set) or
    /// frames whose payload is larger than this protocol allows.
    #[must_use]
    pub fn from_frame(frame: &RawCanFrame) -> Option<Self> {
        let can_id = frame.id();
        if id::field(can_id, id::Field::Edp) != 0 {
            return None;
        }
        if frame.can_dlc as usize > crate::frame::MAX_DLEN {
            return None;
        }

        Some(Self {
            pgn: id::decode_pgn(can_id),
            priority: id::decode_priority(can_id),
            saddr: id::field(can_id, id::Field::Sa) as u8,
            daddr: id::field(can_id, id::Field::Ps) as u8,
            payload: frame.payload().to_vec(),
            flags: MsgFlags::empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut msg = IsobusMessage::new(0x00EE00, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        msg.saddr = 0x81;
        msg.daddr = 0x80;
        msg.priority = 6;

        let frame = msg.to_frame();
        let back = IsobusMessage::from_frame(&frame).unwrap();

        assert_eq!(back.pgn, msg.pgn & id::PGN1_MASK);
        assert_eq!(back.saddr, msg.saddr);
        assert_eq!(back.daddr, msg.daddr);
        assert_eq!(back.payload, msg.payload);
    }

    #[test]
    fn rejects_reserved_edp_namespace() {
        let frame = RawCanFrame::new(0x1A00_0000, &[]);
        assert!(IsobusMessage::from_frame(&frame).is_none());
    }
}
