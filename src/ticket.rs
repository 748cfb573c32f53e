use crate::transfer_future::TransferFuture;

/// Descriptor of one side of a transfer, passed between worker threads and,
/// as the payload of a control frame, across the wire.
///
/// For a send ticket `addr`/`key` are local (`lkey`); for a recv ticket
/// published to the peer they are remote (`rkey`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    /// The user-chosen stream the transfer belongs to
    pub stream_id: u32,
    /// Transfer length in bytes
    pub length: u32,
    /// Buffer address
    pub addr: u64,
    /// Access key for `addr`
    pub key: u32,
}

/// Wire length of one control frame
pub(crate) const FRAME_LEN: usize = 24;

/// What a control frame means to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// The receiver advertises a landing slot for one transfer
    RecvAnnounce,
    /// The sender refuses a pairing whose lengths disagree; the receiver
    /// must pop and fail the head of that stream's expected queue
    LengthReject,
}

/// A control frame as exchanged over SEND/RECV on the shared queue pair.
///
/// Fixed 24-byte little-endian layout, identical on both peers:
/// `stream_id u32 | length u32 | addr u64 | key u32 | kind u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlFrame {
    /// Frame meaning
    pub(crate) kind: FrameKind,
    /// Frame payload
    pub(crate) ticket: Ticket,
}

impl ControlFrame {
    /// Pack into the fixed wire form
    pub(crate) fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0_u8; FRAME_LEN];
        buf[..4].copy_from_slice(&self.ticket.stream_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ticket.length.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ticket.addr.to_le_bytes());
        buf[16..20].copy_from_slice(&self.ticket.key.to_le_bytes());
        let kind: u32 = match self.kind {
            FrameKind::RecvAnnounce => 0,
            FrameKind::LengthReject => 1,
        };
        buf[20..].copy_from_slice(&kind.to_le_bytes());
        buf
    }

    /// Unpack from the wire form; `None` for a short buffer or an unknown
    /// kind word
    pub(crate) fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_LEN {
            return None;
        }
        // the slices have the exact lengths
        #[allow(clippy::unwrap_used)]
        let ticket = Ticket {
            stream_id: u32::from_le_bytes(buf[..4].try_into().unwrap()),
            length: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            addr: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            key: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        };
        #[allow(clippy::unwrap_used)]
        let kind = match u32::from_le_bytes(buf[20..24].try_into().unwrap()) {
            0 => FrameKind::RecvAnnounce,
            1 => FrameKind::LengthReject,
            _ => return None,
        };
        Some(Self { kind, ticket })
    }
}

/// A user request: the ticket plus the future the engine must resolve
#[derive(Debug, Clone)]
pub(crate) struct Command {
    /// The request descriptor
    pub(crate) ticket: Ticket,
    /// Resolved exactly once by a worker thread
    pub(crate) future: TransferFuture,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = ControlFrame {
            kind: FrameKind::RecvAnnounce,
            ticket: Ticket {
                stream_id: 42,
                length: 16 * 1024 * 1024,
                addr: 0x7f00_dead_beef_0000,
                key: 0x1234_5678,
            },
        };
        let buf = frame.encode();
        assert_eq!(ControlFrame::decode(&buf), Some(frame));

        let reject = ControlFrame {
            kind: FrameKind::LengthReject,
            ticket: Ticket {
                stream_id: 0,
                length: 0,
                addr: 0,
                key: 0,
            },
        };
        assert_eq!(ControlFrame::decode(&reject.encode()), Some(reject));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(ControlFrame::decode(&[0_u8; 8]), None);

        let mut buf = [0_u8; FRAME_LEN];
        buf[20..].copy_from_slice(&7_u32.to_le_bytes());
        assert_eq!(ControlFrame::decode(&buf), None);
    }

    #[test]
    fn layout_is_little_endian() {
        let frame = ControlFrame {
            kind: FrameKind::LengthReject,
            ticket: Ticket {
                stream_id: 1,
                length: 2,
                addr: 3,
                key: 4,
            },
        };
        let buf = frame.encode();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[4], 2);
        assert_eq!(buf[8], 3);
        assert_eq!(buf[16], 4);
        assert_eq!(buf[20], 1);
    }
}
