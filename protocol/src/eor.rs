use byteorder::{BigEndian, ByteOrder};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use common::err::{WResult, WorkerError};

/// Worker availability carried by the end-of-request sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EorStatus {
    Free = 0,
    InTransaction = 1,
    /// Not in a transaction but a cursor is still open.
    InCursorNotInTransaction = 2,
    InCursorInTransaction = 3,
    /// The worker would be free, but the client pipelined more requests
    /// into the inbound buffer.
    MoreIncomingRequests = 4,
    BusyOther = 5,
    Restart = 6,
}

impl EorStatus {
    pub fn is_free(self) -> bool {
        matches!(self, EorStatus::Free)
    }
}

/// The last frame of every response: status digit, big-endian request id,
/// then optionally the encoded terminal frame of the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EorMessage {
    pub status: EorStatus,
    pub req_id: u32,
    pub payload: Vec<u8>,
}

impl EorMessage {
    pub fn new(status: EorStatus, req_id: u32, payload: Vec<u8>) -> Self {
        EorMessage {
            status,
            req_id,
            payload,
        }
    }

    pub fn compose(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 5 + self.payload.len()];
        buf[0] = b'0' + u8::from(self.status);
        BigEndian::write_u32(&mut buf[1..5], self.req_id);
        buf[5..].copy_from_slice(&self.payload);
        buf
    }

    pub fn parse(buf: &[u8]) -> WResult<Self> {
        if buf.len() < 5 {
            return Err(WorkerError::Protocol("short EOR payload".into()));
        }
        let status = EorStatus::try_from(buf[0].wrapping_sub(b'0'))
            .map_err(|_| WorkerError::Protocol(format!("bad EOR status byte 0x{:02x}", buf[0])))?;
        let req_id = BigEndian::read_u32(&buf[1..5]);
        Ok(EorMessage {
            status,
            req_id,
            payload: buf[5..].to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compose_parse_round_trip() {
        for status in [
            EorStatus::Free,
            EorStatus::InTransaction,
            EorStatus::MoreIncomingRequests,
            EorStatus::Restart,
        ] {
            let msg = EorMessage::new(status, 0xA1B2_C3D4, b"1:5,".to_vec());
            let parsed = EorMessage::parse(&msg.compose()).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn req_id_uses_all_four_bytes() {
        // each byte position must influence the decode independently
        let msg = EorMessage::new(EorStatus::Free, 0x0102_0304, Vec::new());
        let buf = msg.compose();
        assert_eq!(&buf[1..5], &[1, 2, 3, 4]);
        assert_eq!(EorMessage::parse(&buf).unwrap().req_id, 0x0102_0304);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(EorMessage::parse(b"0").is_err());
    }

    #[test]
    fn bad_status_rejected() {
        let mut buf = EorMessage::new(EorStatus::Free, 1, Vec::new()).compose();
        buf[0] = b'9';
        assert!(EorMessage::parse(&buf).is_err());
    }
}
