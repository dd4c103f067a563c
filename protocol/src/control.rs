use byteorder::{BigEndian, ByteOrder};

use common::err::{WResult, WorkerError};

use crate::INTERRUPT_PAYLOAD_LEN;

/// Out-of-band interrupt sent by the mux on the control channel. Only
/// effective when `req_id` matches the worker's in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptMessage {
    pub flags: u8,
    pub req_id: u32,
}

impl InterruptMessage {
    pub fn new(flags: u8, req_id: u32) -> Self {
        InterruptMessage { flags, req_id }
    }

    pub fn compose(&self) -> [u8; INTERRUPT_PAYLOAD_LEN] {
        let mut buf = [0u8; INTERRUPT_PAYLOAD_LEN];
        buf[0] = self.flags;
        BigEndian::write_u32(&mut buf[1..5], self.req_id);
        buf
    }

    pub fn parse(buf: &[u8]) -> WResult<Self> {
        if buf.len() != INTERRUPT_PAYLOAD_LEN {
            return Err(WorkerError::Protocol(format!(
                "interrupt payload length {}",
                buf.len()
            )));
        }
        Ok(InterruptMessage {
            flags: buf[0],
            req_id: BigEndian::read_u32(&buf[1..5]),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let msg = InterruptMessage::new(3, 42);
        assert_eq!(InterruptMessage::parse(&msg.compose()).unwrap(), msg);
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(InterruptMessage::parse(&[0, 0, 0, 1]).is_err());
        assert!(InterruptMessage::parse(&[0; 6]).is_err());
    }
}
