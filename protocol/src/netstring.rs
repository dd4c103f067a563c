use std::io::{ErrorKind, Read, Write};

use bytes::{BufMut, BytesMut};

use common::err::{WResult, WorkerError};

use crate::{FRAME_SEPARATOR, FRAME_TERMINATOR, MAX_FRAME_LENGTH};

/// Reads `<len>:<code>[ <payload>],` frames from a byte stream.
///
/// A frame with code 0 is a nested group whose payload is itself a frame
/// sequence; a single nesting level is supported and the group is drained
/// frame by frame across subsequent `read` calls.
///
/// The frame counter doubles as the request sequence number the mux uses
/// to address interrupts.
pub struct NetstringReader<R: Read> {
    inner: R,
    buf: BytesMut,
    pos: usize,
    group: Vec<u8>,
    group_pos: usize,
    count: u32,
}

const READ_CHUNK: usize = 16 * 1024;

impl<R: Read> NetstringReader<R> {
    pub fn new(inner: R) -> Self {
        NetstringReader {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            pos: 0,
            group: Vec::new(),
            group_pos: 0,
            count: 0,
        }
    }

    /// Frames delivered so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// True when no buffered bytes remain: neither a partially drained
    /// nested group nor read-ahead from the stream. Used to detect
    /// pipelined requests at EOR time.
    pub fn is_buffer_empty(&self) -> bool {
        self.group_pos >= self.group.len() && self.pos >= self.buf.len()
    }

    /// Code of the next frame if its header is already buffered, without
    /// consuming anything. Lets command handlers take optional follow-up
    /// frames only when the client actually pipelined them.
    pub fn peek_buffered_code(&self) -> Option<u32> {
        let buffered: &[u8] = if self.group_pos < self.group.len() {
            &self.group[self.group_pos..]
        } else if self.pos < self.buf.len() {
            &self.buf[self.pos..]
        } else {
            return None;
        };

        let mut i = 0;
        while i < buffered.len() && buffered[i].is_ascii_digit() {
            i += 1;
        }
        if i == 0 || i >= buffered.len() || buffered[i] != FRAME_SEPARATOR {
            return None;
        }
        i += 1;
        let mut code: u32 = 0;
        let mut digits = 0;
        while i < buffered.len() && buffered[i].is_ascii_digit() {
            code = code * 10 + (buffered[i] - b'0') as u32;
            digits += 1;
            i += 1;
        }
        if digits == 0 || i >= buffered.len() {
            return None;
        }
        Some(code)
    }

    /// Reads the next frame, returning its code and replacing `payload`
    /// with its payload bytes.
    pub fn read(&mut self, payload: &mut Vec<u8>) -> WResult<u32> {
        payload.clear();

        if self.group_pos < self.group.len() {
            return self.read_from_group(payload);
        }

        let length = self.read_decimal_until(FRAME_SEPARATOR)?;
        if length > MAX_FRAME_LENGTH {
            return Err(WorkerError::Protocol(format!(
                "frame length {} exceeds limit",
                length
            )));
        }

        let (code, code_digits, delim) = self.read_code()?;
        let mut remaining = length
            .checked_sub(code_digits)
            .ok_or_else(|| WorkerError::Protocol("length shorter than code".into()))?;

        if delim == FRAME_TERMINATOR {
            // zero-length payload
            self.count += 1;
            return Ok(code);
        }
        if delim != b' ' {
            return Err(WorkerError::Protocol(format!(
                "expected separator, got 0x{:02x}",
                delim
            )));
        }
        remaining = remaining
            .checked_sub(1)
            .ok_or_else(|| WorkerError::Protocol("length shorter than header".into()))?;

        let mut body = vec![0u8; remaining];
        self.read_exact_buffered(&mut body)?;
        if self.read_byte()? != FRAME_TERMINATOR {
            return Err(WorkerError::Protocol("missing frame terminator".into()));
        }

        if code == 0 {
            self.group = body;
            self.group_pos = 0;
            return self.read_from_group(payload);
        }

        *payload = body;
        self.count += 1;
        Ok(code)
    }

    fn read_from_group(&mut self, payload: &mut Vec<u8>) -> WResult<u32> {
        let buf = &self.group[self.group_pos..];
        let mut i = 0;

        let mut length: usize = 0;
        let mut digits = 0;
        while i < buf.len() && buf[i].is_ascii_digit() {
            length = length * 10 + (buf[i] - b'0') as usize;
            digits += 1;
            i += 1;
        }
        if digits == 0 || i >= buf.len() || buf[i] != FRAME_SEPARATOR {
            self.reset_group();
            return Err(WorkerError::Protocol("bad nested frame header".into()));
        }
        i += 1;

        let mut code: u32 = 0;
        let mut code_digits = 0;
        while i < buf.len() && buf[i].is_ascii_digit() {
            code = code * 10 + (buf[i] - b'0') as u32;
            code_digits += 1;
            i += 1;
        }
        if code_digits == 0 || i >= buf.len() {
            self.reset_group();
            return Err(WorkerError::Protocol("bad nested frame code".into()));
        }

        if buf[i] == FRAME_TERMINATOR {
            self.group_pos += i + 1;
            self.count += 1;
            return Ok(code);
        }
        if buf[i] != b' ' {
            self.reset_group();
            return Err(WorkerError::Protocol("bad nested frame separator".into()));
        }
        i += 1;
        let body_len = match length.checked_sub(code_digits + 1) {
            Some(n) if i + n < buf.len() => n,
            _ => {
                self.reset_group();
                return Err(WorkerError::Protocol("nested frame truncated".into()));
            }
        };
        payload.extend_from_slice(&buf[i..i + body_len]);
        i += body_len;
        if buf[i] != FRAME_TERMINATOR {
            self.reset_group();
            return Err(WorkerError::Protocol("nested frame unterminated".into()));
        }
        self.group_pos += i + 1;
        if self.group_pos >= self.group.len() {
            self.reset_group();
        }
        self.count += 1;
        Ok(code)
    }

    fn reset_group(&mut self) {
        self.group.clear();
        self.group_pos = 0;
    }

    fn read_decimal_until(&mut self, delim: u8) -> WResult<usize> {
        let mut value: usize = 0;
        let mut digits = 0;
        loop {
            let b = match self.read_byte() {
                Ok(b) => b,
                // EOF between frames is an orderly close
                Err(e) if digits == 0 && e.is_disconnect() => return Err(WorkerError::Disconnected),
                Err(e) => return Err(e),
            };
            if b == delim {
                if digits == 0 {
                    return Err(WorkerError::Protocol("empty length field".into()));
                }
                return Ok(value);
            }
            if !b.is_ascii_digit() {
                return Err(WorkerError::Protocol(format!(
                    "non-digit 0x{:02x} in length",
                    b
                )));
            }
            value = value * 10 + (b - b'0') as usize;
            digits += 1;
        }
    }

    /// Code digits end at a space (payload follows) or a comma (empty
    /// payload). Returns (code, digit_count, delimiter).
    fn read_code(&mut self) -> WResult<(u32, usize, u8)> {
        let mut code: u32 = 0;
        let mut digits = 0;
        loop {
            let b = self.read_byte()?;
            if b.is_ascii_digit() {
                code = code * 10 + (b - b'0') as u32;
                digits += 1;
                continue;
            }
            if digits == 0 {
                return Err(WorkerError::Protocol("empty code field".into()));
            }
            return Ok((code, digits, b));
        }
    }

    fn read_byte(&mut self) -> WResult<u8> {
        if self.pos >= self.buf.len() {
            self.fill()?;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_exact_buffered(&mut self, out: &mut [u8]) -> WResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos >= self.buf.len() {
                self.fill()?;
            }
            let avail = self.buf.len() - self.pos;
            let take = avail.min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }

    fn fill(&mut self) -> WResult<()> {
        self.buf.clear();
        self.pos = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(WorkerError::Disconnected),
                Ok(n) => {
                    self.buf.put_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(WorkerError::Io(e)),
            }
        }
    }
}

/// Writes frames, either immediately or accumulated into groups that are
/// flushed as a nested code-0 envelope when more than one frame piled up.
pub struct NetstringWriter<W: Write> {
    out: W,
    groups: Vec<Vec<u8>>,
    counts: Vec<u32>,
}

impl<W: Write> NetstringWriter<W> {
    pub fn new(out: W) -> Self {
        NetstringWriter {
            out,
            groups: vec![Vec::new()],
            counts: vec![0],
        }
    }

    /// Immediate single-frame write, bypassing the pending groups.
    pub fn write(&mut self, code: u32, payload: &[u8]) -> WResult<()> {
        let mut buf = Vec::with_capacity(payload.len() + 16);
        encode_frame(&mut buf, code, payload);
        self.out.write_all(&buf)?;
        self.out.flush()?;
        Ok(())
    }

    /// Accumulates one frame into the current group.
    pub fn add(&mut self, code: u32, payload: &[u8]) {
        *self.counts.last_mut().unwrap() += 1;
        let group = self.groups.last_mut().unwrap();
        encode_frame(group, code, payload);
    }

    /// Starts a new group; frames added after this flush as a separate
    /// envelope.
    pub fn separate(&mut self) {
        self.groups.push(Vec::new());
        self.counts.push(0);
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.counts.clear();
        self.separate();
    }

    /// Flushes all pending groups: an empty group writes nothing, a
    /// single-frame group is written unwrapped, anything larger goes out
    /// as one code-0 envelope.
    pub fn flush_groups(&mut self) -> WResult<()> {
        let mut raw = Vec::new();
        for (group, count) in self.groups.iter().zip(self.counts.iter()) {
            match count {
                0 => continue,
                1 => raw.extend_from_slice(group),
                _ => encode_frame(&mut raw, 0, group),
            }
        }
        self.groups.clear();
        self.counts.clear();
        self.separate();

        if raw.is_empty() {
            return Ok(());
        }
        self.out.write_all(&raw)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Appends one encoded frame to `out`. Length covers the code digits plus
/// the optional space and payload.
pub fn encode_frame(out: &mut Vec<u8>, code: u32, payload: &[u8]) {
    let code_str = code.to_string();
    let total = if payload.is_empty() {
        code_str.len()
    } else {
        code_str.len() + 1 + payload.len()
    };
    out.extend_from_slice(total.to_string().as_bytes());
    out.push(FRAME_SEPARATOR);
    out.extend_from_slice(code_str.as_bytes());
    if !payload.is_empty() {
        out.push(b' ');
        out.extend_from_slice(payload);
    }
    out.push(FRAME_TERMINATOR);
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    fn encode(code: u32, payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        encode_frame(&mut v, code, payload);
        v
    }

    #[test]
    fn encode_shapes() {
        assert_eq!(encode(5, b""), b"1:5,");
        assert_eq!(encode(3, b"abc"), b"5:3 abc,");
        assert_eq!(encode(25, b"x"), b"4:25 x,");
    }

    #[test]
    fn decode_round_trip() {
        let cases: Vec<(u32, &[u8])> = vec![
            (1, b"SELECT 1 FROM dual"),
            (2, b":id"),
            (5, b""),
            (1008, b""),
            (502, b"0\x00\x00\x00\x07"),
        ];
        let mut wire = Vec::new();
        for (code, payload) in &cases {
            encode_frame(&mut wire, *code, payload);
        }
        let mut reader = NetstringReader::new(Cursor::new(wire));
        let mut payload = Vec::new();
        for (code, expect) in &cases {
            let got = reader.read(&mut payload).unwrap();
            assert_eq!(got, *code);
            assert_eq!(&payload, expect);
        }
        assert_eq!(reader.count(), cases.len() as u32);
    }

    #[test]
    fn nested_group_drains_frame_by_frame() {
        let mut inner = Vec::new();
        encode_frame(&mut inner, 2, b":id");
        encode_frame(&mut inner, 3, b"7");
        encode_frame(&mut inner, 4, b"");
        let mut wire = Vec::new();
        encode_frame(&mut wire, 0, &inner);

        let mut reader = NetstringReader::new(Cursor::new(wire));
        let mut payload = Vec::new();
        assert_eq!(reader.read(&mut payload).unwrap(), 2);
        assert_eq!(payload, b":id");
        assert!(!reader.is_buffer_empty());
        assert_eq!(reader.read(&mut payload).unwrap(), 3);
        assert_eq!(payload, b"7");
        assert_eq!(reader.read(&mut payload).unwrap(), 4);
        assert!(payload.is_empty());
        assert_eq!(reader.count(), 3);
    }

    #[test]
    fn garbage_is_a_hard_error() {
        let mut reader = NetstringReader::new(Cursor::new(b"xx:1,".to_vec()));
        let mut payload = Vec::new();
        assert!(matches!(
            reader.read(&mut payload),
            Err(WorkerError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_payload_is_a_hard_error() {
        let mut reader = NetstringReader::new(Cursor::new(b"10:3 abc".to_vec()));
        let mut payload = Vec::new();
        let err = reader.read(&mut payload).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Disconnected | WorkerError::Protocol(_)
        ));
    }

    #[test]
    fn eof_between_frames_is_disconnect() {
        let mut reader = NetstringReader::new(Cursor::new(Vec::new()));
        let mut payload = Vec::new();
        assert!(matches!(
            reader.read(&mut payload),
            Err(WorkerError::Disconnected)
        ));
    }

    #[test]
    fn peek_does_not_consume() {
        let mut wire = Vec::new();
        encode_frame(&mut wire, 15, b"1:abc:x");
        encode_frame(&mut wire, 16, b"5");
        let mut reader = NetstringReader::new(Cursor::new(wire));
        let mut payload = Vec::new();

        assert!(reader.peek_buffered_code().is_none()); // nothing read yet
        assert_eq!(reader.read(&mut payload).unwrap(), 15);
        assert_eq!(reader.peek_buffered_code(), Some(16));
        assert_eq!(reader.peek_buffered_code(), Some(16));
        assert_eq!(reader.read(&mut payload).unwrap(), 16);
        assert!(reader.peek_buffered_code().is_none());
    }

    #[test]
    fn writer_groups() {
        let mut out = Vec::new();
        {
            let mut w = NetstringWriter::new(&mut out);
            w.add(3, b"a");
            w.separate();
            w.add(3, b"b");
            w.add(5, b"");
            w.flush_groups().unwrap();
        }
        // first group has one frame: unwrapped; second has two: envelope
        let mut reader = NetstringReader::new(Cursor::new(out));
        let mut payload = Vec::new();
        assert_eq!(reader.read(&mut payload).unwrap(), 3);
        assert_eq!(payload, b"a");
        assert_eq!(reader.read(&mut payload).unwrap(), 3);
        assert_eq!(payload, b"b");
        assert_eq!(reader.read(&mut payload).unwrap(), 5);
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let mut out = Vec::new();
        {
            let mut w = NetstringWriter::new(&mut out);
            w.separate();
            w.flush_groups().unwrap();
        }
        assert!(out.is_empty());
    }
}
