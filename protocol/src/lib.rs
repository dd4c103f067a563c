pub mod codes;
pub mod control;
pub mod eor;
pub mod netstring;

/// Frame Constants
/// A frame is `<len>":"<code>[" "<payload>]","` with decimal length/code.
pub const FRAME_SEPARATOR: u8 = b':';
pub const FRAME_TERMINATOR: u8 = b',';
/// Upper bound on a single frame payload; anything larger is a broken peer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Interrupt payload is 1 flags byte + 4 bytes big-endian request id.
pub const INTERRUPT_PAYLOAD_LEN: usize = 5;
