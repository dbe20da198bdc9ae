//! Newline packet framing.
//!
//! A packet is every byte up to and including a `\n`. Packets have no
//! length limit and may span any number of reads; bytes after the last
//! delimiter are carried forward as the residual.
//!
//! ```text
//! residual "ab"  +  chunk "c\nde\nf"  =>  packets ["abc\n", "de\n"], residual "f"
//! ```

use bytes::{Bytes, BytesMut};

/// Packet delimiter.
pub const DELIMITER: u8 = b'\n';

/// Output of one framing step.
#[derive(Debug, Default)]
pub struct Framed {
    /// Complete packets in arrival order, each ending with `\n`.
    pub packets: Vec<Bytes>,
    /// Unterminated bytes to carry into the next step.
    pub residual: BytesMut,
}

/// Append `chunk` to `residual` and split off every complete packet.
///
/// `residual` must be the remainder of a previous call (no delimiter).
/// Nothing is trimmed or validated; only the delimiter is significant.
pub fn feed(residual: BytesMut, chunk: &[u8]) -> Framed {
    let mut buf = residual;
    // Bytes already in the residual were scanned by the previous step.
    let mut scan_from = buf.len();
    buf.extend_from_slice(chunk);

    let mut packets = Vec::new();
    while let Some(pos) = find_delimiter(&buf[scan_from..]) {
        let end = scan_from + pos + 1;
        packets.push(buf.split_to(end).freeze());
        scan_from = 0;
    }

    Framed {
        packets,
        residual: buf,
    }
}

/// Find the first `\n` in buffer.
fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == DELIMITER)
}
