//! Splits an outbound tunnel frame into MTU-sized, sequenced `AT+SEND` fragments.

use thiserror::Error as ThisError;

/// Serial AT payloads are kept at or below this size.
pub const MTU: usize = 200;

/// Max sequence number representable in the 7-bit fragment header field.
const MAX_SEQ: u8 = 0x7F;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum FragmentError {
    #[error("message requires more than {} fragments at MTU {MTU}", MAX_SEQ as u16 + 1)]
    TooManyFragments,
}

/// Splits `tunnel` (already prefixed with its 3-byte [`crate::tunnel`] header)
/// into the ordered sequence of `AT+SEND` payloads that carry it.
///
/// Fragment 0 is the first `MTU` bytes of `tunnel` verbatim. Every later
/// fragment repeats the original 3-byte header, with byte 1 rewritten to
/// carry that fragment's own sequence number and last-fragment flag, followed
/// by up to `MTU - 3` bytes of continuation payload. A message that fits in a
/// single fragment still gets its last-fragment bit set.
pub fn fragment(tunnel: &[u8]) -> Result<Vec<Vec<u8>>, FragmentError> {
    let total = tunnel.len();
    let header_prefix = if total >= 3 {
        [tunnel[0], tunnel[1], tunnel[2]]
    } else {
        [0, 0, 0]
    };

    let mut fragments = Vec::new();
    let mut offset = 0usize;
    let mut seq: u8 = 0;

    loop {
        let mut chunk = if seq == 0 {
            let end = total.min(MTU);
            let chunk = tunnel[..end].to_vec();
            offset = end;
            chunk
        } else {
            let remain = total - offset;
            let payload_len = remain.min(MTU - 3);
            let mut chunk = Vec::with_capacity(3 + payload_len);
            chunk.extend_from_slice(&header_prefix);
            chunk.extend_from_slice(&tunnel[offset..offset + payload_len]);
            offset += payload_len;
            chunk
        };

        if seq > MAX_SEQ {
            return Err(FragmentError::TooManyFragments);
        }
        let is_last = offset >= total;
        chunk[1] = (if is_last { 0x80 } else { 0x00 }) | (seq & 0x7F);
        fragments.push(chunk);

        if is_last {
            break;
        }
        seq += 1;
    }

    Ok(fragments)
}
