//! UDP header codec. Checksums are written as zero on encode (permitted over
//! IPv4) and are never verified on decode, matching the reference gateway.

use thiserror::Error as ThisError;

pub const HEADER_OCTETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("UDP header is shorter than the minimum 8 bytes")]
    HeaderTooShort,
    #[error("UDP length {declared} is shorter than the 8-byte header")]
    LengthTooShort { declared: u16 },
    #[error("UDP length {declared} exceeds the {available} bytes available")]
    LengthExceedsBuffer { declared: u16, available: usize },
}

/// Parses a UDP header from the front of `bytes`, which must also contain at
/// least `length` bytes total (header + payload).
pub fn parse(bytes: &[u8]) -> Result<UdpHeader, ParseError> {
    if bytes.len() < HEADER_OCTETS {
        return Err(ParseError::HeaderTooShort);
    }
    let source_port = u16::from_be_bytes([bytes[0], bytes[1]]);
    let destination_port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let length = u16::from_be_bytes([bytes[4], bytes[5]]);
    if length < HEADER_OCTETS as u16 {
        return Err(ParseError::LengthTooShort { declared: length });
    }
    if length as usize > bytes.len() {
        return Err(ParseError::LengthExceedsBuffer {
            declared: length,
            available: bytes.len(),
        });
    }
    Ok(UdpHeader {
        source_port,
        destination_port,
        length,
    })
}

/// Returns the payload slice selected by a previously parsed header.
pub fn payload<'a>(bytes: &'a [u8], header: &UdpHeader) -> &'a [u8] {
    &bytes[HEADER_OCTETS..header.length as usize]
}

/// Builds an 8-byte UDP header with a zero checksum.
pub fn build(source_port: u16, destination_port: u16, payload_len: u16) -> [u8; HEADER_OCTETS] {
    let length = HEADER_OCTETS as u16 + payload_len;
    let mut header = [0u8; HEADER_OCTETS];
    header[0..2].copy_from_slice(&source_port.to_be_bytes());
    header[2..4].copy_from_slice(&destination_port.to_be_bytes());
    header[4..6].copy_from_slice(&length.to_be_bytes());
    header[6..8].copy_from_slice(&0u16.to_be_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_round_trips() {
        let payload = b"DEADBEEF";
        let header_bytes = build(47000, 47808, payload.len() as u16);
        let mut full = header_bytes.to_vec();
        full.extend_from_slice(payload);

        let parsed = parse(&full).unwrap();
        assert_eq!(parsed.source_port, 47000);
        assert_eq!(parsed.destination_port, 47808);
        assert_eq!(parsed.length as usize, HEADER_OCTETS + payload.len());
        assert_eq!(payload_of(&full, &parsed), payload);
    }

    fn payload_of<'a>(bytes: &'a [u8], header: &UdpHeader) -> &'a [u8] {
        payload(bytes, header)
    }

    #[test]
    fn checksum_field_is_zero() {
        let header = build(1, 2, 0);
        assert_eq!(&header[6..8], &[0, 0]);
    }

    #[test]
    fn rejects_declared_length_past_buffer() {
        let mut header = build(1, 2, 4);
        header[4..6].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(
            parse(&header),
            Err(ParseError::LengthExceedsBuffer {
                declared: 100,
                available: header.len()
            })
        );
    }
}
