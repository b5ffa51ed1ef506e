//! Line-based AT command transport: writes `AT...\r\n` commands, reads
//! trimmed response lines, and classifies unsolicited `+NNMI:` receive lines.
//!
//! Generic over any `Read + Write` byte stream so it can be driven by a real
//! serial port in the binaries and by an in-memory buffer in tests.

use crate::addr::MeshId;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::trace;

/// An unsolicited `+NNMI:` receive event: a frame from `src_mesh` carrying
/// `payload` bytes (the raw tunnel frame, header included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NnmiFrame {
    pub src_mesh: MeshId,
    pub payload: Vec<u8>,
}

/// Classifies one trimmed line read from the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Ok,
    Error,
    Nnmi(NnmiFrame),
    Other(String),
}

pub fn classify_line(line: &str) -> LineKind {
    if let Some(nnmi) = parse_nnmi_line(line) {
        return LineKind::Nnmi(nnmi);
    }
    if is_ok_line(line) {
        return LineKind::Ok;
    }
    if is_error_line(line) {
        return LineKind::Error;
    }
    LineKind::Other(line.to_string())
}

pub fn is_ok_line(line: &str) -> bool {
    line == "OK" || line.ends_with(":OK")
}

pub fn is_error_line(line: &str) -> bool {
    line == "ERROR" || line.starts_with("ERROR") || line.ends_with(":ERROR")
}

/// Parses an unsolicited `+NNMI:` line. Accepts the 5-field shape
/// (`src_hex,*,*,dec_len,hex_payload`) and the 3-field shape
/// (`src_hex,dec_len,hex_payload`). Returns `None` for anything that isn't a
/// `+NNMI:` line, that fails to parse as hex/decimal, or whose declared
/// length doesn't match the decoded payload length — all silently dropped
/// per the protocol's error-handling design.
pub fn parse_nnmi_line(line: &str) -> Option<NnmiFrame> {
    let body = line.strip_prefix("+NNMI:")?.trim();
    let parts: Vec<&str> = body.split(',').map(str::trim).collect();

    let (src_text, len_text, payload_text) = if parts.len() >= 5 {
        (parts[0], parts[3], parts[4])
    } else if parts.len() >= 3 {
        (parts[0], parts[1], parts[2])
    } else {
        return None;
    };

    let src_mesh = MeshId(u16::from_str_radix(src_text, 16).ok()?);
    let declared_len: usize = len_text.parse().ok()?;
    let payload = decode_hex(payload_text)?;
    if payload.len() != declared_len {
        return None;
    }

    Some(NnmiFrame { src_mesh, payload })
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Formats `dest,len,HEX,type` for an `AT+SEND=` command.
pub fn format_at_send(dest: MeshId, payload: &[u8], send_type: u8) -> String {
    let hex = payload
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<String>();
    format!("AT+SEND={dest},{},{hex},{send_type}", payload.len())
}

/// A line-framed AT command transport over any duplex byte stream.
pub struct AtTransport<S> {
    stream: S,
    pending: Vec<u8>,
}

impl<S: Read + Write> AtTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    /// Unwraps the transport, discarding any partially-buffered line. Used to
    /// hand the underlying stream off (e.g. to split a serial port into
    /// separate reader/writer handles after an initial init sequence).
    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn write_line(&mut self, text: &str) -> io::Result<()> {
        trace!(line = text, "SER/TX");
        self.stream.write_all(text.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        self.stream.flush()
    }

    /// Reads one complete, trimmed line. Returns `Ok(None)` if the
    /// underlying stream's read timed out before a newline arrived, or hit
    /// EOF with no buffered line — both are routine "nothing this poll"
    /// outcomes, not errors.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.take_pending_line() {
            trace!(line = %line, "SER/RX");
            return Ok(Some(line));
        }
        let mut buf = [0u8; 512];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if let Some(line) = self.take_pending_line() {
                        trace!(line = %line, "SER/RX");
                        return Ok(Some(line));
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn take_pending_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Sends `cmd` and blocks (subject to `timeout`) for a terminal `OK`/`ERROR`
    /// status line, dispatching any `+NNMI:` lines observed in the meantime to
    /// `on_nnmi` instead of discarding them.
    pub fn send_cmd_wait_ok(
        &mut self,
        cmd: &str,
        timeout: Duration,
        mut on_nnmi: impl FnMut(NnmiFrame),
    ) -> io::Result<bool> {
        self.write_line(cmd)?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.read_line()? {
                Some(line) => match classify_line(&line) {
                    LineKind::Nnmi(frame) => on_nnmi(frame),
                    LineKind::Ok => return Ok(true),
                    LineKind::Error => return Ok(false),
                    LineKind::Other(_) => {}
                },
                None => continue,
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_five_field_nnmi() {
        let frame = parse_nnmi_line("+NNMI:0003,0,0,3,AABBCC").unwrap();
        assert_eq!(frame.src_mesh, MeshId(0x0003));
        assert_eq!(frame.payload, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn parses_three_field_nnmi() {
        let frame = parse_nnmi_line("+NNMI:0003,3,AABBCC").unwrap();
        assert_eq!(frame.src_mesh, MeshId(0x0003));
        assert_eq!(frame.payload, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn nnmi_is_case_insensitive_on_hex() {
        let frame = parse_nnmi_line("+NNMI:0003,3,aabbcc").unwrap();
        assert_eq!(frame.payload, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn nnmi_length_mismatch_is_dropped() {
        assert_eq!(parse_nnmi_line("+NNMI:0003,2,AABBCC"), None);
    }

    #[test]
    fn non_nnmi_line_is_not_parsed() {
        assert_eq!(parse_nnmi_line("OK"), None);
    }

    #[test]
    fn status_line_classification() {
        assert!(is_ok_line("OK"));
        assert!(is_ok_line("AT+SEND:OK"));
        assert!(!is_ok_line("OKAY"));
        assert!(is_error_line("ERROR"));
        assert!(is_error_line("AT+SEND:ERROR"));
        assert!(is_error_line("ERROR: busy"));
    }

    #[test]
    fn formats_at_send_with_uppercase_hex() {
        let dest = MeshId(0x0003);
        let cmd = format_at_send(dest, &[0xAB, 0xCD], 0);
        assert_eq!(cmd, "AT+SEND=0003,2,ABCD,0");
    }

    #[test]
    fn reads_crlf_framed_lines_and_trims_them() {
        let stream = Cursor::new(b"OK\r\n+NNMI:0003,2,AABB\r\n".to_vec());
        let mut transport = AtTransport::new(stream);
        assert_eq!(transport.read_line().unwrap().as_deref(), Some("OK"));
        let second = transport.read_line().unwrap().unwrap();
        assert_eq!(classify_line(&second), LineKind::Nnmi(NnmiFrame {
            src_mesh: MeshId(0x0003),
            payload: vec![0xAA, 0xBB],
        }));
    }

    #[test]
    fn send_cmd_wait_ok_dispatches_intervening_nnmi_lines() {
        let stream = Cursor::new(b"+NNMI:0003,2,AABB\r\nOK\r\n".to_vec());
        let mut transport = AtTransport::new(stream);
        let mut seen = Vec::new();
        let ok = transport
            .send_cmd_wait_ok("AT", Duration::from_millis(50), |frame| seen.push(frame))
            .unwrap();
        assert!(ok);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].src_mesh, MeshId(0x0003));
    }

    #[test]
    fn send_cmd_wait_ok_returns_false_on_error_status() {
        let stream = Cursor::new(b"ERROR\r\n".to_vec());
        let mut transport = AtTransport::new(stream);
        let ok = transport
            .send_cmd_wait_ok("AT", Duration::from_millis(50), |_| {})
            .unwrap();
        assert!(!ok);
    }
}
