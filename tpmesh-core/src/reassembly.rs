//! Per-source reassembly of fragmented tunnel frames.

use crate::addr::MeshId;
use crate::tunnel::TunnelHeader;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

struct Session {
    expected_seq: u8,
    buffer: Vec<u8>,
    last_update: Instant,
}

/// Tracks one in-progress reassembly per source [`MeshId`]. Sessions that see
/// no new fragment within `idle_timeout` are dropped the next time any
/// fragment (from any source) is received.
pub struct Reassembler {
    sessions: FxHashMap<MeshId, Session>,
    idle_timeout: Duration,
}

impl Reassembler {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: FxHashMap::default(),
            idle_timeout,
        }
    }

    /// Feeds one received fragment from `src` into its reassembly session.
    /// Returns the complete tunnel frame once the last fragment arrives.
    /// Malformed or out-of-sequence fragments silently discard the session
    /// (and return `None`) rather than erroring: the next seq=0 starts fresh.
    pub fn receive(&mut self, src: MeshId, fragment: &[u8]) -> Option<Vec<u8>> {
        self.sweep_expired();

        let header = TunnelHeader::parse(fragment).ok()?;

        if header.seq == 0 {
            let session = Session {
                expected_seq: 1,
                buffer: fragment.to_vec(),
                last_update: Instant::now(),
            };
            if header.last_fragment {
                return Some(session.buffer);
            }
            self.sessions.insert(src, session);
            return None;
        }

        let in_sequence = matches!(self.sessions.get(&src), Some(session) if session.expected_seq == header.seq);
        if !in_sequence {
            self.sessions.remove(&src);
            return None;
        }

        let session = self.sessions.get_mut(&src).expect("checked above");
        session.buffer.extend_from_slice(&fragment[3..]);
        session.expected_seq += 1;
        session.last_update = Instant::now();

        if header.last_fragment {
            self.sessions.remove(&src).map(|s| s.buffer)
        } else {
            None
        }
    }

    fn sweep_expired(&mut self) {
        let timeout = self.idle_timeout;
        self.sessions
            .retain(|_, session| session.last_update.elapsed() <= timeout);
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::RULE_NO_COMPRESS;

    fn frame(seq: u8, last: bool, rest: &[u8]) -> Vec<u8> {
        let header = TunnelHeader {
            broadcast: false,
            last_fragment: last,
            seq,
            rule: RULE_NO_COMPRESS,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(rest);
        out
    }

    #[test]
    fn single_fragment_completes_immediately() {
        let mut r = Reassembler::new(Duration::from_secs(5));
        let src = MeshId(3);
        let msg = frame(0, true, b"hello");
        assert_eq!(r.receive(src, &msg), Some(msg));
        assert_eq!(r.session_count(), 0);
    }

    #[test]
    fn two_fragments_concatenate_in_order() {
        let mut r = Reassembler::new(Duration::from_secs(5));
        let src = MeshId(3);
        let first = frame(0, false, b"hello ");
        let second = frame(1, true, b"world");
        assert_eq!(r.receive(src, &first), None);
        assert_eq!(r.session_count(), 1);
        let result = r.receive(src, &second).unwrap();
        assert_eq!(&result[3..], b"hello world");
        assert_eq!(r.session_count(), 0);
    }

    #[test]
    fn skipping_a_sequence_number_drops_the_session() {
        let mut r = Reassembler::new(Duration::from_secs(5));
        let src = MeshId(3);
        r.receive(src, &frame(0, false, b"a"));
        assert_eq!(r.receive(src, &frame(2, true, b"c")), None);
        assert_eq!(r.session_count(), 0, "skipped seq must discard the session");
    }

    #[test]
    fn a_fresh_seq_zero_replaces_a_stale_session() {
        let mut r = Reassembler::new(Duration::from_secs(5));
        let src = MeshId(3);
        r.receive(src, &frame(0, false, b"stale-start"));
        let restart = frame(0, true, b"restarted");
        assert_eq!(r.receive(src, &restart), Some(restart));
    }

    #[test]
    fn sessions_from_different_sources_are_independent() {
        let mut r = Reassembler::new(Duration::from_secs(5));
        r.receive(MeshId(1), &frame(0, false, b"one"));
        r.receive(MeshId(2), &frame(0, false, b"two"));
        assert_eq!(r.session_count(), 2);
        let done = r.receive(MeshId(1), &frame(1, true, b"-done")).unwrap();
        assert_eq!(&done[3..], b"one-done");
        assert_eq!(r.session_count(), 1);
    }

    #[test]
    fn idle_session_is_swept_after_timeout() {
        let mut r = Reassembler::new(Duration::from_millis(0));
        let src = MeshId(3);
        r.receive(src, &frame(0, false, b"a"));
        assert_eq!(r.session_count(), 1);
        // Any subsequent call sweeps sessions older than the (zero) timeout.
        r.receive(MeshId(99), &frame(0, true, b"ping"));
        assert_eq!(r.session_count(), 0);
    }
}
