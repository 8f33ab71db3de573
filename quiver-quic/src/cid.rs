//! Connection ID tables (RFC 9000 Section 5.1).
//!
//! Each endpoint tracks the IDs it has issued to the peer and the IDs
//! the peer has issued to it. Every entry carries a sequence number and
//! a stateless reset token; exactly one entry per table is active.

use crate::error::{Error, Result, TransportErrorCode};
use crate::frames::Frame;
use crate::types::{ConnectionId, ResetToken};

/// Length of connection IDs this endpoint issues.
pub const LOCAL_CID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct CidEntry {
    pub seq: u64,
    pub cid: ConnectionId,
    pub reset_token: ResetToken,
}

/// IDs we issued for the peer to address us with.
#[derive(Debug)]
pub struct LocalCids {
    entries: Vec<CidEntry>,
    next_seq: u64,
    active: u64,
}

impl LocalCids {
    /// Seeds the table with the handshake-time source CID (sequence 0).
    pub fn new(initial: ConnectionId) -> Self {
        Self {
            entries: vec![CidEntry { seq: 0, cid: initial, reset_token: rand_token() }],
            next_seq: 1,
            active: 0,
        }
    }

    pub fn active(&self) -> &CidEntry {
        self.entries.iter().find(|e| e.seq == self.active).expect("active CID present")
    }

    /// Mints a fresh ID and returns the NEW_CONNECTION_ID frame
    /// announcing it.
    pub fn issue(&mut self) -> Frame {
        let entry = CidEntry {
            seq: self.next_seq,
            cid: ConnectionId::random(LOCAL_CID_LEN),
            reset_token: rand_token(),
        };
        self.next_seq += 1;
        let frame = Frame::NewConnectionId {
            seq: entry.seq,
            retire_prior_to: 0,
            cid: entry.cid,
            reset_token: entry.reset_token,
        };
        self.entries.push(entry);
        frame
    }

    /// Handles RETIRE_CONNECTION_ID from the peer.
    pub fn retire(&mut self, seq: u64) -> Result<()> {
        if seq >= self.next_seq {
            return Err(Error::transport(
                TransportErrorCode::ProtocolViolation,
                "retiring an unissued connection ID",
            ));
        }
        self.entries.retain(|e| e.seq != seq);
        if self.active == seq {
            // Peer retired our active ID; fall forward to the newest.
            if let Some(newest) = self.entries.iter().map(|e| e.seq).max() {
                self.active = newest;
            }
        }
        Ok(())
    }

    /// Whether `cid` addresses this connection.
    pub fn owns(&self, cid: &ConnectionId) -> bool {
        self.entries.iter().any(|e| &e.cid == cid)
    }
}

/// IDs the peer issued for us to address it with.
#[derive(Debug)]
pub struct PeerCids {
    entries: Vec<CidEntry>,
    active: u64,
    limit: u64,
}

impl PeerCids {
    /// Seeds with the peer's handshake source CID; its reset token
    /// arrives later in the transport parameters.
    pub fn new(initial: ConnectionId) -> Self {
        Self {
            entries: vec![CidEntry { seq: 0, cid: initial, reset_token: [0; 16] }],
            active: 0,
            limit: 2,
        }
    }

    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Replaces the sequence-0 CID when the handshake rebinds it (the
    /// server's chosen SCID replaces the client's guess, or a Retry SCID).
    pub fn rebind_initial(&mut self, cid: ConnectionId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.seq == 0) {
            entry.cid = cid;
        }
    }

    pub fn set_initial_reset_token(&mut self, token: ResetToken) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.seq == 0) {
            entry.reset_token = token;
        }
    }

    /// The CID to put in outgoing packet headers.
    pub fn active(&self) -> &CidEntry {
        self.entries.iter().find(|e| e.seq == self.active).expect("active CID present")
    }

    /// Handles NEW_CONNECTION_ID. Returns RETIRE_CONNECTION_ID frames we
    /// owe the peer for IDs below `retire_prior_to`.
    pub fn on_new_cid(
        &mut self,
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: ResetToken,
    ) -> Result<Vec<Frame>> {
        if retire_prior_to > seq {
            return Err(Error::transport(
                TransportErrorCode::ProtocolViolation,
                "retire_prior_to exceeds sequence number",
            ));
        }

        if let Some(existing) = self.entries.iter().find(|e| e.seq == seq) {
            if existing.cid != cid {
                return Err(Error::transport(
                    TransportErrorCode::ProtocolViolation,
                    "sequence number reused for a different connection ID",
                ));
            }
            return Ok(Vec::new());
        }

        self.entries.push(CidEntry { seq, cid, reset_token });

        let mut retired = Vec::new();
        self.entries.retain(|e| {
            if e.seq < retire_prior_to {
                retired.push(Frame::RetireConnectionId { seq: e.seq });
                false
            } else {
                true
            }
        });
        if self.active < retire_prior_to {
            self.active = self.entries.iter().map(|e| e.seq).min().unwrap_or(seq);
        }

        if self.entries.len() as u64 > self.limit {
            return Err(Error::transport(
                TransportErrorCode::ConnectionIdLimitError,
                "peer exceeded active_connection_id_limit",
            ));
        }
        Ok(retired)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn rand_token() -> ResetToken {
    let mut token = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut token[..]);
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_retire() {
        let mut cids = LocalCids::new(ConnectionId::random(8));
        let frame = cids.issue();
        let Frame::NewConnectionId { seq, cid, .. } = frame else {
            panic!("expected NEW_CONNECTION_ID");
        };
        assert_eq!(seq, 1);
        assert!(cids.owns(&cid));

        cids.retire(0).unwrap();
        assert_eq!(cids.active().seq, 1);
        assert!(cids.retire(9).is_err());
    }

    #[test]
    fn peer_cid_rotation() {
        let mut cids = PeerCids::new(ConnectionId::random(8));
        cids.set_limit(4);
        let c1 = ConnectionId::random(8);
        assert!(cids.on_new_cid(1, 0, c1, [1; 16]).unwrap().is_empty());
        assert_eq!(cids.len(), 2);
        assert_eq!(cids.active().seq, 0);

        // retire_prior_to 1 forces us off sequence 0.
        let c2 = ConnectionId::random(8);
        let retired = cids.on_new_cid(2, 1, c2, [2; 16]).unwrap();
        assert_eq!(retired.len(), 1);
        assert!(matches!(retired[0], Frame::RetireConnectionId { seq: 0 }));
        assert_eq!(cids.active().seq, 1);
    }

    #[test]
    fn duplicate_new_cid_is_idempotent() {
        let mut cids = PeerCids::new(ConnectionId::random(8));
        let c1 = ConnectionId::random(8);
        cids.on_new_cid(1, 0, c1, [1; 16]).unwrap();
        assert!(cids.on_new_cid(1, 0, c1, [1; 16]).unwrap().is_empty());
        // Same sequence, different CID is a violation.
        assert!(cids.on_new_cid(1, 0, ConnectionId::random(8), [1; 16]).is_err());
    }

    #[test]
    fn cid_limit_enforced() {
        let mut cids = PeerCids::new(ConnectionId::random(8));
        cids.set_limit(2);
        cids.on_new_cid(1, 0, ConnectionId::random(8), [1; 16]).unwrap();
        assert!(cids.on_new_cid(2, 0, ConnectionId::random(8), [2; 16]).is_err());
    }
}
