//! Session tokens for read-your-writes.
//!
//! Every successful local upsert returns `"<peerId>.<sequenceId>"`. A
//! caller presents the token on later reads; the read path polls
//! `is_consistent` until the producing peer's contiguous prefix covers the
//! sequence. Malformed tokens decode to "no token" — the request passes.

use std::fmt;
use std::str::FromStr;

use quilt_core::errors::ReplicationError;
use quilt_core::peer::PeerId;

/// Largest integer a JSON peer can represent losslessly (2^53 - 1).
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Longest token string accepted by the parser.
const MAX_TOKEN_LEN: usize = 50;

/// "My write at this sequence."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken {
    pub peer: PeerId,
    pub seq: i64,
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer, self.seq)
    }
}

impl FromStr for SessionToken {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_TOKEN_LEN {
            return Err(ReplicationError::InvalidSessionToken);
        }
        let (peer, seq) = s
            .split_once('.')
            .ok_or(ReplicationError::InvalidSessionToken)?;
        let peer: i64 = peer
            .parse()
            .map_err(|_| ReplicationError::InvalidSessionToken)?;
        let seq: i64 = seq
            .parse()
            .map_err(|_| ReplicationError::InvalidSessionToken)?;
        if peer <= 0 || seq <= 0 || peer > MAX_SAFE_INTEGER || seq > MAX_SAFE_INTEGER {
            return Err(ReplicationError::InvalidSessionToken);
        }
        Ok(Self { peer, seq })
    }
}

/// Middleware-facing parse: malformed strings are "no token".
pub fn parse_session_token(s: &str) -> Option<SessionToken> {
    s.parse().ok()
}
