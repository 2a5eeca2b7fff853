//! Server-held sessions keyed by opaque tokens
//!
//! Whether a voter is mid-ballot, and which location a monitor has drilled
//! into, lives here rather than on the client. The client only ever holds
//! the token. The server keeps a salted Blake3 hash of each token, never the
//! token itself, and compares hashes in constant time.

use crate::config::SessionConfig;
use crate::location::ViewerLocation;
use crate::types::VoterId;
use crate::{Error, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Opaque bearer token handed to the client
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a token presented by a client
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// Where a voter is in the voting flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoterStage {
    SelectingBallot,
    Submitted,
}

/// Who the session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    Voter { voter_id: VoterId, stage: VoterStage },
    Monitor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub principal: Principal,
    pub selection: ViewerLocation,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn voter_id(&self) -> Option<VoterId> {
        match self.principal {
            Principal::Voter { voter_id, .. } => Some(voter_id),
            Principal::Monitor => None,
        }
    }
}

struct SessionEntry {
    token_hash: [u8; 32],
    session: Session,
}

/// Issues, resolves and ends sessions
pub struct SessionService {
    key: [u8; 32],
    ttl: chrono::Duration,
    sessions: RwLock<HashMap<[u8; 32], SessionEntry>>,
}

impl SessionService {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let ttl = chrono::Duration::from_std(config.ttl())
            .map_err(|_| Error::validation("session ttl out of range"))?;
        Ok(Self {
            key: config.salt_key()?,
            ttl,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn for_testing() -> Self {
        Self {
            key: rand::random(),
            ttl: chrono::Duration::minutes(5),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn hash_token(&self, token: &str) -> [u8; 32] {
        *blake3::keyed_hash(&self.key, token.as_bytes()).as_bytes()
    }

    /// Open a session and return its token
    pub fn issue(&self, principal: Principal, selection: ViewerLocation) -> Result<SessionToken> {
        let raw = Zeroizing::new(rand::random::<[u8; 32]>());
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw.as_slice());
        let token_hash = self.hash_token(&token);

        let issued_at = Utc::now();
        let session = Session {
            principal,
            selection,
            issued_at,
            expires_at: issued_at + self.ttl,
        };

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| Error::session("Session table write error"))?;
        sessions.insert(
            token_hash,
            SessionEntry {
                token_hash,
                session,
            },
        );

        tracing::debug!("Session {} issued", hex::encode(&token_hash[..4]));
        Ok(SessionToken(token))
    }

    /// Look up a live session
    pub fn resolve(&self, token: &SessionToken) -> Result<Session> {
        let token_hash = self.hash_token(token.as_str());
        let sessions = self
            .sessions
            .read()
            .map_err(|_| Error::session("Session table read error"))?;

        let entry = sessions
            .get(&token_hash)
            .filter(|entry| bool::from(entry.token_hash.ct_eq(&token_hash)))
            .ok_or_else(|| Error::session("unknown session"))?;

        if entry.session.is_expired() {
            return Err(Error::session("session expired"));
        }
        Ok(entry.session.clone())
    }

    fn update(&self, token: &SessionToken, apply: impl FnOnce(&mut Session)) -> Result<Session> {
        let token_hash = self.hash_token(token.as_str());
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| Error::session("Session table write error"))?;
        let entry = sessions
            .get_mut(&token_hash)
            .filter(|entry| !entry.session.is_expired())
            .ok_or_else(|| Error::session("unknown or expired session"))?;
        apply(&mut entry.session);
        Ok(entry.session.clone())
    }

    /// Replace the session's location selection
    pub fn update_selection(
        &self,
        token: &SessionToken,
        selection: ViewerLocation,
    ) -> Result<Session> {
        self.update(token, |session| session.selection = selection)
    }

    /// Record that the voter behind the session has submitted
    pub fn mark_submitted(&self, token: &SessionToken) -> Result<Session> {
        self.update(token, |session| {
            if let Principal::Voter { stage, .. } = &mut session.principal {
                *stage = VoterStage::Submitted;
            }
        })
    }

    /// End a session; returns whether it existed
    pub fn end(&self, token: &SessionToken) -> Result<bool> {
        let token_hash = self.hash_token(token.as_str());
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| Error::session("Session table write error"))?;
        Ok(sessions.remove(&token_hash).is_some())
    }

    /// Drop expired sessions, returning how many were removed
    pub fn purge_expired(&self) -> Result<usize> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| Error::session("Session table write error"))?;
        let before = sessions.len();
        sessions.retain(|_, entry| !entry.session.is_expired());
        Ok(before - sessions.len())
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .map(|sessions| {
                sessions
                    .values()
                    .filter(|entry| !entry.session.is_expired())
                    .count()
            })
            .unwrap_or(0)
    }
}
