//! want/have negotiation for upload-pack.
//!
//! Implements git's basic acknowledgement mode (no `multi_ack`): the first
//! `have` the server knows is acknowledged with `ACK <id>`, a flush before
//! any common object yields `NAK`, and `done` yields a final `NAK` when
//! nothing was ever acknowledged.

use crate::pktline::PktLine;
use crate::{GitError, Result};
use githost_storage::{HashAlgorithm, ObjectId, ObjectStore};
use std::collections::BTreeSet;

/// Where the session is in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Reading `want` lines.
    Wants,
    /// Reading `have` lines.
    Haves,
    /// `done` was received, or the client wanted nothing.
    Done,
}

/// A line the server sends back during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// A common object.
    Ack(ObjectId),
    /// No common object yet.
    Nak,
}

impl Acknowledgement {
    /// The pkt-line payload for this acknowledgement.
    pub fn line(&self) -> String {
        match self {
            Self::Ack(id) => format!("ACK {}\n", id),
            Self::Nak => "NAK\n".to_string(),
        }
    }
}

/// State of one upload-pack request. Never persisted.
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    algorithm: HashAlgorithm,
    state: NegotiationState,
    wants: Vec<ObjectId>,
    common: Vec<ObjectId>,
    capabilities: BTreeSet<String>,
    acked: bool,
}

impl NegotiationSession {
    /// Starts a session for a repository using `algorithm`.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            state: NegotiationState::Wants,
            wants: Vec::new(),
            common: Vec::new(),
            capabilities: BTreeSet::new(),
            acked: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// True once `done` was received or the client wanted nothing.
    pub fn is_done(&self) -> bool {
        self.state == NegotiationState::Done
    }

    /// Requested objects, in request order.
    pub fn wants(&self) -> &[ObjectId] {
        &self.wants
    }

    /// Client objects the server also has.
    pub fn common(&self) -> &[ObjectId] {
        &self.common
    }

    /// True when the client listed `capability` on its first want.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Feeds one packet. Returns the acknowledgement it triggers, if any.
    pub fn advance(&mut self, pkt: &PktLine, store: &ObjectStore) -> Result<Option<Acknowledgement>> {
        match (self.state, pkt) {
            (NegotiationState::Done, _) => Err(GitError::protocol("data after done")),
            (_, PktLine::Delimiter) | (_, PktLine::ResponseEnd) => Err(GitError::protocol(
                "delimiter packets are not part of protocol v0",
            )),

            (NegotiationState::Wants, PktLine::Flush) => {
                self.state = if self.wants.is_empty() {
                    NegotiationState::Done
                } else {
                    NegotiationState::Haves
                };
                Ok(None)
            }
            (NegotiationState::Wants, PktLine::Data(_)) => {
                let line = text(pkt)?;
                let rest = line
                    .strip_prefix("want ")
                    .ok_or_else(|| GitError::protocol(format!("expected want, got {:?}", line)))?;
                let (hex, caps) = match rest.split_once(' ') {
                    Some((hex, caps)) => (hex, Some(caps)),
                    None => (rest, None),
                };
                let id = self.parse_id(hex)?;
                if self.wants.is_empty() {
                    if let Some(caps) = caps {
                        self.capabilities = caps.split(' ').filter(|c| !c.is_empty()).map(String::from).collect();
                    }
                }
                if !store.exists(&id) {
                    return Err(GitError::UnknownWant(id));
                }
                if !self.wants.contains(&id) {
                    self.wants.push(id);
                }
                Ok(None)
            }

            (NegotiationState::Haves, PktLine::Flush) => {
                Ok((!self.acked).then_some(Acknowledgement::Nak))
            }
            (NegotiationState::Haves, PktLine::Data(_)) => {
                let line = text(pkt)?;
                if line == "done" {
                    self.state = NegotiationState::Done;
                    return Ok((!self.acked).then_some(Acknowledgement::Nak));
                }
                let hex = line
                    .strip_prefix("have ")
                    .ok_or_else(|| GitError::protocol(format!("expected have or done, got {:?}", line)))?;
                let id = self.parse_id(hex)?;
                if !store.exists(&id) || self.common.contains(&id) {
                    return Ok(None);
                }
                self.common.push(id);
                if self.acked {
                    return Ok(None);
                }
                self.acked = true;
                Ok(Some(Acknowledgement::Ack(id)))
            }
        }
    }

    fn parse_id(&self, hex: &str) -> Result<ObjectId> {
        ObjectId::from_hex_with(hex, self.algorithm)
            .map_err(|e| GitError::protocol(format!("bad object id {:?}: {}", hex, e)))
    }
}

fn text(pkt: &PktLine) -> Result<&str> {
    pkt.as_str()
        .ok_or_else(|| GitError::protocol("negotiation line is not utf-8"))
}
