use super::log::Entry;
use super::{Index, Term};
use crate::encoding;
use crate::errinput;
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};

/// A cluster member identity, as an ip:port pair. The port doubles as the
/// identity under which votes are recorded, so members must keep stable
/// addresses across restarts.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Member {
    pub ip: String,
    pub port: u16,
}

impl Member {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl std::str::FromStr for Member {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s.rsplit_once(':').ok_or_else(|| -> Error {
            Error::InvalidInput(format!("invalid member address {s}"))
        })?;
        if ip.is_empty() {
            return errinput!("invalid member address {s}");
        }
        let port = port.parse().map_err(|_| -> Error {
            Error::InvalidInput(format!("invalid member port in {s}"))
        })?;
        Ok(Self::new(ip, port))
    }
}

/// A RequestVote call, soliciting a vote from a peer during an election.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// The candidate's current term.
    pub term: Term,
    /// The candidate soliciting the vote.
    pub candidate: Member,
    /// The index of the candidate's last log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The voter's current term, for the candidate to update itself by.
    pub term: Term,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// An AppendEntries call, replicating log entries to a follower. An empty
/// entry set serves as a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: Term,
    /// The sending leader.
    pub leader: Member,
    /// The index of the log entry immediately preceding the submitted entries.
    pub prev_log_index: Index,
    /// The term of the log entry immediately preceding the submitted entries.
    pub prev_log_term: Term,
    /// Entries to replicate.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: Index,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The receiver's current term, for the leader to update itself by.
    pub term: Term,
    /// Whether the entries were accepted.
    pub success: bool,
}

/// A request sent over a peer or client connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    /// Writes a key/value pair through the replicated log. Leader only.
    Put { key: String, value: Vec<u8> },
    /// Deletes a key through the replicated log. Leader only.
    Delete { key: String },
    /// Reads a key at the leader.
    Get { key: String },
    /// Reads a key from the local replica, with no consistency guarantee.
    DirtyGet { key: String },
    /// Fetches the current leader.
    Leader,
}

/// A response to a Request. Sent across the wire as a Result, so errors
/// propagate to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    Put,
    Delete,
    Get(Option<Vec<u8>>),
    DirtyGet(Option<Vec<u8>>),
    Leader(Member),
}

impl encoding::Value for Request {}
impl encoding::Value for Response {}
impl encoding::Value for Result<Response> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_parse() -> Result<()> {
        assert_eq!("127.0.0.1:7001".parse::<Member>()?, Member::new("127.0.0.1", 7001));
        assert_eq!(Member::new("10.0.0.3", 9000).to_string(), "10.0.0.3:9000");
        assert!("127.0.0.1".parse::<Member>().is_err());
        assert!(":7001".parse::<Member>().is_err());
        assert!("127.0.0.1:notaport".parse::<Member>().is_err());
        Ok(())
    }
}
