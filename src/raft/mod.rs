//! A Raft-based consensus core, maintaining a strongly consistent replicated
//! log across a small cluster of nodes.
//!
//! Based on "In Search of an Understandable Consensus Algorithm" (Ongaro and
//! Ousterhout). The core runs an election timer thread, an apply worker
//! thread, and one worker thread per remote member, all sharing the replica
//! state in [`Context`] and the durable log in [`Log`].

mod apply;
mod context;
mod log;
mod message;
mod peer;
mod server;
mod timer;
mod transport;

pub use context::{Context, Role};
pub use log::{Entry, Log};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Member, Request, RequestVoteRequest,
    RequestVoteResponse, Response,
};
pub use server::{Options, Server};
pub use transport::{TcpTransport, Transport};

/// A log index. Indices are 1-based and dense; 0 indicates no entry.
pub type Index = u64;

/// A leader election term. Terms are monotonically increasing; 0 is no term.
pub type Term = u64;

/// The maximum number of entries shipped in a single AppendEntries batch.
const MAX_APPEND_ENTRIES: usize = 64;

/// How long a client write waits for its entry to be applied.
const APPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
