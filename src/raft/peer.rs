use super::context::{Context, Role};
use super::log::Log;
use super::message::{
    AppendEntriesRequest, Member, Request, RequestVoteRequest, Response,
};
use super::transport::Transport;
use super::{Index, Term, MAX_APPEND_ENTRIES};
use crate::error::Result;
use crate::{errcorrupt, errnet};

use ::log::{debug, error};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use itertools::Itertools as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A command for a peer worker.
pub enum Task {
    /// Solicit this peer's vote for the current election.
    SolicitVote,
    /// Ship new entries (or the current commit index) to this peer.
    Replicate,
    /// Stop the worker.
    Shutdown,
}

/// A handle to a peer worker, used to enqueue commands. Send failures are
/// ignored: they only occur when the worker has already stopped.
pub struct Peer {
    member: Member,
    tx: Sender<Task>,
    /// The highest index known replicated on this peer, published by its
    /// worker for the quorum computation.
    match_index: Arc<AtomicU64>,
}

impl Peer {
    pub fn new(member: Member, tx: Sender<Task>, match_index: Arc<AtomicU64>) -> Self {
        Self { member, tx, match_index }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn match_index(&self) -> Arc<AtomicU64> {
        self.match_index.clone()
    }

    pub fn solicit_vote(&self) {
        let _ = self.tx.send(Task::SolicitVote);
    }

    pub fn replicate(&self) {
        let _ = self.tx.send(Task::Replicate);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Task::Shutdown);
    }
}

/// A peer worker: drives RequestVote toward one remote member during
/// elections and AppendEntries during leadership. It owns the per-peer
/// next_index, so no other thread mutates replication progress, and runs on
/// a dedicated thread consuming its command queue. The queue receive timeout
/// doubles as the heartbeat cadence and as the retry backoff for unreachable
/// peers.
pub struct Worker {
    member: Member,
    context: Arc<Context>,
    log: Arc<Log>,
    transport: Arc<dyn Transport>,
    rx: Receiver<Task>,
    heartbeat: Duration,
    /// The published match index of every peer, ours included. Together with
    /// our own log they form the acknowledgement set for quorum commits.
    cluster_acks: Vec<Arc<AtomicU64>>,
    /// Our own entry in cluster_acks.
    match_index: Arc<AtomicU64>,
    /// The next log index to send to this peer.
    next_index: Index,
    /// The leadership term next_index and match_index were initialized for.
    /// On a term change they reset to the optimistic last_log_index + 1.
    leader_term: Term,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        member: Member,
        context: Arc<Context>,
        log: Arc<Log>,
        transport: Arc<dyn Transport>,
        rx: Receiver<Task>,
        heartbeat: Duration,
        cluster_acks: Vec<Arc<AtomicU64>>,
        match_index: Arc<AtomicU64>,
    ) -> Self {
        Self {
            member,
            context,
            log,
            transport,
            rx,
            heartbeat,
            cluster_acks,
            match_index,
            next_index: 1,
            leader_term: 0,
        }
    }

    /// Runs the worker until shutdown.
    pub fn run(mut self) {
        loop {
            let result = match self.rx.recv_timeout(self.heartbeat) {
                Ok(Task::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                Ok(Task::SolicitVote) => self.solicit_vote(),
                Ok(Task::Replicate) | Err(RecvTimeoutError::Timeout) => self.replicate(),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_fatal() => error!("Peer {} worker: {err}", self.member),
                Err(err) => debug!("Peer {} unavailable: {err}", self.member),
            }
        }
    }

    /// Solicits this peer's vote for the election at our current term. A
    /// network failure abandons the attempt; the next election retries.
    fn solicit_vote(&mut self) -> Result<()> {
        let (role, term) = self.context.role_term();
        if role != Role::Candidate {
            return Ok(());
        }
        let (last_log_term, last_log_index) = self.log.get_last_log_term_and_index();
        let request = RequestVoteRequest {
            term,
            candidate: self.context.local().clone(),
            last_log_index,
            last_log_term,
        };
        debug!("Soliciting vote from {} in term {term}", self.member);
        let response = match self.transport.call(&self.member, Request::RequestVote(request))? {
            Response::RequestVote(response) => response,
            response => return errnet!("unexpected response {response:?}"),
        };
        if response.term > term {
            return self.context.become_follower(response.term, None);
        }
        if !response.vote_granted {
            debug!("Vote denied by {} in term {term}", self.member);
            return Ok(());
        }
        if self.context.vote_and_check(term) {
            self.context.become_leader();
            // Assert leadership toward this peer right away; the other
            // workers follow within a heartbeat interval.
            return self.replicate();
        }
        Ok(())
    }

    /// Ships entries to this peer as leader, or a heartbeat when it is
    /// caught up. On a log mismatch the next index backs off one step per
    /// rejection until the logs reconnect, after which the peer's tail is
    /// replaced. Acknowledged entries update the match index and may advance
    /// the commit index via the quorum computation.
    fn replicate(&mut self) -> Result<()> {
        loop {
            let (role, term) = self.context.role_term();
            if role != Role::Leader {
                return Ok(());
            }
            if term != self.leader_term {
                self.next_index = self.log.get_last_log_index() + 1;
                self.match_index.store(0, Ordering::Release);
                self.leader_term = term;
            }

            let prev_log_index = self.next_index - 1;
            let prev_log_term = match prev_log_index {
                0 => 0,
                index => match self.log.get_entry(index)? {
                    Some(entry) => entry.term,
                    None => return errcorrupt!("log entry {index} missing during replication"),
                },
            };
            let entries = self.log.entries(self.next_index, MAX_APPEND_ENTRIES)?;
            let sent = entries.len() as u64;
            let request = AppendEntriesRequest {
                term,
                leader: self.context.local().clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.context.commit_index(),
            };
            let response =
                match self.transport.call(&self.member, Request::AppendEntries(request))? {
                    Response::AppendEntries(response) => response,
                    response => return errnet!("unexpected response {response:?}"),
                };

            if response.term > term {
                return self.context.become_follower(response.term, None);
            }
            if !response.success {
                // Log mismatch: back off one step and retry.
                self.next_index = (self.next_index - 1).max(1);
                continue;
            }

            let match_index = prev_log_index + sent;
            self.match_index.store(match_index, Ordering::Release);
            self.next_index = match_index + 1;
            self.maybe_commit()?;
            if self.next_index > self.log.get_last_log_index() {
                return Ok(());
            }
            // More entries were appended while we were shipping this batch.
        }
    }

    /// Recomputes the commit index from the acknowledgement set: the largest
    /// index replicated on a quorum, counting our own log. Advancement is
    /// additionally gated on the entry carrying the current term.
    fn maybe_commit(&self) -> Result<()> {
        let mut acked: Vec<Index> =
            self.cluster_acks.iter().map(|match_index| match_index.load(Ordering::Acquire)).collect();
        acked.push(self.log.get_last_log_index());
        let quorum = acked.len() / 2 + 1;
        let commit_index = acked.into_iter().sorted_unstable().rev().nth(quorum - 1).unwrap_or(0);
        if commit_index > self.context.commit_index() {
            self.context.advance_commit_index(commit_index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::Entry;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// A scripted transport, returning canned responses in order.
    struct TestTransport {
        requests: Mutex<Vec<(Member, Request)>>,
        responses: Mutex<VecDeque<Result<Response>>>,
    }

    impl TestTransport {
        fn new(responses: Vec<Result<Response>>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into()),
            })
        }

        fn requests(&self) -> Vec<(Member, Request)> {
            self.requests.lock().clone()
        }
    }

    impl Transport for TestTransport {
        fn call(&self, to: &Member, request: Request) -> Result<Response> {
            self.requests.lock().push((to.clone(), request));
            self.responses.lock().pop_front().expect("unscripted request")
        }
    }

    fn member(port: u16) -> Member {
        Member::new("10.0.0.1", port)
    }

    fn entry(index: Index, term: Term) -> Entry {
        Entry { index, term, command: vec![index as u8] }
    }

    /// A worker for peer 2 in a three-member cluster, with the given
    /// scripted responses.
    fn setup(
        transport: Arc<TestTransport>,
    ) -> (Worker, Arc<Context>, Arc<Log>, Vec<Arc<AtomicU64>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let log = Arc::new(Log::open(dir.path()).expect("log open failed"));
        let members = vec![member(1), member(2), member(3)];
        let context = Arc::new(Context::new(member(1), members, log.clone()));
        context.recover_init();
        let acks = vec![Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))];
        let (_tx, rx) = crossbeam::channel::unbounded();
        let worker = Worker::new(
            member(2),
            context.clone(),
            log.clone(),
            transport,
            rx,
            Duration::from_millis(10),
            acks.clone(),
            acks[0].clone(),
        );
        (worker, context, log, acks, dir)
    }

    #[test]
    fn granted_vote_wins_election() -> Result<()> {
        // The vote grant reaches a quorum (2 of 3 with the self-vote), so the
        // worker promotes the candidate and immediately asserts leadership
        // with a heartbeat.
        let transport = TestTransport::new(vec![
            Ok(Response::RequestVote(crate::raft::message::RequestVoteResponse {
                term: 1,
                vote_granted: true,
            })),
            Ok(Response::AppendEntries(crate::raft::message::AppendEntriesResponse {
                term: 1,
                success: true,
            })),
        ]);
        let (mut worker, context, _, _, _dir) = setup(transport.clone());
        context.become_candidate()?;
        worker.solicit_vote()?;
        assert_eq!(context.role_term(), (Role::Leader, 1));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(matches!(requests[1].1, Request::AppendEntries(_)));
        Ok(())
    }

    #[test]
    fn higher_term_reply_demotes_candidate() -> Result<()> {
        let transport = TestTransport::new(vec![Ok(Response::RequestVote(
            crate::raft::message::RequestVoteResponse { term: 5, vote_granted: false },
        ))]);
        let (mut worker, context, _, _, _dir) = setup(transport);
        context.become_candidate()?;
        worker.solicit_vote()?;
        assert_eq!(context.role_term(), (Role::Follower, 5));
        Ok(())
    }

    #[test]
    fn replication_advances_commit() -> Result<()> {
        // Leader at term 1; the first heartbeat pins the replication state,
        // then two appended entries ship to the peer, which with the leader's
        // own log forms a 2-of-3 quorum and commits both.
        let accept = || {
            Ok(Response::AppendEntries(crate::raft::message::AppendEntriesResponse {
                term: 1,
                success: true,
            }))
        };
        let transport = TestTransport::new(vec![accept(), accept()]);
        let (mut worker, context, _, _, _dir) = setup(transport.clone());
        context.become_candidate()?;
        assert!(context.vote_and_check(1));
        context.become_leader();

        worker.replicate()?;
        assert_eq!(worker.match_index.load(Ordering::Acquire), 0);
        assert_eq!(context.commit_index(), 0);

        context.append(vec![0x01])?;
        context.append(vec![0x02])?;
        worker.replicate()?;
        assert_eq!(worker.match_index.load(Ordering::Acquire), 2);
        assert_eq!(worker.next_index, 3);
        assert_eq!(context.commit_index(), 2);

        // The batch connected to the log the peer acknowledged.
        let requests = transport.requests();
        let Request::AppendEntries(request) = &requests[1].1 else {
            panic!("expected AppendEntries");
        };
        assert_eq!(request.prev_log_index, 0);
        assert_eq!(request.entries.len(), 2);
        Ok(())
    }

    #[test]
    fn rejection_backs_off_next_index() -> Result<()> {
        // The peer rejects twice before the logs reconnect at index 1.
        let reject = || {
            Ok(Response::AppendEntries(crate::raft::message::AppendEntriesResponse {
                term: 2,
                success: false,
            }))
        };
        let accept = Ok(Response::AppendEntries(
            crate::raft::message::AppendEntriesResponse { term: 2, success: true },
        ));
        let transport = TestTransport::new(vec![reject(), reject(), accept]);
        let (mut worker, context, log, _, _dir) = setup(transport.clone());
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1)])?;
        context.become_candidate()?;
        context.become_candidate()?;
        assert!(context.vote_and_check(2));
        context.become_leader();

        worker.replicate()?;
        assert_eq!(worker.match_index.load(Ordering::Acquire), 3);
        assert_eq!(worker.next_index, 4);

        // The probes walked back from base 3 to base 1.
        let bases: Vec<Index> = transport
            .requests()
            .iter()
            .map(|(_, request)| match request {
                Request::AppendEntries(request) => request.prev_log_index,
                request => panic!("unexpected request {request:?}"),
            })
            .collect();
        assert_eq!(bases, vec![3, 2, 1]);

        // Entries from a previous term don't commit on quorum alone.
        assert_eq!(context.commit_index(), 0);
        Ok(())
    }
}
