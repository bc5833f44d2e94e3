use super::log::{Entry, Log};
use super::message::Member;
use super::{Index, Term};
use crate::error::{Error, Result};

use ::log::{debug, info};
use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A replica role. A replica starts as a follower, campaigns as a candidate
/// when its election timer fires, and leads after winning a quorum of votes.
/// Observing a higher term demotes any role back to follower.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Replica state guarded by the state lock: role, term, vote and leader
/// bookkeeping. Term and vote mirror the durable metadata record; the known
/// leader is in-memory only and relearned from traffic after a restart.
struct ReplicaState {
    role: Role,
    current_term: Term,
    voted_for: Option<Member>,
    leader: Option<Member>,
    /// Votes received this term while campaigning, including our own.
    vote_quorum: u64,
}

/// Apply progress guarded by the apply lock, coordinating the apply worker
/// and wait_apply callers through the apply condvar.
struct ApplyProgress {
    apply_index: Index,
    shutdown: bool,
}

/// The authoritative in-memory replica state, shared by the RPC handlers,
/// the peer workers, the election timer and the apply worker.
///
/// Lock order is state → commit → apply; the log store's internal lock is a
/// leaf and is never held while acquiring any of these. The state lock is
/// writer-preferring so role transitions are not starved by the predicate
/// reads of heavy RPC traffic.
pub struct Context {
    local: Member,
    members: Vec<Member>,
    log: Arc<Log>,
    state: RwLock<ReplicaState>,
    /// Serializes commit index advancement.
    commit_mu: Mutex<()>,
    /// The published commit index, readable without the commit lock.
    commit_index: AtomicU64,
    apply: Mutex<ApplyProgress>,
    apply_cond: Condvar,
}

impl Context {
    /// Creates the replica state for the given member set. Call recover_init
    /// afterwards to load the durable voting record.
    pub fn new(local: Member, members: Vec<Member>, log: Arc<Log>) -> Self {
        Self {
            local,
            members,
            log,
            state: RwLock::new(ReplicaState {
                role: Role::Follower,
                current_term: 0,
                voted_for: None,
                leader: None,
                vote_quorum: 0,
            }),
            commit_mu: Mutex::new(()),
            commit_index: AtomicU64::new(0),
            apply: Mutex::new(ApplyProgress { apply_index: 0, shutdown: false }),
            apply_cond: Condvar::new(),
        }
    }

    /// Recovers term and vote from the log's metadata record, starting out
    /// as a follower with no known leader.
    pub fn recover_init(&self) {
        let (term, vote) = self.log.get_term();
        let mut state = self.state.write();
        state.current_term = term;
        state.voted_for = vote;
        state.role = Role::Follower;
        state.leader = None;
        info!("Recovered replica state at term {term}");
    }

    /// Returns the local member identity.
    pub fn local(&self) -> &Member {
        &self.local
    }

    /// Returns the current role and term.
    pub fn role_term(&self) -> (Role, Term) {
        let state = self.state.read();
        (state.role, state.current_term)
    }

    /// Returns whether this replica currently considers itself leader.
    pub fn is_leader(&self) -> bool {
        self.state.read().role == Role::Leader
    }

    /// Returns the known leader for the current term, if any.
    pub fn leader(&self) -> Option<Member> {
        self.state.read().leader.clone()
    }

    /// Transitions to follower on observing the given term. A stale term is
    /// ignored; a higher term durably bumps the current term and clears the
    /// vote and any known leader. The sender is recorded as leader when given.
    pub fn become_follower(&self, new_term: Term, leader: Option<&Member>) -> Result<()> {
        let mut state = self.state.write();
        self.follow(&mut state, new_term, leader)
    }

    /// become_follower with the state lock already held.
    fn follow(
        &self,
        state: &mut RwLockWriteGuard<'_, ReplicaState>,
        new_term: Term,
        leader: Option<&Member>,
    ) -> Result<()> {
        if new_term < state.current_term {
            return Ok(());
        }
        if new_term > state.current_term {
            // Persist before mutating, so a storage failure can't leave the
            // in-memory term ahead of the durable record.
            self.log.update_metadata(new_term, None)?;
            debug!("Following term {new_term}, was {}", state.current_term);
            state.current_term = new_term;
            state.voted_for = None;
            state.leader = None;
        }
        if let Some(leader) = leader {
            if state.leader.as_ref() != Some(leader) {
                info!("Following leader {leader} in term {}", state.current_term);
                state.leader = Some(leader.clone());
            }
        }
        state.role = Role::Follower;
        Ok(())
    }

    /// Starts a new election: durably bumps the term, votes for ourselves and
    /// becomes candidate. Leaders don't campaign; their heartbeat cadence
    /// replaces the election timer.
    pub fn become_candidate(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.role == Role::Leader {
            return Ok(());
        }
        let term = state.current_term + 1;
        self.log.update_metadata(term, Some(&self.local))?;
        state.current_term = term;
        state.role = Role::Candidate;
        state.leader = None;
        state.voted_for = Some(self.local.clone());
        state.vote_quorum = 1;
        info!("Became candidate in term {term}");
        Ok(())
    }

    /// Assumes leadership after winning an election. Idempotent if already
    /// leader. Only a candidate may be promoted: a concurrent demotion (a
    /// higher term arrived after the winning vote was tallied) voids the
    /// election.
    pub fn become_leader(&self) {
        let mut state = self.state.write();
        if state.role != Role::Candidate {
            if state.role == Role::Follower {
                debug!("Ignoring leadership promotion, no longer candidate");
            }
            return;
        }
        state.role = Role::Leader;
        state.leader = Some(self.local.clone());
        info!("Became leader in term {}", state.current_term);
    }

    /// The vote safety predicate, servicing an inbound RequestVote. Grants
    /// the vote iff the candidate's term is current, we haven't voted for
    /// anyone else this term, and the candidate's log is at least as
    /// up-to-date as ours. Returns the grant and our current term.
    pub fn request_vote(
        &self,
        term: Term,
        candidate: &Member,
        last_log_index: Index,
        last_log_term: Term,
    ) -> Result<(bool, Term)> {
        let mut state = self.state.write();
        if term < state.current_term {
            return Ok((false, state.current_term));
        }
        if term > state.current_term {
            self.follow(&mut state, term, None)?;
        }
        if let Some(voted_for) = &state.voted_for {
            if voted_for != candidate {
                debug!("Denying vote to {candidate}, already voted for {voted_for}");
                return Ok((false, state.current_term));
            }
        }
        let (my_log_term, my_log_index) = self.log.get_last_log_term_and_index();
        if last_log_term < my_log_term
            || (last_log_term == my_log_term && last_log_index < my_log_index)
        {
            debug!(
                "Denying vote to {candidate}, log {last_log_term}:{last_log_index} \
                 behind ours {my_log_term}:{my_log_index}"
            );
            return Ok((false, state.current_term));
        }
        self.log.update_metadata(state.current_term, Some(candidate))?;
        state.voted_for = Some(candidate.clone());
        info!("Granted vote to {candidate} in term {}", state.current_term);
        Ok((true, state.current_term))
    }

    /// Tallies a granted vote for the election held at vote_term. Returns
    /// true once the tally reaches a quorum of the member set. Stale replies
    /// from a previous election are ignored.
    pub fn vote_and_check(&self, vote_term: Term) -> bool {
        let mut state = self.state.write();
        if state.current_term != vote_term {
            return false;
        }
        state.vote_quorum += 1;
        state.vote_quorum > self.members.len() as u64 / 2
    }

    /// Services an inbound AppendEntries: demotes ourselves if the sender's
    /// term warrants it, checks log consistency against the previous entry,
    /// reconciles a conflicting uncommitted tail, and appends the entries.
    /// Returns acceptance and our current term.
    pub fn append_entries(
        &self,
        term: Term,
        leader: &Member,
        prev_log_term: Term,
        prev_log_index: Index,
        entries: Vec<Entry>,
    ) -> Result<(bool, Term)> {
        let mut state = self.state.write();
        if term < state.current_term {
            return Ok((false, state.current_term));
        }
        // A current-term AppendEntries always comes from the leader of that
        // term: record it and drop out of any candidacy.
        self.follow(&mut state, term, Some(leader))?;

        let (_, my_log_index) = self.log.get_last_log_term_and_index();
        if prev_log_index > my_log_index {
            debug!("Rejecting entries from {leader}: missing base entry {prev_log_index}");
            return Ok((false, state.current_term));
        }
        if prev_log_index > 0 {
            match self.log.get_entry(prev_log_index)? {
                Some(base) if base.term == prev_log_term => {}
                _ => {
                    debug!("Rejecting entries from {leader}: base {prev_log_index} term mismatch");
                    return Ok((false, state.current_term));
                }
            }
        }
        if prev_log_index < my_log_index {
            debug!("Truncating uncommitted log suffix after {prev_log_index}");
            self.log.truncate_suffix(prev_log_index)?;
        }
        if !entries.is_empty() {
            self.log.append(&entries)?;
        }
        Ok((true, state.current_term))
    }

    /// Appends a client command to the log as leader, at the current term.
    /// Returns Error::Abort when not leader, so the client can re-resolve
    /// the leader and retry.
    pub fn append(&self, command: Vec<u8>) -> Result<Index> {
        let state = self.state.read();
        if state.role != Role::Leader {
            return Err(Error::Abort);
        }
        self.log.append_command(state.current_term, command)
    }

    /// Advances the commit index, waking the apply worker. The new index is
    /// clamped to the last log index and must actually advance the commit
    /// index, which never regresses. On the leader this only succeeds when
    /// the target entry carries the current term, which is what makes quorum
    /// replication sufficient for commitment (a follower instead trusts the
    /// leader's commit index, which the leader already gated). Returns
    /// whether the index advanced.
    pub fn advance_commit_index(&self, new_commit_index: Index) -> Result<bool> {
        if new_commit_index == 0 {
            return Ok(false);
        }
        let (role, current_term) = self.role_term();
        let _commit = self.commit_mu.lock();
        let commit_index = self.commit_index.load(Ordering::Acquire);
        if new_commit_index <= commit_index {
            return Ok(false);
        }
        let new_commit_index = new_commit_index.min(self.log.get_last_log_index());
        if new_commit_index <= commit_index {
            return Ok(false);
        }
        if role == Role::Leader {
            match self.log.get_entry(new_commit_index)? {
                Some(entry) if entry.term == current_term => {}
                _ => return Ok(false),
            }
        }
        self.commit_index.store(new_commit_index, Ordering::Release);
        debug!("Advanced commit index to {new_commit_index}");
        // Take the apply lock before notifying, so a worker that has checked
        // the commit index but not yet started waiting can't miss the wakeup.
        let _apply = self.apply.lock();
        self.apply_cond.notify_all();
        Ok(true)
    }

    /// Returns the current commit index.
    pub fn commit_index(&self) -> Index {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Returns the current apply index.
    pub fn apply_index(&self) -> Index {
        self.apply.lock().apply_index
    }

    /// Blocks until there are committed entries to apply, returning the
    /// (apply_index, commit_index] range, or None on shutdown. Used by the
    /// apply worker.
    pub fn next_apply(&self) -> Option<(Index, Index)> {
        let mut apply = self.apply.lock();
        loop {
            if apply.shutdown {
                return None;
            }
            let commit_index = self.commit_index.load(Ordering::Acquire);
            if apply.apply_index < commit_index {
                return Some((apply.apply_index, commit_index));
            }
            self.apply_cond.wait(&mut apply);
        }
    }

    /// Records that the entry at the given index was applied, waking
    /// wait_apply callers. Applies are strictly in index order.
    pub fn record_applied(&self, index: Index) {
        let mut apply = self.apply.lock();
        assert_eq!(apply.apply_index + 1, index, "applies must be in index order");
        apply.apply_index = index;
        self.apply_cond.notify_all();
    }

    /// Blocks until the entry at the given index has been applied to the
    /// state machine, or the timeout elapses, or the replica shuts down.
    pub fn wait_apply(&self, index: Index, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut apply = self.apply.lock();
        while apply.apply_index < index {
            if apply.shutdown {
                return Err(Error::Abort);
            }
            if self.apply_cond.wait_until(&mut apply, deadline).timed_out()
                && apply.apply_index < index
            {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Signals shutdown to the apply worker and any wait_apply callers.
    pub fn shutdown(&self) {
        let mut apply = self.apply.lock();
        apply.shutdown = true;
        self.apply_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(port: u16) -> Member {
        Member::new("10.0.0.1", port)
    }

    /// A three-member context in a temporary directory, as member 1.
    fn setup() -> (Context, Arc<Log>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let log = Arc::new(Log::open(dir.path()).expect("log open failed"));
        let members = vec![member(1), member(2), member(3)];
        let context = Context::new(member(1), members, log.clone());
        context.recover_init();
        (context, log, dir)
    }

    fn entry(index: Index, term: Term) -> Entry {
        Entry { index, term, command: vec![index as u8] }
    }

    #[test]
    fn starts_as_follower() {
        let (context, _, _dir) = setup();
        assert_eq!(context.role_term(), (Role::Follower, 0));
        assert_eq!(context.leader(), None);
    }

    #[test]
    fn candidate_votes_for_itself() -> Result<()> {
        let (context, log, _dir) = setup();
        context.become_candidate()?;
        assert_eq!(context.role_term(), (Role::Candidate, 1));
        // The vote is durable before the transition takes effect.
        assert_eq!(log.get_term(), (1, Some(member(1))));
        Ok(())
    }

    #[test]
    fn election_quorum() -> Result<()> {
        let (context, _, _dir) = setup();
        context.become_candidate()?;
        // The self-vote alone is 1 of 3; one more grants a quorum of 2.
        assert!(context.vote_and_check(1));
        context.become_leader();
        assert_eq!(context.role_term(), (Role::Leader, 1));
        assert_eq!(context.leader(), Some(member(1)));
        // A stale reply from a past election doesn't count.
        assert!(!context.vote_and_check(0));
        Ok(())
    }

    #[test]
    fn higher_term_demotes_leader() -> Result<()> {
        let (context, _, _dir) = setup();
        context.become_candidate()?;
        assert!(context.vote_and_check(1));
        context.become_leader();

        context.become_follower(3, Some(&member(2)))?;
        assert_eq!(context.role_term(), (Role::Follower, 3));
        assert_eq!(context.leader(), Some(member(2)));

        // A stale term is ignored, and the term never regresses.
        context.become_follower(2, Some(&member(3)))?;
        assert_eq!(context.role_term(), (Role::Follower, 3));
        assert_eq!(context.leader(), Some(member(2)));
        Ok(())
    }

    #[test]
    fn vote_granted_once_per_term() -> Result<()> {
        let (context, log, _dir) = setup();
        let (granted, term) = context.request_vote(1, &member(2), 0, 0)?;
        assert!(granted);
        assert_eq!(term, 1);
        assert_eq!(log.get_term(), (1, Some(member(2))));

        // A competing candidate in the same term is denied, but the same
        // candidate is re-granted (e.g. a retransmitted request).
        let (granted, _) = context.request_vote(1, &member(3), 0, 0)?;
        assert!(!granted);
        let (granted, _) = context.request_vote(1, &member(2), 0, 0)?;
        assert!(granted);

        // A stale term is denied outright.
        let (granted, term) = context.request_vote(0, &member(3), 0, 0)?;
        assert!(!granted);
        assert_eq!(term, 1);
        Ok(())
    }

    #[test]
    fn vote_denied_for_stale_log() -> Result<()> {
        let (context, log, _dir) = setup();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 2)])?;
        context.become_follower(2, None)?;

        // The candidate's last entry term is behind ours: deny, but still
        // advance to its term and remain follower without casting a vote.
        let (granted, term) = context.request_vote(5, &member(2), 4, 1)?;
        assert!(!granted);
        assert_eq!(term, 5);
        assert_eq!(context.role_term(), (Role::Follower, 5));
        assert_eq!(log.get_term(), (5, None));

        // Same last term but a shorter log is also denied.
        let (granted, _) = context.request_vote(5, &member(3), 2, 2)?;
        assert!(!granted);

        // An equal log is up-to-date enough.
        let (granted, _) = context.request_vote(5, &member(3), 3, 2)?;
        assert!(granted);
        Ok(())
    }

    #[test]
    fn append_entries_from_empty() -> Result<()> {
        let (context, log, _dir) = setup();
        let (accepted, term) =
            context.append_entries(1, &member(2), 0, 0, vec![entry(1, 1), entry(2, 1)])?;
        assert!(accepted);
        assert_eq!(term, 1);
        assert_eq!(log.get_last_log_term_and_index(), (1, 2));
        assert_eq!(context.leader(), Some(member(2)));

        // Heartbeats (no entries) are accepted as well.
        let (accepted, _) = context.append_entries(1, &member(2), 1, 2, vec![])?;
        assert!(accepted);
        Ok(())
    }

    #[test]
    fn append_entries_rejects_inconsistent() -> Result<()> {
        let (context, log, _dir) = setup();
        log.append(&[entry(1, 1), entry(2, 1)])?;
        context.become_follower(2, None)?;

        // A base entry beyond our log is rejected.
        let (accepted, _) = context.append_entries(2, &member(2), 2, 5, vec![])?;
        assert!(!accepted);

        // A base entry with a mismatched term is rejected.
        let (accepted, _) = context.append_entries(2, &member(2), 2, 2, vec![])?;
        assert!(!accepted);

        // A stale-term sender is rejected without demotion effects.
        context.become_follower(4, None)?;
        let (accepted, term) = context.append_entries(3, &member(2), 1, 2, vec![])?;
        assert!(!accepted);
        assert_eq!(term, 4);
        Ok(())
    }

    #[test]
    fn append_entries_truncates_conflicting_suffix() -> Result<()> {
        let (context, log, _dir) = setup();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1)])?;
        context.become_follower(2, None)?;

        // The base (2, term 1) matches, so the conflicting tail is replaced.
        let (accepted, _) = context.append_entries(2, &member(2), 1, 2, vec![entry(3, 2)])?;
        assert!(accepted);
        assert_eq!(log.get_last_log_term_and_index(), (2, 3));
        assert_eq!(log.get_entry(3)?.map(|e| e.term), Some(2));
        assert_eq!(log.get_entry(2)?.map(|e| e.term), Some(1));
        Ok(())
    }

    #[test]
    fn append_entries_demotes_candidate_at_same_term() -> Result<()> {
        let (context, _, _dir) = setup();
        context.become_candidate()?;
        assert_eq!(context.role_term(), (Role::Candidate, 1));

        let (accepted, _) = context.append_entries(1, &member(2), 0, 0, vec![])?;
        assert!(accepted);
        assert_eq!(context.role_term(), (Role::Follower, 1));
        assert_eq!(context.leader(), Some(member(2)));
        Ok(())
    }

    #[test]
    fn commit_index_advancement() -> Result<()> {
        let (context, log, _dir) = setup();
        log.append(&[entry(1, 1), entry(2, 1)])?;
        context.become_follower(1, Some(&member(2)))?;

        // Advancing to 0 is always refused.
        assert!(!context.advance_commit_index(0)?);

        // A follower trusts the leader's commit index, clamped to its log.
        assert!(context.advance_commit_index(5)?);
        assert_eq!(context.commit_index(), 2);

        // The commit index never regresses.
        assert!(!context.advance_commit_index(1)?);
        assert_eq!(context.commit_index(), 2);
        Ok(())
    }

    #[test]
    fn leader_only_commits_own_term() -> Result<()> {
        let (context, log, _dir) = setup();
        log.append(&[entry(1, 1)])?;
        // Become leader in term 2 with an entry from term 1 still uncommitted.
        // The second campaign models a re-election after a split vote.
        context.become_candidate()?;
        context.become_candidate()?;
        assert!(context.vote_and_check(2));
        context.become_leader();

        // The term-1 entry can't be committed directly, even with a quorum.
        assert!(!context.advance_commit_index(1)?);

        // Once a current-term entry exists, committing it commits the prefix.
        let index = context.append(vec![0xff])?;
        assert_eq!(index, 2);
        assert!(context.advance_commit_index(2)?);
        assert_eq!(context.commit_index(), 2);
        Ok(())
    }

    #[test]
    fn append_requires_leadership() {
        let (context, _, _dir) = setup();
        assert_eq!(context.append(vec![0x01]), Err(Error::Abort));
    }

    #[test]
    fn wait_apply_times_out_and_completes() -> Result<()> {
        let (context, log, _dir) = setup();
        log.append(&[entry(1, 1)])?;
        context.become_follower(1, Some(&member(2)))?;
        context.advance_commit_index(1)?;

        assert_eq!(
            context.wait_apply(1, Duration::from_millis(20)),
            Err(Error::Timeout)
        );

        assert_eq!(context.next_apply(), Some((0, 1)));
        context.record_applied(1);
        context.wait_apply(1, Duration::from_millis(20))?;
        assert_eq!(context.apply_index(), 1);

        // Shutdown unblocks waiters with Abort and stops the apply worker.
        context.shutdown();
        assert_eq!(context.wait_apply(2, Duration::from_millis(20)), Err(Error::Abort));
        assert_eq!(context.next_apply(), None);
        Ok(())
    }
}
