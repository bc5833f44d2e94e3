use super::apply;
use super::context::Context;
use super::log::Log;
use super::message::{
    AppendEntriesResponse, Member, Request, RequestVoteResponse, Response,
};
use super::peer::{Peer, Worker};
use super::timer::Timer;
use super::transport::{TcpTransport, Transport};
use super::APPLY_TIMEOUT;
use crate::encoding::Value as _;
use crate::errinput;
use crate::error::{Error, Result};
use crate::state::{Command, Kv, State};

use ::log::{debug, error, info};
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Replica configuration, fixed at construction. The member set must include
/// the local identity and is identical on every member.
#[derive(Clone, Debug)]
pub struct Options {
    pub local_ip: String,
    pub local_port: u16,
    pub members: Vec<Member>,
    pub log_path: PathBuf,
    pub data_path: PathBuf,
    pub elect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Options {
    /// Returns the local member identity.
    pub fn local(&self) -> Member {
        Member::new(self.local_ip.clone(), self.local_port)
    }

    fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return errinput!("member set is empty");
        }
        if !self.members.contains(&self.local()) {
            return errinput!("member set does not include local node {}", self.local());
        }
        if self.elect_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return errinput!("election timeout and heartbeat interval must be non-zero");
        }
        if self.elect_timeout_ms <= self.heartbeat_interval_ms {
            return errinput!("election timeout must exceed the heartbeat interval");
        }
        Ok(())
    }
}

/// A replica server: opens the persistent stores, recovers the replica
/// state, and runs the election timer, apply worker, peer workers, and a
/// TCP listener serving both peer RPCs and client requests.
pub struct Server {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

struct Inner {
    options: Options,
    context: Arc<Context>,
    state: Arc<Mutex<Box<dyn State>>>,
    peers: Vec<Peer>,
    timer: Timer,
    shutdown: AtomicBool,
}

impl Server {
    /// Starts the replica: opens the log and state machine stores, recovers
    /// the replica state, and launches the worker threads and listener.
    pub fn start(options: Options) -> Result<Server> {
        options.validate()?;
        let local = options.local();
        info!("Starting replica {local} with members {:?}", options.members);

        std::fs::create_dir_all(&options.data_path)?;
        let log = Arc::new(Log::open(&options.log_path)?);
        let state: Arc<Mutex<Box<dyn State>>> =
            Arc::new(Mutex::new(Box::new(Kv::open(&options.data_path.join("state"))?)));

        let context =
            Arc::new(Context::new(local.clone(), options.members.clone(), log.clone()));
        context.recover_init();

        // Bind the listener before spawning anything, so a taken port fails
        // the whole startup.
        let listener = TcpListener::bind((options.local_ip.as_str(), options.local_port))?;

        let heartbeat = Duration::from_millis(options.heartbeat_interval_ms);
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::new(Duration::from_millis(options.elect_timeout_ms)));

        // Set up the peer command queues and acknowledgement set first, so
        // every worker sees the full cluster.
        let mut peers = Vec::new();
        let mut receivers = Vec::new();
        for member in options.members.iter().filter(|m| **m != local) {
            let (tx, rx) = crossbeam::channel::unbounded();
            let match_index = Arc::new(AtomicU64::new(0));
            peers.push(Peer::new(member.clone(), tx, match_index.clone()));
            receivers.push((member.clone(), rx, match_index));
        }
        let cluster_acks: Vec<Arc<AtomicU64>> =
            peers.iter().map(|peer| peer.match_index()).collect();

        let inner = Arc::new(Inner {
            options,
            context: context.clone(),
            state: state.clone(),
            peers,
            timer: Timer::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        threads.push({
            let timer_inner = inner.clone();
            inner.timer.start(
                Duration::from_millis(inner.options.elect_timeout_ms),
                move || timer_inner.hold_election(),
            )?
        });
        threads.push(
            std::thread::Builder::new().name("raft-apply".to_string()).spawn({
                let (context, log, state) = (context.clone(), log.clone(), state.clone());
                move || apply::run(context, log, state)
            })?,
        );
        for (member, rx, match_index) in receivers {
            let worker = Worker::new(
                member.clone(),
                context.clone(),
                log.clone(),
                transport.clone(),
                rx,
                heartbeat,
                cluster_acks.clone(),
                match_index,
            );
            threads.push(
                std::thread::Builder::new()
                    .name(format!("raft-peer-{member}"))
                    .spawn(move || worker.run())?,
            );
        }
        threads.push(
            std::thread::Builder::new().name("raft-listen".to_string()).spawn({
                let inner = inner.clone();
                move || Inner::listen(inner, listener)
            })?,
        );

        Ok(Server { inner, threads })
    }

    /// Stops the replica: signals all workers, waits for the apply worker to
    /// reach a quiescent point, and joins the threads. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping replica {}", self.inner.options.local());
        self.inner.timer.shutdown();
        for peer in &self.inner.peers {
            peer.shutdown();
        }
        self.inner.context.shutdown();
        // Nudge the accept loop so it observes the shutdown flag.
        let _ = TcpStream::connect((
            self.inner.options.local_ip.as_str(),
            self.inner.options.local_port,
        ));
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        Ok(())
    }

    /// Stops the replica and deletes its log and state machine directories.
    pub fn erase(mut self) -> Result<()> {
        self.stop()?;
        std::fs::remove_dir_all(&self.inner.options.log_path)?;
        std::fs::remove_dir_all(&self.inner.options.data_path)?;
        Ok(())
    }

    /// Returns the local member identity.
    pub fn local(&self) -> Member {
        self.inner.options.local()
    }

    /// Returns the current leader, or Error::NotFound if unknown.
    pub fn get_leader(&self) -> Result<Member> {
        self.inner.context.leader().ok_or(Error::NotFound)
    }

    /// Writes a key/value pair through the replicated log. Leader only.
    pub fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.mutate(Command::Put { key: key.to_string(), value })
    }

    /// Deletes a key through the replicated log. Leader only.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.inner.mutate(Command::Delete { key: key.to_string() })
    }

    /// Reads a key at the leader, serialized against the applied state.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.inner.context.is_leader() {
            return Err(Error::Abort);
        }
        self.inner.state.lock().get(key)
    }

    /// Reads a key from the local replica, regardless of role. The value may
    /// be arbitrarily stale.
    pub fn dirty_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.state.lock().get(key)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            error!("Failed to stop replica: {error}");
        }
    }
}

impl Inner {
    /// Starts a new election when the timer expires. Leaders ignore the
    /// expiry; their heartbeat cadence replaces the timer. In a single-node
    /// cluster the self-vote is already a quorum.
    fn hold_election(&self) {
        if self.shutdown.load(Ordering::SeqCst) || self.context.is_leader() {
            return;
        }
        if let Err(error) = self.context.become_candidate() {
            error!("Failed to start election: {error}");
            return;
        }
        if self.peers.is_empty() {
            self.context.become_leader();
            return;
        }
        for peer in &self.peers {
            peer.solicit_vote();
        }
    }

    /// Submits a write command: appends it to the log as leader, wakes the
    /// peer workers to replicate it, and blocks until it has been applied.
    fn mutate(&self, command: Command) -> Result<()> {
        let index = self.context.append(command.encode()?)?;
        if self.peers.is_empty() {
            self.context.advance_commit_index(index)?;
        }
        for peer in &self.peers {
            peer.replicate();
        }
        self.context.wait_apply(index, APPLY_TIMEOUT)
    }

    /// Accepts connections until shutdown, spawning a handler thread per
    /// connection. Handler threads exit when their connection closes.
    fn listen(inner: Arc<Inner>, listener: TcpListener) {
        for stream in listener.incoming() {
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let socket = match stream {
                Ok(socket) => socket,
                Err(error) => {
                    error!("Accept failed: {error}");
                    continue;
                }
            };
            let conn_inner = inner.clone();
            let spawned = std::thread::Builder::new().name("raft-conn".to_string()).spawn(
                move || {
                    if let Err(error) = Inner::session(conn_inner, socket) {
                        debug!("Connection closed: {error}");
                    }
                },
            );
            if let Err(error) = spawned {
                error!("Failed to spawn connection handler: {error}");
            }
        }
        debug!("Listener stopped");
    }

    /// Serves a single connection: request/response frames, in order.
    fn session(inner: Arc<Inner>, socket: TcpStream) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut reader = BufReader::new(socket.try_clone()?);
        let mut writer = BufWriter::new(socket);
        while let Some(request) = Request::maybe_decode_from(&mut reader)? {
            // A stopped replica must not keep participating in the protocol,
            // but keeps draining the connection until the peer closes it.
            let response = if inner.shutdown.load(Ordering::SeqCst) {
                Err(Error::Abort)
            } else {
                inner.handle(request)
            };
            if let Err(error) = &response {
                if error.is_fatal() {
                    error!("Fatal request failure: {error}");
                }
            }
            response.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Dispatches a single inbound request, either a peer RPC or a client
    /// operation.
    fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::RequestVote(req) => {
                let (vote_granted, term) = self.context.request_vote(
                    req.term,
                    &req.candidate,
                    req.last_log_index,
                    req.last_log_term,
                )?;
                if vote_granted {
                    self.timer.reset();
                }
                Ok(Response::RequestVote(RequestVoteResponse { term, vote_granted }))
            }
            Request::AppendEntries(req) => {
                let (leader_commit, req_term) = (req.leader_commit, req.term);
                let (success, term) = self.context.append_entries(
                    req.term,
                    &req.leader,
                    req.prev_log_term,
                    req.prev_log_index,
                    req.entries,
                )?;
                // Anything from the current leader defers our election,
                // whether or not the consistency check passed.
                if req_term >= term {
                    self.timer.reset();
                }
                if success && leader_commit > 0 {
                    self.context.advance_commit_index(leader_commit)?;
                }
                Ok(Response::AppendEntries(AppendEntriesResponse { term, success }))
            }
            Request::Put { key, value } => {
                self.mutate(Command::Put { key, value })?;
                Ok(Response::Put)
            }
            Request::Delete { key } => {
                self.mutate(Command::Delete { key })?;
                Ok(Response::Delete)
            }
            Request::Get { key } => {
                if !self.context.is_leader() {
                    return Err(Error::Abort);
                }
                Ok(Response::Get(self.state.lock().get(&key)?))
            }
            Request::DirtyGet { key } => Ok(Response::DirtyGet(self.state.lock().get(&key)?)),
            Request::Leader => self.context.leader().map(Response::Leader).ok_or(Error::NotFound),
        }
    }
}
