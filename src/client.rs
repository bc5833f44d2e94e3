use crate::encoding::Value as _;
use crate::errcorrupt;
use crate::error::Result;
use crate::raft::{Member, Request, Response};

use std::io::Write as _;

/// A quorumkv client, connected to a single replica. Writes and consistent
/// reads must be sent to the leader; leader() discovers it, and writes sent
/// elsewhere fail with Error::Abort so the caller can reconnect.
pub struct Client {
    reader: std::io::BufReader<std::net::TcpStream>,
    writer: std::io::BufWriter<std::net::TcpStream>,
}

impl Client {
    /// Connects to a replica.
    pub fn connect(addr: impl std::net::ToSocketAddrs) -> Result<Self> {
        let socket = std::net::TcpStream::connect(addr)?;
        socket.set_nodelay(true)?;
        let reader = std::io::BufReader::new(socket.try_clone()?);
        let writer = std::io::BufWriter::new(socket);
        Ok(Self { reader, writer })
    }

    /// Calls a server method.
    fn call(&mut self, request: Request) -> Result<Response> {
        request.encode_into(&mut self.writer)?;
        self.writer.flush()?;
        Result::<Response>::decode_from(&mut self.reader)?
    }

    /// Writes a key/value pair.
    pub fn put(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        match self.call(Request::Put { key: key.to_string(), value })? {
            Response::Put => Ok(()),
            response => errcorrupt!("unexpected response {response:?}"),
        }
    }

    /// Deletes a key.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        match self.call(Request::Delete { key: key.to_string() })? {
            Response::Delete => Ok(()),
            response => errcorrupt!("unexpected response {response:?}"),
        }
    }

    /// Reads a key at the leader.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.call(Request::Get { key: key.to_string() })? {
            Response::Get(value) => Ok(value),
            response => errcorrupt!("unexpected response {response:?}"),
        }
    }

    /// Reads a key from the connected replica, with no consistency guarantee.
    pub fn dirty_get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.call(Request::DirtyGet { key: key.to_string() })? {
            Response::DirtyGet(value) => Ok(value),
            response => errcorrupt!("unexpected response {response:?}"),
        }
    }

    /// Fetches the current leader, as known to the connected replica.
    pub fn leader(&mut self) -> Result<Member> {
        match self.call(Request::Leader)? {
            Response::Leader(member) => Ok(member),
            response => errcorrupt!("unexpected response {response:?}"),
        }
    }
}
