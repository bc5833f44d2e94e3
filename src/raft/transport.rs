use super::message::{Member, Request, Response};
use crate::encoding::Value as _;
use crate::errnet;
use crate::error::{Error, Result};

use ::log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs as _};
use std::time::Duration;

/// A blocking peer transport. Delivers one request/response exchange at a
/// time per connection, in order; connection loss surfaces as
/// Error::Network, which callers treat as retryable.
pub trait Transport: Send + Sync + 'static {
    fn call(&self, to: &Member, request: Request) -> Result<Response>;
}

/// A TCP transport holding one connection per peer, re-established on the
/// next call after an error. Requests and responses travel as bincode
/// frames, the same protocol the server speaks to clients.
pub struct TcpTransport {
    timeout: Duration,
    conns: Mutex<HashMap<Member, Connection>>,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, conns: Mutex::new(HashMap::new()) }
    }

    fn dial(&self, to: &Member) -> Result<Connection> {
        let addr = match to.to_string().to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => return errnet!("cannot resolve {to}"),
            },
            Err(err) => return errnet!("cannot resolve {to}: {err}"),
        };
        let socket = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|err| Error::Network(format!("connecting to {to}: {err}")))?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;
        socket.set_nodelay(true)?;
        debug!("Connected to peer {to}");
        Ok(Connection {
            reader: BufReader::new(socket.try_clone()?),
            writer: BufWriter::new(socket),
        })
    }

    /// Performs a request/response exchange on the connection. Any failure
    /// is a Network error, since the connection state is unknown after it.
    fn roundtrip(conn: &mut Connection, request: Request) -> Result<Result<Response>> {
        use std::io::Write as _;
        request
            .encode_into(&mut conn.writer)
            .map_err(|err| Error::Network(err.to_string()))?;
        conn.writer.flush().map_err(|err| Error::Network(err.to_string()))?;
        Result::<Response>::decode_from(&mut conn.reader)
            .map_err(|err| Error::Network(err.to_string()))
    }
}

impl Transport for TcpTransport {
    fn call(&self, to: &Member, request: Request) -> Result<Response> {
        let mut conn = match self.conns.lock().remove(to) {
            Some(conn) => conn,
            None => self.dial(to)?,
        };
        match Self::roundtrip(&mut conn, request) {
            Ok(response) => {
                // The exchange completed, keep the connection for reuse. The
                // inner result is the remote handler's, which may be an error.
                self.conns.lock().insert(to.clone(), conn);
                response
            }
            Err(err) => Err(err),
        }
    }
}
