//! TCP-backed [`Connection`] and [`ConnectionFactory`].
//!
//! The factory opens a plain TCP stream to `host:port` taken from the
//! [`ConnectParams`] bag and performs **no protocol handshake**; callers
//! drive the database wire protocol themselves through `send`/`recv`.
//!
//! ```text
//! DbPool::get()
//!   → TcpConnectionFactory::connect(params)
//!     → resolve host:port → TcpStream::connect_timeout
//!
//! DbPool::get() / release() / check_pool()
//!   → TcpConnection::ping() → 1-byte peek (EOF = peer closed)
//! ```

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::connection::{Connection, ConnectionFactory};
use crate::params::ConnectParams;

/// Read timeout applied for the duration of a ping peek.
const PING_TIMEOUT: Duration = Duration::from_millis(100);

// ── TcpConnection ────────────────────────────────────────────────────

/// A pooled TCP stream.
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection").field("peer", &self.peer).finish()
    }
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.stream.write_all(data)?;
        Ok(data.len())
    }

    /// Read up to `max_bytes`; an empty result means the peer closed.
    pub fn recv(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let n = self.stream.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl Connection for TcpConnection {
    fn ping(&mut self) -> bool {
        let original_timeout = self.stream.read_timeout().ok().flatten();
        if self.stream.set_read_timeout(Some(PING_TIMEOUT)).is_err() {
            return false;
        }

        let mut peek_buf = [0u8; 1];
        let alive = match self.stream.peek(&mut peek_buf) {
            Ok(0) => false,
            Ok(_) => true,
            // No data within the timeout: idle but open.
            Err(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
        };

        let _ = self.stream.set_read_timeout(original_timeout);
        alive
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

// ── TcpConnectionFactory ─────────────────────────────────────────────

/// Factory creating TCP connections from the `host` and `port` params.
#[derive(Clone, Debug)]
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    type Connection = TcpConnection;

    fn connect(&self, params: &ConnectParams) -> anyhow::Result<TcpConnection> {
        let host = params
            .get("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow!("connect params are missing `host`"))?;
        let port: u16 = params
            .get("port")
            .ok_or_else(|| anyhow!("connect params are missing `port`"))?
            .parse()
            .context("invalid `port` in connect params")?;

        let addr_str = format!("{host}:{port}");
        let addr = addr_str
            .to_socket_addrs()
            .with_context(|| format!("dns resolution failed for {addr_str}"))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {addr_str}"))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("tcp connect to {addr_str}"))?;
        stream
            .set_read_timeout(Some(self.read_timeout))
            .context("set read timeout")?;
        let _ = stream.set_nodelay(true);

        debug!(host, port, "established tcp connection");
        Ok(TcpConnection::new(stream)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn start_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn params_for(addr: SocketAddr) -> ConnectParams {
        ConnectParams::new()
            .with("type", "postgres")
            .with("host", addr.ip().to_string())
            .with("port", addr.port().to_string())
    }

    // ── TcpConnection ───────────────────────────────────────────────

    #[test]
    fn send_and_recv_roundtrip() {
        let addr = start_echo_server();
        let factory = TcpConnectionFactory::new(Duration::from_secs(2), Duration::from_secs(2));
        let mut conn = factory.connect(&params_for(addr)).unwrap();

        assert_eq!(conn.send(b"hello").unwrap(), 5);
        assert_eq!(conn.recv(1024).unwrap(), b"hello");
        assert_eq!(conn.peer(), addr);
    }

    #[test]
    fn ping_idle_connection_is_alive() {
        let addr = start_echo_server();
        let mut conn = TcpConnectionFactory::default().connect(&params_for(addr)).unwrap();
        assert!(conn.ping());
    }

    #[test]
    fn ping_after_close_is_dead() {
        let addr = start_echo_server();
        let mut conn = TcpConnectionFactory::default().connect(&params_for(addr)).unwrap();
        conn.close();
        assert!(!conn.ping());
    }

    #[test]
    fn ping_restores_read_timeout() {
        let addr = start_echo_server();
        let factory = TcpConnectionFactory::new(Duration::from_secs(1), Duration::from_secs(7));
        let mut conn = factory.connect(&params_for(addr)).unwrap();
        conn.ping();
        assert_eq!(conn.stream.read_timeout().unwrap(), Some(Duration::from_secs(7)));
    }

    // ── TcpConnectionFactory ────────────────────────────────────────

    #[test]
    fn missing_host_is_an_error() {
        let params = ConnectParams::new().with("port", "5432");
        let err = TcpConnectionFactory::default().connect(&params).unwrap_err();
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn invalid_port_is_an_error() {
        let params = ConnectParams::new().with("host", "127.0.0.1").with("port", "db");
        let err = TcpConnectionFactory::default().connect(&params).unwrap_err();
        assert!(format!("{err:#}").contains("port"));
    }

    #[test]
    fn refused_connection_is_an_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let factory = TcpConnectionFactory::new(Duration::from_secs(1), Duration::from_secs(1));
        let err = factory.connect(&params_for(addr)).unwrap_err();
        assert!(format!("{err:#}").contains("tcp connect"));
    }
}
