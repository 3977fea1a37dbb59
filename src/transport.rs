use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::node::DhtClient;
use crate::REQUEST_TIMEOUT;

/// A reliable byte stream to one remote node.
///
/// In production this is the encrypted transport's stream; the DHT only
/// requires read/write with configurable timeouts.
pub trait Connection: Read + Write + Send {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

/// Dials new connections on behalf of the DHT. Injected so the encrypted
/// transport layer, or a test harness, can supply the streams.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, addr: SocketAddrV4) -> io::Result<Box<dyn Connection>>;
}

/// Plain-TCP connection factory.
pub struct TcpTransport {
    pub connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport {
            connect_timeout: Duration::from_millis(REQUEST_TIMEOUT),
        }
    }
}

impl ConnectionFactory for TcpTransport {
    fn connect(&self, addr: SocketAddrV4) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(addr), self.connect_timeout)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Accepts inbound DHT connections and feeds them to a `DhtClient`.
///
/// Constructed and owned by the composition root, with an explicit
/// `start`/`stop` lifecycle. `stop` wakes the blocked accept loop by dialing
/// the listening socket once.
pub struct DhtListener {
    listener: TcpListener,
    local_addr: SocketAddrV4,
    is_active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DhtListener {
    /// Binds the listener. Use port 0 for an ephemeral port.
    pub fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = match listener.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("dht listener requires an ipv4 address, got {}", addr),
                ))
            }
        };
        Ok(DhtListener {
            listener,
            local_addr,
            is_active: Arc::new(AtomicBool::new(true)),
            handle: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Starts the accept loop, answering queries with `client`. Each accepted
    /// connection is served on its own thread until the remote closes it.
    pub fn start(&mut self, client: DhtClient) -> io::Result<()> {
        let listener = self.listener.try_clone()?;
        let is_active = Arc::clone(&self.is_active);
        let local_addr = self.local_addr;
        self.handle = Some(thread::spawn(move || {
            for stream in listener.incoming() {
                if !is_active.load(Ordering::Acquire) {
                    break;
                }
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("{} - accept failed: {}", local_addr, err);
                        continue;
                    }
                };
                let remote_ip = match stream.peer_addr() {
                    Ok(SocketAddr::V4(addr)) => *addr.ip(),
                    _ => continue,
                };
                let client = client.clone();
                thread::spawn(move || {
                    if let Err(err) = client.accept_connection(&mut stream, remote_ip) {
                        debug!("{} - connection from {} closed: {}", local_addr, remote_ip, err);
                    }
                });
            }
            info!("{} - listener stopped", local_addr);
        }));
        Ok(())
    }

    /// Stops the accept loop and joins it.
    pub fn stop(&mut self) {
        self.is_active.store(false, Ordering::Release);
        // wake the accept loop so it observes the flag
        let _ = TcpStream::connect(SocketAddr::V4(self.local_addr));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DhtListener {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
