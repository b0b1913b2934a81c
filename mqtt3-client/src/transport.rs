use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// A connected byte stream.
///
/// Reads and writes are bounded by a timeout; `read` returning `Ok(0)`
/// means the timeout elapsed without data, never end-of-stream (a closed
/// peer is an error). Both sides may be used concurrently: the background
/// thread reads while caller threads write.
pub trait Transport: Send + Sync {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn write(&self, buf: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Tears the stream down, waking any blocked reader. Idempotent.
    fn shutdown(&self);
}

/// Opens transports from the session's endpoint configuration.
///
/// The client calls this on every connect and reconnect. The `ca` blob is
/// the PEM bundle from the session options, passed through verbatim; a
/// TLS-capable implementation uses it to verify the broker.
pub trait Connector: Send + Sync {
    fn open(&self, host: &str, port: u16, ca: Option<&[u8]>) -> io::Result<Arc<dyn Transport>>;
}

/// Plain TCP connector, the default.
///
/// The connect itself is bounded by `connect_timeout` so a black-holed
/// broker cannot stall the reconnect driver indefinitely.
#[derive(Debug)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Connector for TcpConnector {
    fn open(&self, host: &str, port: u16, ca: Option<&[u8]>) -> io::Result<Arc<dyn Transport>> {
        if ca.is_some() {
            warn!("a CA bundle is configured but the plain TCP connector ignores it");
        }

        let stream = tcp_connect_timeout(host, port, self.connect_timeout)?;
        stream.set_nodelay(true)?;

        Ok(Arc::new(stream))
    }
}

// Timeouts of zero would disable the socket timeout entirely.
fn socket_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(Some(socket_timeout(timeout)))?;

        match Read::read(&mut &*self, buf) {
            // a closed socket reads 0 bytes; the 0-means-timeout contract
            // requires reporting it as an error instead
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed by peer",
            )),
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        self.set_write_timeout(Some(socket_timeout(timeout)))?;

        match Write::write(&mut &*self, buf) {
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn shutdown(&self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

fn tcp_connect_timeout(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, socket_timeout(timeout)) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "could not resolve address")
    }))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn test_read_timeout_is_zero_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let mut buf = [0u8; 8];
        let n = Transport::read(&stream, &mut buf, Duration::from_millis(20)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_read_detects_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        {
            let (peer, _) = listener.accept().unwrap();
            drop(peer);
        }

        let mut buf = [0u8; 8];
        let res = Transport::read(&stream, &mut buf, Duration::from_millis(200));
        assert!(res.is_err());
    }

    #[test]
    fn test_round_trip_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).unwrap();
            peer.write_all(&buf).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let n = Transport::write(&stream, b"hello", Duration::from_millis(500)).unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let n = Transport::read(&stream, &mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(&buf[..n], b"hello");

        echo.join().unwrap();
    }
}
