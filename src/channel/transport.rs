//! Byte transports behind RPC channels.
//!
//! A channel is either a TCP connection or a child process's stdin/stdout
//! pair. Both expose the same small capability set so the receiver and the
//! dispatcher never care which one they hold.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::process::{ChildStdin, ChildStdout};
use std::sync::Mutex;

use super::ChannelKind;

/// Read/write capability shared by every channel kind.
///
/// Reads are only ever issued by the channel's own receiver thread; writes
/// may come from the host thread. Implementations serialize writes so a
/// frame is never interleaved with another.
pub trait Transport: Send + Sync {
    /// Read up to `max` bytes. An empty buffer means end of stream.
    fn read(&self, max: usize) -> io::Result<Vec<u8>>;

    /// Write a whole frame.
    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Ask the peer side to close. Unblocks a pending `read` for sockets;
    /// closes stdin for processes.
    fn shutdown(&self) -> io::Result<()>;

    fn kind(&self) -> ChannelKind;

    /// Human-readable peer description, for logging.
    fn describe(&self) -> String;
}

fn read_chunk(reader: &mut impl Read, max: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max.max(1)];
    loop {
        match reader.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Transport over an accepted TCP connection.
pub struct SocketTransport {
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    peer: Option<SocketAddr>,
}

impl SocketTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        let peer = stream.peer_addr().ok();
        // Replies are small and latency matters more than throughput.
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            writer: Mutex::new(writer),
            peer,
        })
    }
}

impl Transport for SocketTransport {
    fn read(&self, max: usize) -> io::Result<Vec<u8>> {
        read_chunk(&mut &self.stream, max)
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("socket writer lock poisoned"))?;
        writer.write_all(bytes)?;
        writer.flush()
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already torn down by the peer.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Socket
    }

    fn describe(&self) -> String {
        match self.peer {
            Some(peer) => format!("socket {}", peer),
            None => "socket".to_string(),
        }
    }
}

/// Transport over a child process's pipes.
pub struct ProcessTransport {
    stdout: Mutex<ChildStdout>,
    /// `None` once closed by [`Transport::shutdown`].
    stdin: Mutex<Option<ChildStdin>>,
    pid: u32,
}

impl ProcessTransport {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout, pid: u32) -> Self {
        Self {
            stdout: Mutex::new(stdout),
            stdin: Mutex::new(Some(stdin)),
            pid,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Transport for ProcessTransport {
    fn read(&self, max: usize) -> io::Result<Vec<u8>> {
        let mut stdout = self
            .stdout
            .lock()
            .map_err(|_| io::Error::other("stdout lock poisoned"))?;
        read_chunk(&mut *stdout, max)
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stdin = self
            .stdin
            .lock()
            .map_err(|_| io::Error::other("stdin lock poisoned"))?;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "job stdin closed"))?;
        stdin.write_all(bytes)?;
        stdin.flush()
    }

    fn shutdown(&self) -> io::Result<()> {
        let mut stdin = self
            .stdin
            .lock()
            .map_err(|_| io::Error::other("stdin lock poisoned"))?;
        // Dropping the handle closes the pipe; the child sees EOF.
        stdin.take();
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Process
    }

    fn describe(&self) -> String {
        format!("process {}", self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let client = TcpStream::connect(listener.local_addr().unwrap()).expect("connect failed");
        let (server, _) = listener.accept().expect("accept failed");
        (server, client)
    }

    #[test]
    fn test_socket_read_write() {
        let (server, mut client) = socket_pair();
        let transport = SocketTransport::new(server).unwrap();

        client.write_all(b"ping").unwrap();
        let got = transport.read(16).unwrap();
        assert_eq!(got, b"ping");

        transport.write(b"pong").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_socket_read_respects_max() {
        let (server, mut client) = socket_pair();
        let transport = SocketTransport::new(server).unwrap();

        client.write_all(b"abcdef").unwrap();
        let got = transport.read(2).unwrap();
        assert!(got.len() <= 2 && !got.is_empty());
    }

    #[test]
    fn test_socket_shutdown_unblocks_reader() {
        let (server, _client) = socket_pair();
        let transport = std::sync::Arc::new(SocketTransport::new(server).unwrap());

        let reader = {
            let transport = transport.clone();
            std::thread::spawn(move || transport.read(16))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        transport.shutdown().unwrap();

        let result = reader.join().unwrap();
        assert!(matches!(result, Ok(ref bytes) if bytes.is_empty()) || result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_transport_echo_and_close() {
        use std::process::{Command, Stdio};

        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn cat");
        let transport = ProcessTransport::new(
            child.stdin.take().unwrap(),
            child.stdout.take().unwrap(),
            child.id(),
        );
        assert_eq!(transport.kind(), ChannelKind::Process);

        transport.write(b"hello").unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            got.extend(transport.read(16).unwrap());
        }
        assert_eq!(got, b"hello");

        transport.shutdown().unwrap();
        assert!(transport.write(b"more").is_err());
        // cat exits once stdin closes
        assert!(transport.read(16).unwrap().is_empty());
        child.wait().unwrap();
    }
}
