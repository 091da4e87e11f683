//! Blocking TCP accept loop that can be stopped from another thread.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

/// How long `stop()` spends poking its own port to unblock `accept()`.
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// A listener thread handing each accepted stream to a callback.
///
/// After [`stop`](Listener::stop) returns, no further stream reaches the
/// callback: the accept loop checks the flag before every hand-off, and the
/// socket is closed as soon as the loop exits.
pub struct Listener {
    name: &'static str,
    addr: SocketAddr,
    accepting: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind `addr` and start accepting on a dedicated thread.
    pub fn spawn<F>(name: &'static str, addr: SocketAddr, mut on_accept: F) -> io::Result<Self>
    where
        F: FnMut(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let accepting = Arc::new(AtomicBool::new(true));

        let handle = {
            let accepting = accepting.clone();
            thread::Builder::new()
                .name(format!("{}-listener", name))
                .spawn(move || {
                    for stream in listener.incoming() {
                        if !accepting.load(Ordering::SeqCst) {
                            break;
                        }
                        match stream {
                            Ok(stream) => on_accept(stream),
                            Err(e) => warn!("{} listener accept failed: {}", name, e),
                        }
                    }
                    debug!("{} listener on {} stopped", name, addr);
                })?
        };

        Ok(Self {
            name,
            addr,
            accepting,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting. Does not wait for the thread; see [`join`](Self::join).
    pub fn stop(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        // The accept thread is parked in accept(); a throwaway connection
        // lets it observe the flag and exit.
        let target = SocketAddr::new(wake_ip(self.addr.ip()), self.addr.port());
        if let Err(e) = TcpStream::connect_timeout(&target, WAKE_CONNECT_TIMEOUT) {
            debug!("{} listener wake-up connect failed: {}", self.name, e);
        }
    }

    /// Wait for the accept thread to finish.
    pub fn join(&self) {
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{} listener thread panicked", self.name);
            }
        }
    }
}

/// Wildcard binds are reachable on loopback.
fn wake_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    }
}
