//! Reference clock and network clock distribution.
//!
//! The server owns exactly one [`ReferenceClock`]. Every pipeline instance
//! is stamped with it at construction time (the engine `build` signature
//! requires it), and [`NetClockPublisher`] exposes it over UDP so that
//! remote playback endpoints can derive a synchronized local clock and keep
//! audio and video lip-synced across the network.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Monotonic time source with a fixed epoch.
///
/// Cheap to clone; all clones share the same epoch, so `now()` is
/// consistent across every component holding a handle.
#[derive(Debug, Clone)]
pub struct ReferenceClock {
    epoch: Instant,
}

impl ReferenceClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Time elapsed since the clock's epoch.
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// `now()` in nanoseconds, saturating at `u64::MAX`.
    ///
    /// This is the value written into clock exchange packets.
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.now().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for ReferenceClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Size of one clock exchange packet: two big-endian `u64` timestamps.
const PACKET_LEN: usize = 16;

/// UDP responder that publishes a [`ReferenceClock`] to remote consumers.
///
/// Wire exchange: the client sends a 16-byte packet carrying its local
/// transmit time in the first 8 bytes (big-endian nanoseconds). The server
/// echoes the packet with its own clock reading in the second 8 bytes.
/// From the echoed transmit time and the receive time the client estimates
/// the round trip and computes `local = f(master, rtt)`.
///
/// A bind failure here is fatal at startup: without an addressable clock
/// no synchronized playback is possible.
pub struct NetClockPublisher {
    local_addr: std::net::SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NetClockPublisher {
    /// Bind `bind_addr:port` and start answering clock requests on a
    /// background thread. Runs until dropped.
    pub fn publish(clock: ReferenceClock, bind_addr: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((bind_addr, port))?;
        // Poll the running flag between reads so shutdown is prompt.
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;
        let local_addr = socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        tracing::info!(addr = %local_addr, "clock publisher listening");

        let handle = thread::spawn(move || {
            respond_loop(socket, clock, thread_running);
        });

        Ok(Self {
            local_addr,
            running,
            handle: Some(handle),
        })
    }

    /// Address the publisher is bound to (useful when the port was 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Drop for NetClockPublisher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        tracing::debug!(addr = %self.local_addr, "clock publisher stopped");
    }
}

fn respond_loop(socket: UdpSocket, clock: ReferenceClock, running: Arc<AtomicBool>) {
    let mut buf = [0u8; PACKET_LEN];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                if len != PACKET_LEN {
                    tracing::trace!(%peer, len, "ignoring malformed clock request");
                    continue;
                }
                buf[8..16].copy_from_slice(&clock.now_ns().to_be_bytes());
                if let Err(e) = socket.send_to(&buf, peer) {
                    tracing::warn!(%peer, error = %e, "clock response failed");
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "clock receive error");
                }
            }
        }
    }
}
