use crate::error::TransportError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

pub const MAX_FRAME_SIZE: usize = 1500;

/// Datagram channel to the radio peer.
///
/// `recv` returns `Ok(0)` when nothing arrived within the endpoint's wait
/// interval. Any `Err` is fatal for the signalling session.
pub trait Transport: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;
    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Unix datagram socket endpoint.
pub struct DatagramTransport {
    socket: UnixDatagram,
}

impl DatagramTransport {
    /// Bind `local` and connect it to `peer`.
    pub fn connect(local: &Path, peer: &Path, wait: Duration) -> Result<Self, TransportError> {
        if local.exists() {
            std::fs::remove_file(local)?;
        }
        let socket = UnixDatagram::bind(local)?;
        socket.connect(peer)?;
        socket.set_read_timeout(Some(wait))?;
        debug!("Signalling socket {} connected to {}", local.display(), peer.display());
        Ok(Self { socket })
    }

    pub fn from_socket(socket: UnixDatagram, wait: Duration) -> Result<Self, TransportError> {
        socket.set_read_timeout(Some(wait))?;
        Ok(Self { socket })
    }
}

impl Transport for DatagramTransport {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let sent = self.socket.send(data)?;
        if sent != data.len() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process transport recording everything sent.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    fail_sends: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, frame: Vec<u8>) {
        self.inbound.lock().push_back(frame);
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let Some(frame) = self.inbound.lock().pop_front() else {
            return Ok(0);
        };
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport() {
        let t = MemoryTransport::new();
        let mut buf = [0u8; 16];
        assert_eq!(t.recv(&mut buf).unwrap(), 0);
        t.push_inbound(vec![132, 0]);
        assert_eq!(t.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[132, 0]);
        t.send(&[1, 2, 3]).unwrap();
        assert_eq!(t.take_sent(), vec![vec![1, 2, 3]]);
        t.set_fail_sends(true);
        assert!(t.send(&[1]).is_err());
    }

    #[test]
    fn test_datagram_pair() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let a = DatagramTransport::from_socket(a, Duration::from_millis(10)).unwrap();
        let b = DatagramTransport::from_socket(b, Duration::from_millis(10)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf).unwrap(), 0);
        a.send(&[128, 0]).unwrap();
        assert_eq!(b.recv(&mut buf).unwrap(), 2);
    }
}
