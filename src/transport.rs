//! Serial link with a background receiver.
//!
//! Bytes read from the port are pushed through a bounded queue so the caller can
//! block on exact-length reads with a timeout, while writes go straight to the port.

use std::io::ErrorKind as IoErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use embedded_hal::serial::{Read as _, Write as _};
use nb::block;

use crate::{Error, SerialPort};

/// Capacity of the receive queue, the receiver blocks once this many bytes are pending
pub const RX_QUEUE_DEPTH: usize = 64;

/// Period the receiver waits between polls of an idle port
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct Transport<P> {
    port: Arc<Mutex<P>>,
    active: Arc<AtomicBool>,
    rx: Option<Receiver<u8>>,
    receiver: Option<JoinHandle<()>>,
}

impl<P: SerialPort> Transport<P> {
    /// Start receiving on an already configured port
    pub fn open(port: P) -> Result<Self, Error> {
        let port = Arc::new(Mutex::new(port));
        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::sync_channel(RX_QUEUE_DEPTH);

        let receiver = {
            let port = port.clone();
            let active = active.clone();
            thread::Builder::new()
                .name("uart-rx".into())
                .spawn(move || receive(port, active, tx))
                .map_err(|e| Error::Io(e.kind()))?
        };

        Ok(Self {
            port,
            active,
            rx: Some(rx),
            receiver: Some(receiver),
        })
    }

    /// Write each buffer in order, stopping at the first failure
    pub fn write(&self, buffers: &[&[u8]]) -> Result<(), Error> {
        if buffers.is_empty() {
            return Err(Error::InvalidArgument("write requires at least one buffer"));
        }
        if !self.is_open() {
            return Err(Error::Closed);
        }

        let mut port = self.port.lock().map_err(|_| Error::Closed)?;

        for buff in buffers {
            for b in buff.iter() {
                block!(port.write(*b))?;
            }
            block!(port.flush())?;

            debug!("tx: {:02x?}", buff);
        }

        Ok(())
    }

    /// Read exactly `n` bytes, failing if they do not all arrive within `timeout`
    pub fn read_exact(&self, n: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        let rx = self.rx.as_ref().ok_or(Error::Closed)?;
        let deadline = Instant::now() + timeout;
        let mut buff = Vec::with_capacity(n);

        while buff.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match rx.recv_timeout(remaining) {
                Ok(b) => buff.push(b),
                Err(RecvTimeoutError::Timeout) => {
                    debug!("rx timeout after {} of {} bytes", buff.len(), n);
                    return Err(Error::ResponseTimeout);
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }

        debug!("rx: {:02x?}", buff);

        Ok(buff)
    }
}

impl<P> Transport<P> {
    /// Whether the port is held and the receiver is still running
    pub fn is_open(&self) -> bool {
        self.rx.is_some() && self.active.load(Ordering::Acquire)
    }

    /// Stop the receiver and release the port queue, safe to call repeatedly
    pub fn close(&mut self) {
        self.active.store(false, Ordering::Release);

        // Dropping the receiving half unblocks a sender waiting on a full queue
        self.rx = None;

        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                error!("uart receiver panicked");
            }
        }
    }
}

impl<P> Drop for Transport<P> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Errors indicating the port has gone away rather than misbehaved
fn is_closed(kind: IoErrorKind) -> bool {
    matches!(
        kind,
        IoErrorKind::BrokenPipe | IoErrorKind::NotConnected | IoErrorKind::UnexpectedEof
    )
}

fn receive<P: SerialPort>(port: Arc<Mutex<P>>, active: Arc<AtomicBool>, tx: SyncSender<u8>) {
    while active.load(Ordering::Acquire) {
        let res = match port.lock() {
            Ok(mut p) => p.read(),
            Err(_) => break,
        };

        match res {
            Ok(b) => {
                trace!("rx byte: {:02x}", b);
                if tx.send(b).is_err() {
                    break;
                }
            }
            Err(nb::Error::WouldBlock) => thread::sleep(POLL_INTERVAL),
            Err(nb::Error::Other(kind)) if is_closed(kind) || !active.load(Ordering::Acquire) => {
                break;
            }
            Err(nb::Error::Other(kind)) => {
                error!("rx error: {:?}", kind);
                break;
            }
        }
    }

    active.store(false, Ordering::Release);
}
