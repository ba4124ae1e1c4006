//! Byte stream abstraction the protocol engines run on.
//!
//! A [`Com`] is a pair of byte pipes with read timeouts. The protocols never
//! see the underlying transport (serial line, telnet, ssh channel, test
//! pipe); they only read single bytes or fixed runs with a deadline and
//! write whole buffers.
//!
//! Timeouts, end of stream and local cancellation are ordinary values of
//! [`ComError`], not panics or sentinel bytes. The state machines branch on
//! them to drive their recovery paths (purge + NAK, header resend, abort).

use std::{fmt, io, sync::atomic::AtomicBool, sync::atomic::Ordering, sync::Arc, time::Duration};

#[cfg(test)]
pub mod test_channel;
#[cfg(test)]
pub use test_channel::*;

pub type ComResult<T> = Result<T, ComError>;

#[derive(Debug)]
pub enum ComError {
    /// No byte arrived before the deadline.
    Timeout,
    /// The stream closed while data was still expected.
    Eof,
    /// A pending read was interrupted through a [`CancelToken`].
    Cancelled,
    Io(io::Error),
}

impl fmt::Display for ComError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComError::Timeout => write!(f, "read timed out"),
            ComError::Eof => write!(f, "unexpected end of transmission"),
            ComError::Cancelled => write!(f, "read cancelled"),
            ComError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for ComError {}

impl From<io::Error> for ComError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ComError::Timeout,
            io::ErrorKind::UnexpectedEof => ComError::Eof,
            io::ErrorKind::Interrupted => ComError::Cancelled,
            _ => ComError::Io(err),
        }
    }
}

/// Handle used to interrupt a pending read from another thread.
///
/// Cancelling is sticky until [`CancelToken::reset`] is called, so a cancel
/// issued between two reads is not lost.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

pub trait Com: Send {
    fn get_name(&self) -> &'static str;

    /// Read a single byte, waiting at most `timeout`.
    fn read_char(&mut self, timeout: Duration) -> ComResult<u8>;

    /// Read exactly `len` bytes. The timeout applies to each byte, not the
    /// whole run.
    fn read_exact(&mut self, timeout: Duration, len: usize) -> ComResult<Vec<u8>> {
        let mut result = Vec::with_capacity(len);
        while result.len() < len {
            result.push(self.read_char(timeout)?);
        }
        Ok(result)
    }

    /// True if at least one byte can be read without blocking.
    fn is_data_available(&mut self) -> ComResult<bool>;

    fn write(&mut self, buf: &[u8]) -> ComResult<usize>;

    /// Push buffered output to the transport. A no-op for unbuffered
    /// streams.
    fn flush(&mut self) -> ComResult<()> {
        Ok(())
    }

    /// Token that interrupts a read pending on this stream.
    fn cancel_token(&self) -> CancelToken;

    /// Drain everything currently readable. Used to resynchronize after a
    /// garbled block before NAKing it.
    fn purge(&mut self) -> ComResult<()> {
        while self.is_data_available()? {
            self.read_char(Duration::from_millis(10))?;
        }
        Ok(())
    }
}
