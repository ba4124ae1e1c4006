//! Loopback channel for driving a sender and a receiver in the same
//! process. Both ends share two byte pipes with real blocking and timeout
//! behavior, so the protocol tests exercise the same code paths as a live
//! connection.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use super::{CancelToken, Com, ComError, ComResult};

#[derive(Default)]
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    avail: Condvar,
}

impl Pipe {
    fn push(&self, data: &[u8]) {
        let mut buf = self.buf.lock().unwrap();
        buf.extend(data.iter());
        self.avail.notify_all();
    }

    fn pop(&self, timeout: Duration, cancel: &CancelToken) -> ComResult<u8> {
        let deadline = Instant::now() + timeout;
        let mut buf = self.buf.lock().unwrap();
        loop {
            if cancel.is_cancelled() {
                return Err(ComError::Cancelled);
            }
            if let Some(b) = buf.pop_front() {
                return Ok(b);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ComError::Timeout);
            }
            // Short slices so a cancel from another thread is noticed
            // without a dedicated wakeup channel.
            let slice = (deadline - now).min(Duration::from_millis(10));
            buf = self.avail.wait_timeout(buf, slice).unwrap().0;
        }
    }

    fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }
}

pub struct TestCom {
    name: &'static str,
    read_pipe: Arc<Pipe>,
    write_pipe: Arc<Pipe>,
    cancel: CancelToken,
}

impl Com for TestCom {
    fn get_name(&self) -> &'static str {
        self.name
    }

    fn read_char(&mut self, timeout: Duration) -> ComResult<u8> {
        self.read_pipe.pop(timeout, &self.cancel)
    }

    fn is_data_available(&mut self) -> ComResult<bool> {
        Ok(self.read_pipe.len() > 0)
    }

    fn write(&mut self, buf: &[u8]) -> ComResult<usize> {
        self.write_pipe.push(buf);
        Ok(buf.len())
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

pub struct TestChannel {
    pub sender: Box<dyn Com>,
    pub receiver: Box<dyn Com>,
}

impl TestChannel {
    pub fn new() -> Self {
        let to_receiver = Arc::new(Pipe::default());
        let to_sender = Arc::new(Pipe::default());
        Self {
            sender: Box::new(TestCom {
                name: "sender",
                read_pipe: to_sender.clone(),
                write_pipe: to_receiver.clone(),
                cancel: CancelToken::new(),
            }),
            receiver: Box::new(TestCom {
                name: "receiver",
                read_pipe: to_receiver,
                write_pipe: to_sender,
                cancel: CancelToken::new(),
            }),
        }
    }
}

impl Default for TestChannel {
    fn default() -> Self {
        Self::new()
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn roundtrip() {
        let mut channel = TestChannel::new();
        let msg = b"Hello World";
        channel.sender.write(msg).expect("error.");
        assert_eq!(
            msg.to_vec(),
            channel
                .receiver
                .read_exact(Duration::from_secs(1), msg.len())
                .unwrap()
        );
    }

    #[test]
    fn timeout_when_empty() {
        let mut channel = TestChannel::new();
        let res = channel.receiver.read_char(Duration::from_millis(30));
        assert!(matches!(res, Err(ComError::Timeout)));
    }

    #[test]
    fn cancel_wakes_pending_read() {
        let mut channel = TestChannel::new();
        let token = channel.receiver.cancel_token();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            token.cancel();
        });
        let res = channel.receiver.read_char(Duration::from_secs(10));
        assert!(matches!(res, Err(ComError::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn purge_drains_pending_bytes() {
        let mut channel = TestChannel::new();
        channel.sender.write(&[1, 2, 3, 4]).unwrap();
        // Give the bytes a moment to be visible on the other side.
        assert!(channel.receiver.is_data_available().unwrap());
        channel.receiver.purge().unwrap();
        assert!(!channel.receiver.is_data_available().unwrap());
    }
}
