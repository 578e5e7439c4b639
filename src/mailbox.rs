//! Per-process message queue.
//!
//! A thread-safe FIFO of owned values.  Messages from a given sender are
//! delivered in send order; the mutex hand-off gives the receiver a
//! release/acquire view of everything the sender wrote before `send`.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::value::Value;

pub struct Mailbox {
    queue: Mutex<VecDeque<Value>>,
    signal: Condvar,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    pub fn send(&self, message: Value) {
        self.queue.lock().push_back(message);
        self.signal.notify_all();
    }

    pub fn try_receive(&self) -> Option<Value> {
        self.queue.lock().pop_front()
    }

    /// Block the calling OS thread until a message is queued or the
    /// timeout passes.  Returns whether a message is available.
    pub fn wait_for_message(&self, timeout: Duration) -> bool {
        let mut queue = self.queue.lock();
        if !queue.is_empty() {
            return true;
        }
        self.signal.wait_for(&mut queue, timeout);
        !queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_preserves_send_order() {
        let mailbox = Mailbox::new();
        mailbox.send(Value::Integer(1));
        mailbox.send(Value::Integer(2));
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.try_receive().unwrap().repr(), "1");
        assert_eq!(mailbox.try_receive().unwrap().repr(), "2");
        assert!(mailbox.try_receive().is_none());
    }

    #[test]
    fn waiting_sees_messages_sent_from_another_thread() {
        let mailbox = std::sync::Arc::new(Mailbox::new());
        let sender = mailbox.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sender.send(Value::Integer(7));
        });
        assert!(mailbox.wait_for_message(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(mailbox.try_receive().unwrap().repr(), "7");
    }

    #[test]
    fn waiting_times_out_without_a_sender() {
        let mailbox = Mailbox::new();
        assert!(!mailbox.wait_for_message(Duration::from_millis(5)));
    }
}
