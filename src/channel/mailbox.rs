//! Single-slot mailbox over a connector region
//!
//! A producer hands one message at a time to a consumer through a
//! fixed-capacity buffer guarded by a state word ∈ {Empty, Writing, Full, Reading}:
//!
//! - `send` claims the slot with Empty → Writing (acquire), copies the payload,
//!   zero fills the rest, then publishes Full (release).
//! - `recv` claims the slot with Full → Reading (acquire), copies the payload
//!   out, then publishes Empty (release).
//!
//! The claim is a compare-exchange, so only one side ever touches the payload
//! at a time even when several handles share a slot. Every message sent is
//! received exactly once.
//!
//! Isolated domains have no scheduler to block on, so both sides busy-wait.
//! There is no timeout: a second `send` before the matching `recv` spins
//! until the slot drains.

use std::cell::UnsafeCell;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const MAILBOX_EMPTY: u32 = 0;
const MAILBOX_WRITING: u32 = 1;
const MAILBOX_FULL: u32 = 2;
const MAILBOX_READING: u32 = 3;

/// Bytes reserved at the start of a connector region for the state word
pub const MAILBOX_HEADER_LEN: usize = 8;

/// Fixed-capacity buffer shared by two isolation domains
pub struct SharedBuffer {
    state: AtomicU32,
    payload: Box<[UnsafeCell<u8>]>,
}

// Payload access is exclusive to whoever moved the state word into Writing or
// Reading; see `claim`.
unsafe impl Sync for SharedBuffer {}
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    pub fn new(capacity: usize) -> Self {
        let payload: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        Self {
            state: AtomicU32::new(MAILBOX_EMPTY),
            payload,
        }
    }

    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// Whether a message is waiting to be received
    pub fn is_full(&self) -> bool {
        self.state.load(Ordering::Acquire) == MAILBOX_FULL
    }

    fn payload_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.payload.as_ptr())
    }

    /// Spin until the state moves from `from` to `busy` under our hand
    fn claim(&self, from: u32, busy: u32) {
        while self
            .state
            .compare_exchange_weak(from, busy, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    fn publish(&self, to: u32) {
        self.state.store(to, Ordering::Release);
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("capacity", &self.capacity())
            .field("full", &self.is_full())
            .finish()
    }
}

/// Outcome of a `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    /// Bytes copied into the slot
    pub copied: usize,
    /// The payload was longer than the slot and was cut to capacity
    pub truncated: bool,
}

/// Producer and consumer ends of one slot
pub fn pair(buffer: Arc<SharedBuffer>) -> (MailboxSender, MailboxReceiver) {
    let tx = MailboxSender {
        buffer: buffer.clone(),
    };
    let rx = MailboxReceiver { buffer };
    (tx, rx)
}

/// Producer end of a single-slot channel
#[derive(Debug)]
pub struct MailboxSender {
    buffer: Arc<SharedBuffer>,
}

impl MailboxSender {
    pub fn new(buffer: Arc<SharedBuffer>) -> Self {
        Self { buffer }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    /// Whether `rx` drains the slot this sender fills
    pub fn same_slot(&self, rx: &MailboxReceiver) -> bool {
        Arc::ptr_eq(&self.buffer, &rx.buffer)
    }

    /// Deliver `data`, spinning until the slot is empty. Payloads longer than
    /// the capacity are truncated; the unused tail of the slot is zeroed.
    pub fn send(&self, data: &[u8]) -> Sent {
        let capacity = self.buffer.capacity();
        let len = data.len().min(capacity);

        self.buffer.claim(MAILBOX_EMPTY, MAILBOX_WRITING);
        let dst = self.buffer.payload_ptr();
        // SAFETY: we moved the slot to Writing, so no other handle touches the
        // payload until we publish Full; `len <= capacity`.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst, len);
            ptr::write_bytes(dst.add(len), 0, capacity - len);
        }
        self.buffer.publish(MAILBOX_FULL);

        let truncated = data.len() > capacity;
        if truncated {
            log::debug!(
                "mailbox payload truncated from {} to {} bytes",
                data.len(),
                capacity
            );
        }
        Sent {
            copied: len,
            truncated,
        }
    }
}

/// Consumer end of a single-slot channel
#[derive(Debug)]
pub struct MailboxReceiver {
    buffer: Arc<SharedBuffer>,
}

impl MailboxReceiver {
    pub fn new(buffer: Arc<SharedBuffer>) -> Self {
        Self { buffer }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    /// Take the pending message, spinning until one arrives. Copies
    /// `min(out.len(), capacity)` bytes and returns that count.
    pub fn recv(&self, out: &mut [u8]) -> usize {
        self.buffer.claim(MAILBOX_FULL, MAILBOX_READING);
        let len = out.len().min(self.buffer.capacity());
        let src = self.buffer.payload_ptr();
        // SAFETY: we moved the slot to Reading, so no producer writes the
        // payload until we publish Empty; `len <= capacity`.
        unsafe {
            ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
        }
        self.buffer.publish(MAILBOX_EMPTY);
        len
    }

    /// Receive into a freshly allocated buffer of full capacity
    pub fn recv_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.capacity()];
        let n = self.recv(&mut out);
        out.truncate(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    fn mailbox(capacity: usize) -> (MailboxSender, MailboxReceiver) {
        pair(Arc::new(SharedBuffer::new(capacity)))
    }

    #[test]
    fn test_send_then_recv() {
        let (tx, rx) = mailbox(32);
        let sent = tx.send(b"hello");
        assert_eq!(sent, Sent { copied: 5, truncated: false });
        assert!(rx.is_full());

        let mut out = [0xFFu8; 32];
        assert_eq!(rx.recv(&mut out), 32);
        assert_eq!(&out[..5], b"hello");
        assert!(out[5..].iter().all(|&b| b == 0));
        assert!(!tx.is_full());
    }

    #[test]
    fn test_oversize_payload_truncated() {
        let (tx, rx) = mailbox(4);
        let sent = tx.send(b"abcdefgh");
        assert_eq!(sent, Sent { copied: 4, truncated: true });
        assert_eq!(rx.recv_vec(), b"abcd".to_vec());
    }

    #[test]
    fn test_recv_into_small_buffer() {
        let (tx, rx) = mailbox(16);
        tx.send(b"0123456789");
        let mut out = [0u8; 3];
        assert_eq!(rx.recv(&mut out), 3);
        assert_eq!(&out, b"012");
        assert!(!rx.is_full());
    }

    #[test]
    fn test_cross_thread_handoff() {
        let (tx, rx) = mailbox(64);
        let producer = thread::spawn(move || {
            for i in 0..100u32 {
                tx.send(&i.to_le_bytes());
            }
        });
        for i in 0..100u32 {
            let mut out = [0u8; 4];
            rx.recv(&mut out);
            assert_eq!(u32::from_le_bytes(out), i);
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_second_send_waits_for_recv() {
        let (tx, rx) = mailbox(16);
        let producer = thread::spawn(move || {
            tx.send(b"first");
            tx.send(b"second");
        });

        // Give the producer time to reach its second send; the slot must
        // still hold the first message.
        thread::sleep(Duration::from_millis(50));
        assert!(rx.is_full());
        let first = rx.recv_vec();
        assert_eq!(&first[..5], b"first");

        let second = rx.recv_vec();
        assert_eq!(&second[..6], b"second");
        producer.join().unwrap();
    }

    #[test]
    fn test_concurrent_senders_lose_nothing() {
        const PER_SENDER: u32 = 5_000;
        let buffer = Arc::new(SharedBuffer::new(4096));
        let rx = MailboxReceiver::new(buffer.clone());

        let producers: Vec<_> = (0..2u32)
            .map(|sender| {
                let tx = MailboxSender::new(buffer.clone());
                thread::spawn(move || {
                    for i in 0..PER_SENDER {
                        let tag = ((sender << 16) | i).to_le_bytes();
                        // fill the whole slot so torn writes would show up
                        let msg: Vec<u8> = tag.iter().copied().cycle().take(4096).collect();
                        tx.send(&msg);
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for _ in 0..2 * PER_SENDER {
            let msg = rx.recv_vec();
            let tag = [msg[0], msg[1], msg[2], msg[3]];
            assert!(msg.chunks(4).all(|c| c == tag), "torn message");
            assert!(seen.insert(u32::from_le_bytes(tag)), "duplicate message");
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(seen.len(), 2 * PER_SENDER as usize);
        assert!(!rx.is_full());
    }
}
