//! In-memory byte stream and clock for driving the link in tests

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::link::{ByteStream, Clock};

#[derive(Default)]
struct Wire {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

/// Cloneable handle: the link owns one clone, the test keeps another
#[derive(Clone, Default)]
pub struct MockStream {
    wire: Arc<Mutex<Wire>>,
}

impl MockStream {
    /// Bytes the unit sends to the module
    pub fn inject(&self, bytes: &[u8]) {
        self.wire.lock().unwrap().rx.extend(bytes);
    }

    /// Everything the module wrote so far, draining it
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.wire.lock().unwrap().tx)
    }

    pub fn pending(&self) -> usize {
        self.wire.lock().unwrap().rx.len()
    }
}

impl ByteStream for MockStream {
    fn available(&mut self) -> usize {
        self.pending()
    }

    fn peek(&mut self) -> Option<u8> {
        self.wire.lock().unwrap().rx.front().copied()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.wire.lock().unwrap().rx.pop_front()
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.wire.lock().unwrap().tx.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
