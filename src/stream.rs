//! Rate-limited byte stream: a big-endian, unframed wire with a
//! per-tick byte budget and sticky error state.

use std::io::{Read, Write};

/// `0` means unlimited — no rate limiting is applied.
struct RateLimiter {
    budget_per_tick: u64,
    remaining: u64,
}

impl RateLimiter {
    fn new(budget_per_tick: u64) -> Self {
        Self {
            budget_per_tick,
            remaining: budget_per_tick,
        }
    }

    fn consume(&mut self, n: u64) {
        if self.budget_per_tick != 0 {
            self.remaining = self.remaining.saturating_sub(n);
        }
    }

    fn is_exhausted(&self) -> bool {
        self.budget_per_tick != 0 && self.remaining == 0
    }

    fn tick(&mut self) {
        self.remaining = self.budget_per_tick;
    }
}

/// A framed, big-endian, back-pressured sink/source wrapping an underlying
/// byte stream `S`. Reading (`get_*`) and writing (`put_*`) are only
/// available when `S` implements the corresponding `std::io` trait, so the
/// same type serves as both the sender and receiver side depending on what
/// the caller backs it with (a `TcpStream` implements both; a `Cursor<Vec<u8>>`
/// used in tests does too).
pub struct MigrationStream<S> {
    inner: S,
    limiter: RateLimiter,
    error: Option<String>,
    bytes_written: u64,
    bytes_read: u64,
}

impl<S> MigrationStream<S> {
    pub fn new(inner: S, rate_limit_bytes_per_tick: u64) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(rate_limit_bytes_per_tick),
            error: None,
            bytes_written: 0,
            bytes_read: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn rate_limited(&self) -> bool {
        self.limiter.is_exhausted()
    }

    /// Replenishes the per-tick budget; called by the driver at the start of
    /// each `iterate()` pass.
    pub fn tick(&mut self) {
        self.limiter.tick();
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn set_error(&mut self, msg: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(msg.into());
        }
    }
}

impl<S: Write> MigrationStream<S> {
    fn put_raw(&mut self, buf: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.inner.write_all(buf) {
            self.set_error(e.to_string());
            return;
        }
        self.bytes_written += buf.len() as u64;
        self.limiter.consume(buf.len() as u64);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put_raw(&[v]);
    }

    pub fn put_be16(&mut self, v: u16) {
        self.put_raw(&v.to_be_bytes());
    }

    pub fn put_be64(&mut self, v: u64) {
        self.put_raw(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, buf: &[u8]) {
        self.put_raw(buf);
    }
}

impl<S: Read> MigrationStream<S> {
    fn get_raw(&mut self, buf: &mut [u8]) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.inner.read_exact(buf) {
            self.set_error(e.to_string());
            return;
        }
        self.bytes_read += buf.len() as u64;
        self.limiter.consume(buf.len() as u64);
    }

    pub fn get_u8(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.get_raw(&mut b);
        b[0]
    }

    pub fn get_be16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.get_raw(&mut b);
        u16::from_be_bytes(b)
    }

    pub fn get_be64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.get_raw(&mut b);
        u64::from_be_bytes(b)
    }

    pub fn get_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.get_raw(&mut buf);
        buf
    }
}
