use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Non-blocking receive side of one serial line
pub trait ByteChannel: Send {
    /// Bytes ready to be read without blocking
    fn available(&self) -> usize;

    /// Read one byte
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::WouldBlock`] when nothing is available, or
    /// the underlying port's error.
    fn read_byte(&mut self) -> io::Result<u8>;
}

/// The two lines of the console's wired bus
///
/// `request` carries console to motor controller traffic, `response` the
/// replies. Both are only listened to.
pub struct Bus {
    /// Console to motor controller line
    pub request: Box<dyn ByteChannel>,
    /// Motor controller to console line
    pub response: Box<dyn ByteChannel>,
}

impl Bus {
    /// Create a bus from its two lines
    #[must_use]
    pub fn new(request: Box<dyn ByteChannel>, response: Box<dyn ByteChannel>) -> Self {
        Self { request, response }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("request_available", &self.request.available())
            .field("response_available", &self.response.available())
            .finish()
    }
}

/// In-memory line fed by a cloned handle
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    queue: Arc<Mutex<VecDeque<u8>>>,
}

impl MemoryChannel {
    /// Create an empty line
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes as if received on the wire
    pub fn feed(&self, bytes: &[u8]) {
        self.lock().extend(bytes);
    }
}

impl ByteChannel for MemoryChannel {
    fn available(&self) -> usize {
        self.lock().len()
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        self.lock()
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_channel() {
        let feeder = MemoryChannel::new();
        let mut line = feeder.clone();

        assert_eq!(line.available(), 0);
        assert_eq!(
            line.read_byte().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        feeder.feed(&[1, 3, 0]);
        assert_eq!(line.available(), 3);
        assert_eq!(line.read_byte().unwrap(), 1);
        assert_eq!(line.available(), 2);
    }

    #[test]
    fn test_bus_debug() {
        let request = MemoryChannel::new();
        request.feed(&[1]);
        let bus = Bus::new(Box::new(request), Box::new(MemoryChannel::new()));

        let text = format!("{bus:?}");
        assert!(text.contains("request_available: 1"));
    }
}
