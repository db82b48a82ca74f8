//! Session modifications buffer accounting

/// Remaining room in the card modifications buffer
///
/// Counted in bytes or in commands depending on the card. The counter may go
/// negative, which means the last accounted command overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionBuffer {
    capacity: i32,
    remaining: i32,
    in_bytes: bool,
}

impl SessionBuffer {
    pub fn new(capacity: usize, in_bytes: bool) -> Self {
        let capacity = i32::try_from(capacity).unwrap_or(i32::MAX);
        Self {
            capacity,
            remaining: capacity,
            in_bytes,
        }
    }

    pub fn is_counted_in_bytes(&self) -> bool {
        self.in_bytes
    }

    pub fn remaining(&self) -> i32 {
        self.remaining
    }

    pub fn reset(&mut self) {
        self.remaining = self.capacity;
    }

    /// Subtract `cost`; false when the buffer overflows
    pub fn consume(&mut self, cost: i32) -> bool {
        self.remaining -= cost;
        self.remaining >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_counted_buffer() {
        let mut buffer = SessionBuffer::new(430, true);
        for _ in 0..12 {
            assert!(buffer.consume(35));
        }
        assert_eq!(buffer.remaining(), 10);
        assert!(!buffer.consume(35));
        assert_eq!(buffer.remaining(), -25);

        buffer.reset();
        assert!(buffer.consume(35));
        assert_eq!(buffer.remaining(), 395);
    }

    #[test]
    fn test_command_counted_buffer() {
        let mut buffer = SessionBuffer::new(3, false);
        assert!(!buffer.is_counted_in_bytes());
        assert!(buffer.consume(1));
        assert!(buffer.consume(1));
        assert!(buffer.consume(1));
        assert!(!buffer.consume(1));
    }
}
