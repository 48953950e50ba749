//! Identifier types shared by the client and the server.

use std::fmt;

/// Server-assigned transaction ID.
///
/// Tids are allocated in blocks by the server and are unique for the lifetime
/// of the server process. The client only stores and echoes them. TID 0 is
/// never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(u64);

impl Tid {
    /// Invalid transaction ID (0).
    pub const INVALID: Self = Self(0);

    /// Create a new transaction ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned persistent object ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Create a new object ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interned class-info ID. Dense, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A locally cached contiguous range of IDs, served without a round trip.
///
/// The window is half-open: `next` is the next ID to hand out and `end` is
/// one past the last usable ID. An empty window has `next == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdWindow {
    next: u64,
    end: u64,
}

impl IdWindow {
    /// An exhausted window.
    pub const fn empty() -> Self {
        Self { next: 0, end: 0 }
    }

    /// Takes the next ID, or `None` if the window is exhausted.
    pub fn take(&mut self) -> Option<u64> {
        if self.next >= self.end {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }

    /// Replaces the window with the block `[first, first + count)`.
    pub fn refill(&mut self, first: u64, count: u64) {
        self.next = first;
        self.end = first.saturating_add(count);
    }

    /// Number of IDs left in the window.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_is_exhausted() {
        let mut window = IdWindow::empty();
        assert!(window.is_exhausted());
        assert_eq!(window.take(), None);
    }

    #[test]
    fn test_window_serves_block_in_order() {
        let mut window = IdWindow::empty();
        window.refill(100, 3);

        assert_eq!(window.remaining(), 3);
        assert_eq!(window.take(), Some(100));
        assert_eq!(window.take(), Some(101));
        assert_eq!(window.take(), Some(102));
        assert_eq!(window.take(), None);
        assert!(window.is_exhausted());
    }

    #[test]
    fn test_refill_replaces_remaining_ids() {
        let mut window = IdWindow::empty();
        window.refill(1, 10);
        window.take();
        window.refill(200, 2);

        assert_eq!(window.take(), Some(200));
        assert_eq!(window.remaining(), 1);
    }

    #[test]
    fn test_tid_display() {
        assert_eq!(Tid::new(7).to_string(), "7");
        assert_eq!(ObjectId::new(42).to_string(), "42");
    }
}
