//! Request id allocation.

/// Produces the ids that correlate requests with their responses.
///
/// Starts at 0 and wraps after `u32::MAX`. Owned by a single channel.
#[derive(Debug, Clone, Default)]
pub struct SequenceGenerator {
    next: u32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Start from an arbitrary id.
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }

    /// The id the next call to [`next_id`](Self::next_id) will return.
    pub fn peek(&self) -> u32 {
        self.next
    }
}
