//! Append-only record of endpoint lifecycle events.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Text buffer written by endpoint callbacks and read by the driver
/// once the close signal has fired.
#[derive(Debug, Default)]
pub struct ObservationBuffer {
    text: Mutex<String>,
}

impl ObservationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.text.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event to the end of the buffer
    pub fn append(&self, event: &str) {
        self.lock().push_str(event);
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> String {
        self.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lock().contains(needle)
    }

    /// Discard everything recorded so far (start of a new run)
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_contains() {
        let buffer = ObservationBuffer::new();
        assert!(!buffer.contains("Closing connection"));

        buffer.append("Closing connection");
        assert!(buffer.contains("Closing connection"));
        assert_eq!(buffer.snapshot(), "Closing connection");
    }

    #[test]
    fn test_append_preserves_order() {
        let buffer = ObservationBuffer::new();
        buffer.append("a");
        buffer.append("b");
        assert_eq!(buffer.snapshot(), "ab");
    }

    #[test]
    fn test_clear() {
        let buffer = ObservationBuffer::new();
        buffer.append("stale");
        buffer.clear();
        assert_eq!(buffer.snapshot(), "");
    }
}
