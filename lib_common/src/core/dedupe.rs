use std::collections::{HashSet, VecDeque};

/// Where a key stands when a reading carrying it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Unknown; the key is now reserved for the caller.
    New,
    /// Reserved by a submission that has not finished queueing yet.
    InFlight,
    /// Its reading was queued recently.
    Seen,
}

/// # Duplicate Filter
///
/// Remembers the last `capacity` idempotency keys. The reader retries a line
/// until the server acknowledges it, so a line whose acknowledgement got lost
/// arrives twice; the second copy is recognised here and not written again.
///
/// A key goes through two stages. [`reserve`](Self::reserve) marks it in
/// flight while its reading waits for room in the queue; only
/// [`commit`](Self::commit) puts it in the window. A reservation that is
/// [`release`](Self::release)d leaves no trace.
///
/// Eviction is FIFO: the window is "the last N keys", not "the last N seconds".
#[derive(Debug)]
pub struct DuplicateFilter {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
    reserved: HashSet<String>,
}

impl DuplicateFilter {
    /// A filter holding at most `capacity` keys. A zero capacity disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::with_capacity(capacity.min(1024)),
            reserved: HashSet::new(),
        }
    }

    /// Whether `key` is in the window.
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Looks `key` up and reserves it when it is [`KeyState::New`].
    pub fn reserve(&mut self, key: &str) -> KeyState {
        if self.capacity == 0 {
            return KeyState::New;
        }
        if self.seen.contains(key) {
            return KeyState::Seen;
        }
        if !self.reserved.insert(key.to_string()) {
            return KeyState::InFlight;
        }
        KeyState::New
    }

    /// Moves a reserved key into the window.
    pub fn commit(&mut self, key: &str) {
        if self.capacity == 0 || !self.reserved.remove(key) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
    }

    /// Drops a reservation. Returns `false` if `key` was not reserved.
    pub fn release(&mut self, key: &str) -> bool {
        self.reserved.remove(key)
    }

    /// Number of keys in the window.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// `true` when the window is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
