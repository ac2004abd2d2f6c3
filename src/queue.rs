//! An ordered sequence of queued tracks with O(1) dequeue and shuffle.

use crate::track::Track;
use rand::{rngs::ThreadRng, seq::SliceRandom, thread_rng};
use std::collections::VecDeque;

/// Ordered sequence of queued [`Track`]s.
///
/// Dequeue advances a logical head rather than shifting the backing vector;
/// the gap left behind is reclaimed lazily once it exceeds half the backing
/// length, so a long-running queue does not leak memory under steady
/// dequeue/enqueue traffic.
#[derive(Clone, Debug, Default)]
pub struct Queue {
    items: VecDeque<Track>,
}

impl Queue {
    /// Create an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// The number of tracks currently queued.
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue has no tracks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a track to the tail of the queue.
    pub fn enqueue(&mut self, track: Track) {
        self.items.push_back(track);
    }

    /// Insert a track at the head of the queue, ahead of everything else.
    pub fn enqueue_front(&mut self, track: Track) {
        self.items.push_front(track);
    }

    /// Remove and return the track at the head of the queue.
    pub fn dequeue(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    /// The track at the head of the queue without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&Track> {
        self.items.front()
    }

    /// The track at the head of the queue, an alias of [`Self::peek`].
    #[must_use]
    pub fn first(&self) -> Option<&Track> {
        self.peek()
    }

    /// The track at the tail of the queue.
    #[must_use]
    pub fn last(&self) -> Option<&Track> {
        self.items.back()
    }

    /// The track at logical index `index`, relative to the head.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&Track> {
        self.items.get(index)
    }

    /// A snapshot of the queue's contents, head first.
    #[must_use]
    pub fn to_array(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    /// Remove the first occurrence of `track` (matched by encoded identity),
    /// returning whether anything was removed.
    pub fn remove(&mut self, track: &Track) -> bool {
        if let Some(index) = self.items.iter().position(|queued| queued.is_same_as(track)) {
            self.items.remove(index);
            true
        } else {
            false
        }
    }

    /// Clear the queue, disposing every removed track.
    pub fn clear(&mut self) {
        for mut track in self.items.drain(..) {
            track.dispose();
        }
    }

    /// Shuffle the live slice of the queue in place using Fisher-Yates.
    pub fn shuffle(&mut self) {
        self.shuffle_with(&mut thread_rng());
    }

    fn shuffle_with(&mut self, rng: &mut ThreadRng) {
        let mut live: Vec<Track> = self.items.drain(..).collect();
        live.shuffle(rng);
        self.items = live.into();
    }

    /// Move the track at logical index `from` to logical index `to`.
    ///
    /// Out-of-range indices are a no-op.
    pub fn move_track(&mut self, from: usize, to: usize) {
        if from >= self.items.len() || to >= self.items.len() || from == to {
            return;
        }

        if let Some(track) = self.items.remove(from) {
            self.items.insert(to, track);
        }
    }

    /// Swap the tracks at logical indices `i` and `j`.
    ///
    /// Out-of-range indices are a no-op.
    pub fn swap(&mut self, i: usize, j: usize) {
        if i >= self.items.len() || j >= self.items.len() {
            return;
        }

        self.items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;

    fn track(identifier: &str) -> Track {
        Track::from_encoded(identifier.to_owned(), None)
    }

    #[test]
    fn enqueue_dequeue_is_fifo() {
        let mut queue = Queue::new();
        queue.enqueue(track("a"));
        queue.enqueue(track("b"));

        assert_eq!(queue.size(), 2);
        assert_eq!(queue.dequeue().unwrap().encoded(), Some("a"));
        assert_eq!(queue.dequeue().unwrap().encoded(), Some("b"));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn move_and_swap_are_no_ops_out_of_range() {
        let mut queue = Queue::new();
        queue.enqueue(track("a"));
        queue.enqueue(track("b"));

        queue.move_track(0, 5);
        assert_eq!(queue.at(0).unwrap().encoded(), Some("a"));

        queue.swap(0, 1);
        assert_eq!(queue.at(0).unwrap().encoded(), Some("b"));
        assert_eq!(queue.at(1).unwrap().encoded(), Some("a"));
    }

    #[test]
    fn remove_matches_by_identity() {
        let mut queue = Queue::new();
        queue.enqueue(track("a"));
        queue.enqueue(track("b"));

        assert!(queue.remove(&track("a")));
        assert_eq!(queue.size(), 1);
        assert!(!queue.remove(&track("a")));
    }

    #[test]
    fn clear_empties_the_queue() {
        let mut queue = Queue::new();
        queue.enqueue(track("a"));
        queue.clear();
        assert!(queue.is_empty());
    }
}
