//! Per-player coalescing of REST player-update fields into a single flush.
//!
//! Lives inside a [`crate::player::Player`]'s task and is only ever touched
//! from that task, so it needs no internal synchronization.

use crate::model::outgoing::UpdatePlayer;

/// Coalesces [`UpdatePlayer`] fields set over the lifetime of a player into
/// a single pending update, flushed either immediately or on the next
/// cooperative tick.
#[derive(Debug, Default)]
pub struct UpdateBatcher {
    pending: UpdatePlayer,
    scheduled: bool,
    flushing: bool,
}

/// What a caller should do after merging a batch of fields in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchOutcome {
    /// Nothing needs to happen; a flush is already scheduled or in flight.
    Accumulated,
    /// The caller should schedule a flush on the next cooperative tick.
    ScheduleFlush,
    /// The caller should flush immediately.
    FlushNow,
}

impl UpdateBatcher {
    /// Create a batcher with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `fields` into the pending update.
    ///
    /// A flush is immediate if `immediate` is set or if any of `track`,
    /// `paused`, or `position` are present; otherwise it waits for the next
    /// cooperative tick. Only one flush is ever in flight at a time:
    /// further batches accumulate into `pending` regardless of what the
    /// caller does with the returned outcome.
    pub fn batch(&mut self, fields: UpdatePlayer, immediate: bool) -> BatchOutcome {
        let urgent = immediate
            || fields.track.is_some()
            || fields.paused.is_some()
            || fields.position.is_some();

        self.pending.merge(fields);

        if self.flushing {
            self.scheduled = true;
            return BatchOutcome::Accumulated;
        }

        if urgent {
            self.flushing = true;
            self.scheduled = false;
            BatchOutcome::FlushNow
        } else if self.scheduled {
            BatchOutcome::Accumulated
        } else {
            self.scheduled = true;
            BatchOutcome::ScheduleFlush
        }
    }

    /// Called by a timer or tick handler to promote a scheduled flush to an
    /// in-flight one. Returns `true` if the caller should flush now.
    pub fn take_scheduled_flush(&mut self) -> bool {
        if self.scheduled && !self.flushing {
            self.scheduled = false;
            self.flushing = true;
            true
        } else {
            false
        }
    }

    /// Take the pending update out for sending, clearing it.
    ///
    /// Returns `None` if nothing is pending (a flush can be triggered with
    /// no fields set if, for example, an earlier batch already drained it).
    pub fn take_pending(&mut self) -> Option<UpdatePlayer> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Mark the in-flight flush as complete.
    ///
    /// If anything accumulated while the flush was in progress, the caller
    /// should schedule another flush immediately.
    pub fn complete_flush(&mut self) -> bool {
        self.flushing = false;
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_field_forces_immediate_flush() {
        let mut batcher = UpdateBatcher::new();
        let outcome = batcher.batch(UpdatePlayer::new().paused(true), false);
        assert_eq!(outcome, BatchOutcome::FlushNow);
    }

    #[test]
    fn volume_only_schedules_a_tick() {
        let mut batcher = UpdateBatcher::new();
        let outcome = batcher.batch(UpdatePlayer::new().volume(50), false);
        assert_eq!(outcome, BatchOutcome::ScheduleFlush);
    }

    #[test]
    fn only_one_flush_in_flight_at_a_time() {
        let mut batcher = UpdateBatcher::new();
        assert_eq!(
            batcher.batch(UpdatePlayer::new().paused(true), false),
            BatchOutcome::FlushNow
        );

        let outcome = batcher.batch(UpdatePlayer::new().volume(10), false);
        assert_eq!(outcome, BatchOutcome::Accumulated);

        assert!(batcher.complete_flush());
        let pending = batcher.take_pending().unwrap();
        assert_eq!(pending.volume, Some(10));
    }

    #[test]
    fn take_pending_returns_none_when_empty() {
        let mut batcher = UpdateBatcher::new();
        assert!(batcher.take_pending().is_none());
    }
}
