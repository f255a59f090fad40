//! Core types for the pipeline system

use std::fmt;

/// Single-owner handle around one media object moving through the pipeline
///
/// A unit is created by the stage that produces it, moved into exactly one
/// queue, moved out by exactly one consumer and released when that consumer
/// drops it. It is deliberately not `Clone`.
pub struct MediaUnit<T> {
    /// Position of this unit in its producer's output order
    sequence: u64,
    payload: T,
}

impl<T> MediaUnit<T> {
    pub fn new(sequence: u64, payload: T) -> Self {
        Self { sequence, payload }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Take ownership of the wrapped media object
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T> fmt::Debug for MediaUnit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaUnit")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Hands out increasing sequence numbers for one producer
#[derive(Debug, Default)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `payload` in a unit carrying the next sequence number
    pub fn wrap<T>(&mut self, payload: T) -> MediaUnit<T> {
        let unit = MediaUnit::new(self.next, payload);
        self.next += 1;
        unit
    }

    /// Number of units produced so far
    pub fn produced(&self) -> u64 {
        self.next
    }
}
