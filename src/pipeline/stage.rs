//! Collaborator traits invoked by the pipeline stages
//!
//! The stages own the threading and queueing; these traits are the narrow
//! seams through which they reach the demuxer, codecs, filters and writers.
//! Every call is synchronous and blocks only the calling stage's thread.

use std::marker::PhantomData;

use super::error::StageError;

/// Source of compressed units (the capture/demux side)
pub trait CaptureSource: Send {
    type Unit: Send + 'static;

    /// Block until the next unit is available
    ///
    /// `Ok(None)` means the source is exhausted.
    fn read_unit(&mut self) -> Result<Option<Self::Unit>, StageError>;

    /// Whether `unit` belongs to the stream of interest
    fn wants(&self, _unit: &Self::Unit) -> bool {
        true
    }
}

/// Zero-or-more transform between two queues (decoder or filter graph)
///
/// An implementation appends whatever output it has ready to `out`; leaving
/// `out` untouched is the normal "not ready yet" answer, not a failure.
pub trait Transform: Send {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn process(
        &mut self,
        input: Self::Input,
        out: &mut Vec<Self::Output>,
    ) -> Result<(), StageError>;

    /// Emit anything still buffered once the input has ended
    fn flush(&mut self, _out: &mut Vec<Self::Output>) -> Result<(), StageError> {
        Ok(())
    }
}

/// Terminal consumer (file writer, muxer, renderer)
pub trait Sink: Send {
    type Unit: Send + 'static;

    fn consume(&mut self, unit: Self::Unit) -> Result<(), StageError>;

    /// Called once when the input has ended
    fn finish(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Transform that hands every input through unchanged
pub struct Passthrough<T> {
    _unit: PhantomData<fn(T) -> T>,
}

impl<T> Passthrough<T> {
    pub fn new() -> Self {
        Self { _unit: PhantomData }
    }
}

impl<T> Default for Passthrough<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Transform for Passthrough<T> {
    type Input = T;
    type Output = T;

    fn process(&mut self, input: T, out: &mut Vec<T>) -> Result<(), StageError> {
        out.push(input);
        Ok(())
    }
}
