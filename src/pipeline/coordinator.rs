//! Pipeline coordinator
//!
//! [`PipelineBuilder`] chains a source, any number of transforms and a sink
//! into a [`Topology`]: an ordered list of stage descriptors, each wired to
//! one input and one output [`StageQueue`]. [`Pipeline`] runs a topology with
//! one OS thread per stage and owns the start / stop / join lifecycle.

use log::{debug, error, info};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::error::PipelineError;
use super::health::{HealthSummary, PipelineHealth, StageHealth};
use super::queue::{QueueControl, StageQueue};
use super::stage::{CaptureSource, Sink, Transform};
use super::stages::{self, StageContext, StageExit};
use super::state::{PipelineState, RunState};
use super::sync::Monitor;
use super::types::MediaUnit;
use crate::utils::sos::{HookId, SignalOfStop};

/// Queue depth at which growth warnings start by default
pub const DEFAULT_QUEUE_WARN_DEPTH: usize = 256;

/// Every stage thread is named `<prefix><stage name>`
pub const STAGE_THREAD_PREFIX: &str = "stage-";

type StageBody = Box<dyn FnOnce(StageContext) -> StageExit + Send>;

/// One stage of a topology: its name, its thread body and the queue it feeds
struct StageDescriptor {
    name: &'static str,
    health: Arc<StageHealth>,
    output: Option<Arc<dyn QueueControl>>,
    body: StageBody,
}

/// Chains stages together; the type parameter is the unit type flowing out
/// of the most recently added stage
pub struct PipelineBuilder<T> {
    stages: Vec<StageDescriptor>,
    queues: Vec<Arc<dyn QueueControl>>,
    health: PipelineHealth,
    head: Arc<dyn QueueControl>,
    tail: Arc<StageQueue<MediaUnit<T>>>,
    warn_depth: usize,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Start a topology with the capture stage
    pub fn from_source<S>(name: &'static str, source: S) -> Self
    where
        S: CaptureSource<Unit = T> + 'static,
    {
        let warn_depth = DEFAULT_QUEUE_WARN_DEPTH;
        let mut health = PipelineHealth::new();
        let stage_health = health.register(name);

        let output = Arc::new(StageQueue::new(format!("{}.out", name), warn_depth));
        let head: Arc<dyn QueueControl> = output.clone();

        let stage_output = output.clone();
        let body: StageBody =
            Box::new(move |ctx| stages::run_capture(source, stage_output, ctx));

        Self {
            stages: vec![StageDescriptor {
                name,
                health: stage_health,
                output: Some(head.clone()),
                body,
            }],
            queues: vec![head.clone()],
            health,
            head,
            tail: output,
            warn_depth,
        }
    }

    /// Warn when any queue grows past `depth` items
    pub fn queue_warn_depth(self, depth: usize) -> Self {
        for queue in &self.queues {
            queue.set_warn_depth(depth);
        }
        Self {
            warn_depth: depth,
            ..self
        }
    }

    /// Append a decode/filter style stage consuming the current tail
    pub fn transform<X>(self, name: &'static str, transform: X) -> PipelineBuilder<X::Output>
    where
        X: Transform<Input = T> + 'static,
    {
        let PipelineBuilder {
            stages: mut descriptors,
            mut queues,
            mut health,
            head,
            tail,
            warn_depth,
        } = self;

        let stage_health = health.register(name);
        let output = Arc::new(StageQueue::new(format!("{}.out", name), warn_depth));
        let output_control: Arc<dyn QueueControl> = output.clone();

        let stage_output = output.clone();
        let body: StageBody = Box::new(move |ctx| {
            stages::run_transform(transform, tail, stage_output, ctx)
        });

        descriptors.push(StageDescriptor {
            name,
            health: stage_health,
            output: Some(output_control.clone()),
            body,
        });
        queues.push(output_control);

        PipelineBuilder {
            stages: descriptors,
            queues,
            health,
            head,
            tail: output,
            warn_depth,
        }
    }

    /// Close the topology with its sink
    pub fn sink<K>(self, name: &'static str, sink: K) -> Topology
    where
        K: Sink<Unit = T> + 'static,
    {
        let PipelineBuilder {
            stages: mut descriptors,
            queues,
            mut health,
            head,
            tail,
            ..
        } = self;

        let stage_health = health.register(name);
        let body: StageBody = Box::new(move |ctx| stages::run_sink(sink, tail, ctx));
        descriptors.push(StageDescriptor {
            name,
            health: stage_health,
            output: None,
            body,
        });

        Topology {
            stages: descriptors,
            queues,
            health,
            head,
        }
    }
}

/// A complete, type-erased chain of stages ready to be run
pub struct Topology {
    stages: Vec<StageDescriptor>,
    queues: Vec<Arc<dyn QueueControl>>,
    health: PipelineHealth,
    head: Arc<dyn QueueControl>,
}

impl Topology {
    /// Stage names in data-flow order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }
}

/// State shared between the orchestrator, its handles and the stage threads
pub(crate) struct Control {
    run: RunState,
    state: Monitor<PipelineState>,
    head: Arc<dyn QueueControl>,
    forced: AtomicBool,
}

impl Control {
    fn new(head: Arc<dyn QueueControl>) -> Self {
        Self {
            run: RunState::new(),
            state: Monitor::new(PipelineState::Idle),
            head,
            forced: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.run.is_running()
    }

    fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    fn forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Orchestrator-side stop. Idempotent and safe from any thread.
    fn request_stop(&self) {
        let mut state = self.state.lock();
        match *state {
            PipelineState::Idle => {
                transition(&mut state, PipelineState::Stopped);
                info!("Pipeline: stopped before start");
                return;
            }
            PipelineState::Running { .. } => {
                transition(&mut state, PipelineState::StopRequested);
                info!("Pipeline: stop requested");
            }
            _ => return,
        }

        // Terminating the head queue is what wakes anyone blocked on it;
        // the cascade takes care of every queue downstream.
        self.run.stop();
        self.head.terminate();
        transition(&mut state, PipelineState::Draining);
    }

    /// A stage started the cascade on its own (end of stream or failure)
    pub(crate) fn begin_cascade(&self) {
        let mut state = self.state.lock();
        if self.run.stop() {
            debug!("Pipeline: run flag cleared by a stage");
        }
        self.head.terminate();
        if matches!(
            *state,
            PipelineState::Running { .. } | PipelineState::StopRequested
        ) {
            transition(&mut state, PipelineState::Draining);
        }
    }

    pub(crate) fn fail(&self, stage: &'static str) {
        error!("Pipeline: stage '{}' failed, shutting down", stage);
        self.forced.store(true, Ordering::SeqCst);
        self.begin_cascade();
    }
}

fn transition(state: &mut PipelineState, next: PipelineState) {
    debug_assert!(
        state.can_transition_to(&next),
        "invalid pipeline transition {} -> {}",
        state,
        next
    );
    debug!("Pipeline: {} -> {}", state, next);
    *state = next;
}

/// Whether the pipeline wound down on its own terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every stage drained its input and exited normally
    Clean,
    /// At least one stage failed or panicked
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: &'static str,
    pub exit: StageExit,
}

/// Result of [`Pipeline::join`]
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub outcome: Outcome,
    /// One entry per stage thread, in data-flow order
    pub stages: Vec<StageReport>,
    /// Units still queued after every stage exited, released at join
    pub discarded: usize,
    pub health: HealthSummary,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.outcome == Outcome::Clean
    }
}

/// Clonable handle that can stop a pipeline from any thread
#[derive(Clone)]
pub struct PipelineHandle {
    control: Arc<Control>,
}

impl PipelineHandle {
    pub fn stop(&self) {
        self.control.request_stop();
    }

    pub fn state(&self) -> PipelineState {
        self.control.state()
    }
}

/// Runs a [`Topology`]: one thread per stage, linear data flow
pub struct Pipeline {
    control: Arc<Control>,
    descriptors: Vec<StageDescriptor>,
    queues: Vec<Arc<dyn QueueControl>>,
    health: PipelineHealth,
    threads: Vec<(&'static str, JoinHandle<StageExit>)>,
    signal: SignalOfStop,
    hook: Option<HookId>,
}

impl Pipeline {
    /// Create a pipeline that stops when `signal` is cancelled
    pub fn new(topology: Topology, signal: SignalOfStop) -> Self {
        let Topology {
            stages,
            queues,
            health,
            head,
        } = topology;

        let control = Arc::new(Control::new(head));
        let weak: Weak<Control> = Arc::downgrade(&control);
        let hook = signal.on_cancel(move || {
            if let Some(control) = weak.upgrade() {
                control.request_stop();
            }
        });

        Self {
            control,
            descriptors: stages,
            queues,
            health,
            threads: Vec::new(),
            signal,
            hook: Some(hook),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.control.state()
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            control: self.control.clone(),
        }
    }

    pub fn health(&self) -> &PipelineHealth {
        &self.health
    }

    /// Number of stage threads spawned and not yet joined
    pub fn live_threads(&self) -> usize {
        self.threads.len()
    }

    /// Current depth of every queue, in data-flow order
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.queues
            .iter()
            .map(|q| (q.name().to_string(), q.len()))
            .collect()
    }

    /// Spawn every stage thread
    pub fn start(&mut self) -> Result<(), PipelineError> {
        {
            let mut state = self.control.state.lock();
            if *state != PipelineState::Idle {
                return Err(PipelineError::InvalidTransition {
                    from: *state,
                    to: "Running",
                });
            }
            self.control.run.start();
            transition(
                &mut state,
                PipelineState::Running {
                    started_at: Instant::now(),
                },
            );
        }

        // Downstream first: every consumer is waiting before its producer runs
        let descriptors = std::mem::take(&mut self.descriptors);
        let mut spawned = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors.into_iter().rev() {
            let name = descriptor.name;
            match self.spawn_stage(descriptor) {
                Ok(handle) => spawned.push((name, handle)),
                Err(source) => {
                    error!("Pipeline: failed to spawn stage '{}': {}", name, source);
                    self.control.fail(name);
                    for queue in &self.queues {
                        queue.terminate();
                    }
                    spawned.reverse();
                    self.threads = spawned;
                    self.join_threads();
                    self.finish();
                    return Err(PipelineError::Spawn {
                        stage: name,
                        source,
                    });
                }
            }
        }
        spawned.reverse();
        self.threads = spawned;

        info!(
            "Pipeline: running {} stages ({})",
            self.threads.len(),
            self.threads
                .iter()
                .map(|(name, _)| *name)
                .collect::<Vec<_>>()
                .join(" → ")
        );
        Ok(())
    }

    fn spawn_stage(&self, descriptor: StageDescriptor) -> std::io::Result<JoinHandle<StageExit>> {
        let StageDescriptor {
            name,
            health,
            output,
            body,
        } = descriptor;
        let control = self.control.clone();

        thread::Builder::new()
            .name(format!("{}{}", STAGE_THREAD_PREFIX, name))
            .spawn(move || {
                let ctx = StageContext::new(name, control.clone(), health);
                match catch_unwind(AssertUnwindSafe(move || body(ctx))) {
                    Ok(exit) => exit,
                    Err(_) => {
                        // The body never reached its own cleanup
                        control.fail(name);
                        if let Some(output) = output {
                            output.terminate();
                        }
                        StageExit::Panicked
                    }
                }
            })
    }

    /// Ask every stage to wind down. Idempotent.
    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Block until every stage thread has exited
    ///
    /// Joining a running pipeline waits for its natural end of stream.
    pub fn join(&mut self) -> Result<ShutdownReport, PipelineError> {
        let state = self.state();
        if !state.is_active() {
            return Err(PipelineError::InvalidTransition {
                from: state,
                to: "Stopped",
            });
        }

        let stages = self.join_threads();
        let discarded = self.finish();

        let forced =
            self.control.forced() || stages.iter().any(|s| s.exit != StageExit::Completed);
        let outcome = if forced {
            Outcome::Forced
        } else {
            Outcome::Clean
        };
        let health = self.health.summary();
        info!("Pipeline: stopped ({:?}) {}", outcome, health);

        Ok(ShutdownReport {
            outcome,
            stages,
            discarded,
            health,
        })
    }

    fn join_threads(&mut self) -> Vec<StageReport> {
        self.threads
            .drain(..)
            .map(|(name, handle)| {
                let exit = handle.join().unwrap_or_else(|_| {
                    error!("Pipeline: stage '{}' panicked", name);
                    StageExit::Panicked
                });
                debug!("Pipeline: joined stage '{}' ({})", name, exit);
                StageReport { name, exit }
            })
            .collect()
    }

    /// Release leftovers and settle in `Stopped`; returns the discarded count
    fn finish(&mut self) -> usize {
        let mut discarded = 0;
        for queue in &self.queues {
            let count = queue.discard();
            if count > 0 {
                debug!("Pipeline: discarded {} units from {}", count, queue.name());
            }
            discarded += count;
        }

        if let Some(hook) = self.hook.take() {
            self.signal.remove_hook(hook);
        }
        transition(&mut self.control.state.lock(), PipelineState::Stopped);
        discarded
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            self.signal.remove_hook(hook);
        }
        if thread::panicking() {
            return;
        }
        let state = self.state();
        assert!(
            matches!(state, PipelineState::Idle | PipelineState::Stopped),
            "pipeline dropped while {} (call join() first)",
            state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StageError;
    use crate::pipeline::stage::Passthrough;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Media object that counts how many times it has been released
    struct Tracked {
        id: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Source yielding `count` units, then end of stream
    struct FixedSource {
        next: u32,
        count: u32,
        drops: Arc<AtomicUsize>,
    }

    impl FixedSource {
        fn new(count: u32, drops: Arc<AtomicUsize>) -> Self {
            Self {
                next: 0,
                count,
                drops,
            }
        }
    }

    impl CaptureSource for FixedSource {
        type Unit = Tracked;

        fn read_unit(&mut self) -> Result<Option<Tracked>, StageError> {
            if self.next == self.count {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(Tracked {
                id: self.next,
                drops: self.drops.clone(),
            }))
        }
    }

    /// Live source: yields a unit every few milliseconds until stopped
    struct EndlessSource {
        next: u32,
        drops: Arc<AtomicUsize>,
    }

    impl CaptureSource for EndlessSource {
        type Unit = Tracked;

        fn read_unit(&mut self) -> Result<Option<Tracked>, StageError> {
            thread::sleep(Duration::from_millis(2));
            self.next += 1;
            Ok(Some(Tracked {
                id: self.next,
                drops: self.drops.clone(),
            }))
        }

        fn wants(&self, unit: &Tracked) -> bool {
            // Odd ids belong to another stream
            unit.id % 2 == 0
        }
    }

    /// Source that blocks until the test feeds it through a channel
    struct ChannelSource {
        rx: mpsc::Receiver<u32>,
    }

    impl CaptureSource for ChannelSource {
        type Unit = u32;

        fn read_unit(&mut self) -> Result<Option<u32>, StageError> {
            Ok(self.rx.recv().ok())
        }
    }

    /// Decoder emitting one output per `every` inputs
    struct EveryNth {
        every: u32,
        seen: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Transform for EveryNth {
        type Input = Tracked;
        type Output = Tracked;

        fn process(&mut self, input: Tracked, out: &mut Vec<Tracked>) -> Result<(), StageError> {
            self.seen += 1;
            if self.seen % self.every == 0 {
                out.push(Tracked {
                    id: input.id,
                    drops: self.drops.clone(),
                });
            }
            Ok(())
        }
    }

    /// Decoder that stays silent for the first `warmup` inputs
    struct SlowStart {
        warmup: u32,
        seen: u32,
    }

    impl Transform for SlowStart {
        type Input = Tracked;
        type Output = Tracked;

        fn process(&mut self, input: Tracked, out: &mut Vec<Tracked>) -> Result<(), StageError> {
            self.seen += 1;
            if self.seen > self.warmup {
                out.push(input);
            }
            Ok(())
        }
    }

    /// Decoder that keeps everything buffered until flushed
    struct Buffering {
        held: Vec<Tracked>,
    }

    impl Transform for Buffering {
        type Input = Tracked;
        type Output = Tracked;

        fn process(&mut self, input: Tracked, _out: &mut Vec<Tracked>) -> Result<(), StageError> {
            self.held.push(input);
            Ok(())
        }

        fn flush(&mut self, out: &mut Vec<Tracked>) -> Result<(), StageError> {
            out.append(&mut self.held);
            Ok(())
        }
    }

    /// Filter rejecting every unit with a transient error
    struct AlwaysRejects;

    impl Transform for AlwaysRejects {
        type Input = Tracked;
        type Output = Tracked;

        fn process(&mut self, _input: Tracked, _out: &mut Vec<Tracked>) -> Result<(), StageError> {
            Err(StageError::transient("EAGAIN"))
        }
    }

    /// Decoder whose codec context is broken from the first packet on
    struct BrokenDecoder;

    impl Transform for BrokenDecoder {
        type Input = Tracked;
        type Output = Tracked;

        fn process(&mut self, _input: Tracked, _out: &mut Vec<Tracked>) -> Result<(), StageError> {
            Err(StageError::fatal("send packet: invalid data"))
        }
    }

    /// Source that requests a stop after the run flag check for unit
    /// `stop_at` has already passed
    struct StopsBeforePush {
        next: u32,
        stop_at: u32,
        handle: Arc<Mutex<Option<PipelineHandle>>>,
        drops: Arc<AtomicUsize>,
    }

    impl CaptureSource for StopsBeforePush {
        type Unit = Tracked;

        fn read_unit(&mut self) -> Result<Option<Tracked>, StageError> {
            while self.handle.lock().unwrap().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
            self.next += 1;
            Ok(Some(Tracked {
                id: self.next,
                drops: self.drops.clone(),
            }))
        }

        fn wants(&self, unit: &Tracked) -> bool {
            if unit.id == self.stop_at {
                if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                    handle.stop();
                }
            }
            true
        }
    }

    /// Sink recording the ids it consumed
    #[derive(Clone, Default)]
    struct CollectingSink {
        ids: Arc<Mutex<Vec<u32>>>,
        finished: Arc<AtomicBool>,
    }

    impl CollectingSink {
        fn ids(&self) -> Vec<u32> {
            self.ids.lock().unwrap().clone()
        }
    }

    impl Sink for CollectingSink {
        type Unit = Tracked;

        fn consume(&mut self, unit: Tracked) -> Result<(), StageError> {
            self.ids.lock().unwrap().push(unit.id);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), StageError> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sink whose storage fails after `limit` units
    struct FailingSink {
        written: u32,
        limit: u32,
    }

    impl Sink for FailingSink {
        type Unit = Tracked;

        fn consume(&mut self, _unit: Tracked) -> Result<(), StageError> {
            if self.written == self.limit {
                return Err(StageError::Io(std::io::Error::other("disk full")));
            }
            self.written += 1;
            Ok(())
        }
    }

    struct PanickingSink;

    impl Sink for PanickingSink {
        type Unit = u32;

        fn consume(&mut self, _unit: u32) -> Result<(), StageError> {
            panic!("renderer crashed");
        }
    }

    #[derive(Clone, Default)]
    struct CountingSink {
        count: Arc<AtomicUsize>,
    }

    impl Sink for CountingSink {
        type Unit = u32;

        fn consume(&mut self, _unit: u32) -> Result<(), StageError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_end_to_end_ten_units() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source("capture", FixedSource::new(10, drops.clone()))
            .transform(
                "decode",
                EveryNth {
                    every: 2,
                    seen: 0,
                    drops: drops.clone(),
                },
            )
            .transform("filter", Passthrough::new())
            .sink("sink", sink.clone());
        assert_eq!(
            topology.stage_names(),
            vec!["capture", "decode", "filter", "sink"]
        );

        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        assert_eq!(pipeline.live_threads(), 4);

        wait_until(|| sink.ids().len() == 5);
        pipeline.stop();
        let report = pipeline.join().unwrap();

        assert_eq!(sink.ids(), vec![2, 4, 6, 8, 10]);
        assert!(sink.finished.load(Ordering::SeqCst));
        assert!(report.is_clean());
        assert_eq!(report.stages.len(), 4);
        assert!(report.stages.iter().all(|s| s.exit == StageExit::Completed));
        assert_eq!(report.discarded, 0);
        assert!(pipeline.queue_depths().iter().all(|(_, depth)| *depth == 0));
        assert_eq!(pipeline.live_threads(), 0);
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // 10 compressed units + 5 decoded units, each released exactly once
        assert_eq!(drops.load(Ordering::SeqCst), 15);
        let sink_health = pipeline.health().stage("sink").unwrap();
        assert_eq!(sink_health.emitted(), 5);
    }

    #[test]
    fn test_end_of_stream_cascades_without_stop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source("capture", FixedSource::new(3, drops.clone()))
            .transform("decode", Passthrough::new())
            .transform("filter", Passthrough::new())
            .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();

        // No stop(): the source running dry must bring everything down
        let report = pipeline.join().unwrap();

        assert!(report.is_clean());
        assert_eq!(sink.ids(), vec![1, 2, 3]);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert!(pipeline.queues.iter().all(|q| q.is_terminated()));
    }

    #[test]
    fn test_terminating_head_queue_cascades_downstream() {
        let (tx, rx) = mpsc::channel();
        let sink = CountingSink::default();

        let topology = PipelineBuilder::from_source("capture", ChannelSource { rx })
            .transform("decode", Passthrough::new())
            .transform("filter", Passthrough::new())
            .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        wait_until(|| sink.count.load(Ordering::SeqCst) == 2);

        // Simulate end of stream on the head queue only
        pipeline.queues[0].terminate();
        wait_until(|| pipeline.queues.iter().all(|q| q.is_terminated()));

        // The capture thread is still blocked in its source; release it
        drop(tx);
        let report = pipeline.join().unwrap();
        assert!(report.is_clean());
        assert_eq!(sink.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_is_idempotent_and_concurrent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source(
            "capture",
            EndlessSource {
                next: 0,
                drops: drops.clone(),
            },
        )
        .transform("decode", Passthrough::new())
        .transform("filter", Passthrough::new())
        .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();

        wait_until(|| !sink.ids().is_empty());

        let stoppers: Vec<_> = (0..8)
            .map(|_| {
                let handle = pipeline.handle();
                thread::spawn(move || handle.stop())
            })
            .collect();
        for stopper in stoppers {
            stopper.join().unwrap();
        }
        pipeline.stop();
        assert!(pipeline.state().is_stopping());

        let report = pipeline.join().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stages.len(), 4);
        assert_eq!(pipeline.live_threads(), 0);

        // Only even ids were of interest
        assert!(sink.ids().iter().all(|id| id % 2 == 0));

        // Every unit the source produced has been released, nothing twice
        let produced = pipeline.health().stage("capture").unwrap().received() as usize;
        assert_eq!(drops.load(Ordering::SeqCst), produced);

        // Stop after join is a no-op and a second join is rejected
        pipeline.stop();
        assert!(matches!(
            pipeline.join(),
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_zero_output_warmup_does_not_stall() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source("capture", FixedSource::new(20, drops.clone()))
            .transform("decode", SlowStart { warmup: 7, seen: 0 })
            .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        let report = pipeline.join().unwrap();

        assert!(report.is_clean());
        assert_eq!(sink.ids(), (8..=20).collect::<Vec<_>>());
        let decode = pipeline.health().stage("decode").unwrap();
        assert_eq!(decode.received(), 20);
        assert_eq!(decode.emitted(), 13);
        assert_eq!(drops.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_flush_delivers_buffered_outputs() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source("capture", FixedSource::new(4, drops.clone()))
            .transform("decode", Buffering { held: Vec::new() })
            .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        pipeline.join().unwrap();

        assert_eq!(sink.ids(), vec![1, 2, 3, 4]);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_sink_failure_forces_shutdown() {
        let drops = Arc::new(AtomicUsize::new(0));

        let topology = PipelineBuilder::from_source(
            "capture",
            EndlessSource {
                next: 0,
                drops: drops.clone(),
            },
        )
        .transform("decode", Passthrough::new())
        .sink("sink", FailingSink {
            written: 0,
            limit: 3,
        });
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();

        // No stop(): the failing sink has to bring the pipeline down itself
        let report = pipeline.join().unwrap();

        assert_eq!(report.outcome, Outcome::Forced);
        let sink = report.stages.iter().find(|s| s.name == "sink").unwrap();
        assert_eq!(sink.exit, StageExit::Failed);
        let capture = report.stages.iter().find(|s| s.name == "capture").unwrap();
        assert_eq!(capture.exit, StageExit::Completed);

        let produced = pipeline.health().stage("capture").unwrap().received() as usize;
        assert_eq!(drops.load(Ordering::SeqCst), produced);
    }

    #[test]
    fn test_repeated_transient_failures_become_fatal() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source("capture", FixedSource::new(50, drops.clone()))
            .transform("filter", AlwaysRejects)
            .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        let report = pipeline.join().unwrap();

        assert_eq!(report.outcome, Outcome::Forced);
        assert!(sink.ids().is_empty());
        let filter = pipeline.health().stage("filter").unwrap();
        assert_eq!(
            filter.failures(),
            u64::from(stages::MAX_CONSECUTIVE_FAILURES)
        );
        let produced = pipeline.health().stage("capture").unwrap().received() as usize;
        assert_eq!(drops.load(Ordering::SeqCst), produced);
    }

    #[test]
    fn test_panicking_stage_is_reported() {
        let (tx, rx) = mpsc::channel();

        let topology = PipelineBuilder::from_source("capture", ChannelSource { rx })
            .transform("decode", Passthrough::new())
            .sink("render", PanickingSink);
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();

        tx.send(1).unwrap();
        wait_until(|| pipeline.state() == PipelineState::Draining);
        drop(tx);

        let report = pipeline.join().unwrap();
        assert_eq!(report.outcome, Outcome::Forced);
        let render = report.stages.iter().find(|s| s.name == "render").unwrap();
        assert_eq!(render.exit, StageExit::Panicked);
    }

    #[test]
    fn test_signal_stops_pipeline() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();
        let signal = SignalOfStop::new();

        let topology = PipelineBuilder::from_source(
            "capture",
            EndlessSource {
                next: 0,
                drops: drops.clone(),
            },
        )
        .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, signal.clone());
        pipeline.start().unwrap();

        wait_until(|| !sink.ids().is_empty());
        signal.cancel();
        assert!(pipeline.state().is_stopping());

        let report = pipeline.join().unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_lifecycle_misuse() {
        let drops = Arc::new(AtomicUsize::new(0));
        let topology = PipelineBuilder::from_source("capture", FixedSource::new(1, drops))
            .sink("sink", CollectingSink::default());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());

        // Join before start is rejected
        assert!(matches!(
            pipeline.join(),
            Err(PipelineError::InvalidTransition { .. })
        ));

        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.start(),
            Err(PipelineError::InvalidTransition { .. })
        ));
        pipeline.join().unwrap();
        assert!(pipeline.start().is_err());
    }

    #[test]
    fn test_stop_before_start() {
        let drops = Arc::new(AtomicUsize::new(0));
        let topology = PipelineBuilder::from_source("capture", FixedSource::new(1, drops.clone()))
            .sink("sink", CollectingSink::default());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.start().is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_queue_warn_depth_applies_to_all_queues() {
        let drops = Arc::new(AtomicUsize::new(0));
        let topology = PipelineBuilder::from_source("capture", FixedSource::new(1, drops))
            .queue_warn_depth(4)
            .transform("decode", Passthrough::new())
            .transform("filter", Passthrough::new())
            .sink("sink", CollectingSink::default());

        // capture.out existed before the call, the other two were created after it
        assert_eq!(
            topology
                .queues
                .iter()
                .map(|q| (q.name().to_string(), q.next_warning()))
                .collect::<Vec<_>>(),
            vec![
                ("capture.out".to_string(), 4),
                ("decode.out".to_string(), 4),
                ("filter.out".to_string(), 4),
            ]
        );

        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        assert_eq!(pipeline.queue_depths().len(), 3);
        pipeline.start().unwrap();
        pipeline.join().unwrap();
    }

    #[test]
    fn test_default_warn_depth() {
        let drops = Arc::new(AtomicUsize::new(0));
        let topology = PipelineBuilder::from_source("capture", FixedSource::new(1, drops))
            .sink("sink", CollectingSink::default());
        assert_eq!(topology.queues[0].next_warning(), DEFAULT_QUEUE_WARN_DEPTH);

        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        pipeline.join().unwrap();
    }

    #[test]
    fn test_hard_decode_error_is_not_retried() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source("capture", FixedSource::new(20, drops.clone()))
            .transform("decode", BrokenDecoder)
            .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        let report = pipeline.join().unwrap();

        assert_eq!(report.outcome, Outcome::Forced);
        let decode = report.stages.iter().find(|s| s.name == "decode").unwrap();
        assert_eq!(decode.exit, StageExit::Failed);

        let health = pipeline.health().stage("decode").unwrap();
        assert_eq!(health.received(), 1);
        assert_eq!(health.failures(), 1);
        assert!(sink.ids().is_empty());

        let produced = pipeline.health().stage("capture").unwrap().received() as usize;
        assert_eq!(drops.load(Ordering::SeqCst), produced);
    }

    #[test]
    fn test_stop_during_push_leaves_nothing_behind() {
        let drops = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(Mutex::new(None));
        let sink = CollectingSink::default();

        let topology = PipelineBuilder::from_source(
            "capture",
            StopsBeforePush {
                next: 0,
                stop_at: 5,
                handle: handle.clone(),
                drops: drops.clone(),
            },
        )
        .transform("decode", Passthrough::new())
        .sink("sink", sink.clone());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        *handle.lock().unwrap() = Some(pipeline.handle());

        let report = pipeline.join().unwrap();

        assert!(report.is_clean());
        assert_eq!(report.discarded, 0);
        assert_eq!(sink.ids(), vec![1, 2, 3, 4]);

        let capture = pipeline.health().stage("capture").unwrap();
        assert_eq!(capture.received(), 5);
        assert_eq!(capture.emitted(), 4);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    #[should_panic(expected = "pipeline dropped while")]
    fn test_drop_while_running_asserts() {
        let (_tx, rx) = mpsc::channel::<u32>();
        let topology = PipelineBuilder::from_source("capture", ChannelSource { rx })
            .sink("sink", CountingSink::default());
        let mut pipeline = Pipeline::new(topology, SignalOfStop::new());
        pipeline.start().unwrap();
        drop(pipeline);
    }
}
