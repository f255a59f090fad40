//! Decode and filter stages
//!
//! Both stages share this body: pop one input, hand it to the collaborator,
//! push every output it reports, repeat. Zero outputs for an input is the
//! collaborator still buffering and is never treated as a stall.

use log::{error, info, trace, warn};
use std::sync::Arc;

use super::{FailureStreak, StageContext, StageExit};
use crate::pipeline::error::StageError;
use crate::pipeline::queue::StageQueue;
use crate::pipeline::stage::Transform;
use crate::pipeline::types::{MediaUnit, Sequencer};

pub(crate) fn run_transform<X: Transform>(
    mut transform: X,
    input: Arc<StageQueue<MediaUnit<X::Input>>>,
    output: Arc<StageQueue<MediaUnit<X::Output>>>,
    ctx: StageContext,
) -> StageExit {
    info!("TransformStage[{}]: started", ctx.name());

    let mut sequencer = Sequencer::new();
    let mut ready: Vec<X::Output> = Vec::new();
    let mut streak = FailureStreak::default();
    let mut exit = StageExit::Completed;

    while let Some(unit) = input.wait_and_pop() {
        ctx.health().record_received();
        let sequence = unit.sequence();

        let result = transform.process(unit.into_payload(), &mut ready);
        // Anything reported before a failure is still delivered
        emit(&output, &mut sequencer, &mut ready, &ctx);

        match result {
            Ok(()) => streak.reset(),
            Err(e) if e.is_transient() => {
                ctx.health().record_failure();
                ctx.health().record_skipped();
                let give_up = streak.bump();
                warn!(
                    "TransformStage[{}]: unit #{}: {} ({} in a row)",
                    ctx.name(),
                    sequence,
                    e,
                    streak.count()
                );
                if give_up {
                    error!(
                        "TransformStage[{}]: too many consecutive failures, giving up",
                        ctx.name()
                    );
                    exit = StageExit::Failed;
                    break;
                }
            }
            Err(e) => {
                ctx.health().record_failure();
                error!("TransformStage[{}]: unit #{}: {}", ctx.name(), sequence, e);
                exit = StageExit::Failed;
                break;
            }
        }
    }

    if exit == StageExit::Completed {
        exit = flush(&mut transform, &output, &mut sequencer, &mut ready, &ctx);
    }
    if exit == StageExit::Failed {
        ctx.fail();
    }
    output.terminate();

    info!(
        "TransformStage[{}]: finished ({} in, {} out)",
        ctx.name(),
        ctx.health().received(),
        sequencer.produced()
    );
    exit
}

fn flush<X: Transform>(
    transform: &mut X,
    output: &StageQueue<MediaUnit<X::Output>>,
    sequencer: &mut Sequencer,
    ready: &mut Vec<X::Output>,
    ctx: &StageContext,
) -> StageExit {
    let result = transform.flush(ready);
    emit(output, sequencer, ready, ctx);

    match result {
        Ok(()) => StageExit::Completed,
        Err(StageError::Transient(msg)) => {
            warn!("TransformStage[{}]: flush: {}", ctx.name(), msg);
            StageExit::Completed
        }
        Err(e) => {
            error!("TransformStage[{}]: flush failed: {}", ctx.name(), e);
            StageExit::Failed
        }
    }
}

fn emit<T>(
    output: &StageQueue<MediaUnit<T>>,
    sequencer: &mut Sequencer,
    ready: &mut Vec<T>,
    ctx: &StageContext,
) {
    if ready.is_empty() {
        return;
    }
    trace!(
        "TransformStage[{}]: pushing {} units",
        ctx.name(),
        ready.len()
    );
    ctx.health().record_emitted(ready.len() as u64);
    for item in ready.drain(..) {
        output.push(sequencer.wrap(item));
    }
}
