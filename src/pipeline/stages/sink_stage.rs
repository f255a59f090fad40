//! Sink stage: the tail of the pipeline

use log::{error, info, warn};
use std::sync::Arc;

use super::{FailureStreak, StageContext, StageExit};
use crate::pipeline::queue::StageQueue;
use crate::pipeline::stage::Sink;
use crate::pipeline::types::MediaUnit;

pub(crate) fn run_sink<K: Sink>(
    mut sink: K,
    input: Arc<StageQueue<MediaUnit<K::Unit>>>,
    ctx: StageContext,
) -> StageExit {
    info!("SinkStage[{}]: started", ctx.name());

    let mut streak = FailureStreak::default();
    let mut exit = StageExit::Completed;

    while let Some(unit) = input.wait_and_pop() {
        ctx.health().record_received();
        let sequence = unit.sequence();

        match sink.consume(unit.into_payload()) {
            Ok(()) => {
                streak.reset();
                ctx.health().record_emitted(1);
            }
            Err(e) if e.is_transient() => {
                ctx.health().record_failure();
                ctx.health().record_skipped();
                let give_up = streak.bump();
                warn!(
                    "SinkStage[{}]: unit #{}: {} ({} in a row)",
                    ctx.name(),
                    sequence,
                    e,
                    streak.count()
                );
                if give_up {
                    error!(
                        "SinkStage[{}]: too many consecutive failures, giving up",
                        ctx.name()
                    );
                    exit = StageExit::Failed;
                    break;
                }
            }
            Err(e) => {
                ctx.health().record_failure();
                error!("SinkStage[{}]: unit #{}: {}", ctx.name(), sequence, e);
                exit = StageExit::Failed;
                break;
            }
        }
    }

    // Close the output even after a failure so whatever was written stays readable
    if let Err(e) = sink.finish() {
        error!("SinkStage[{}]: finish failed: {}", ctx.name(), e);
        exit = StageExit::Failed;
    }
    if exit == StageExit::Failed {
        ctx.fail();
    }

    info!(
        "SinkStage[{}]: finished ({} units consumed)",
        ctx.name(),
        ctx.health().emitted()
    );
    exit
}
