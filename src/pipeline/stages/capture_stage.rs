//! Capture/demux stage
//!
//! Pulls compressed units from the source, keeps the stream of interest and
//! feeds the head queue. This is the only stage that polls the run flag; it
//! is also the one that starts the shutdown cascade.

use log::{debug, error, info, warn};
use std::sync::Arc;

use super::{FailureStreak, StageContext, StageExit};
use crate::pipeline::queue::StageQueue;
use crate::pipeline::stage::CaptureSource;
use crate::pipeline::types::{MediaUnit, Sequencer};

pub(crate) fn run_capture<S: CaptureSource>(
    mut source: S,
    output: Arc<StageQueue<MediaUnit<S::Unit>>>,
    ctx: StageContext,
) -> StageExit {
    info!("CaptureStage[{}]: started", ctx.name());

    let mut sequencer = Sequencer::new();
    let mut streak = FailureStreak::default();
    let mut exit = StageExit::Completed;

    while ctx.is_running() {
        match source.read_unit() {
            Ok(Some(unit)) => {
                ctx.health().record_received();
                streak.reset();

                // Stopped while blocked inside the source: the unit is dropped here
                if !ctx.is_running() {
                    debug!(
                        "CaptureStage[{}]: stop observed after read, dropping unit",
                        ctx.name()
                    );
                    ctx.health().record_skipped();
                    break;
                }
                if !source.wants(&unit) {
                    ctx.health().record_skipped();
                    continue;
                }

                // A stop can land between the flag check and here; the head
                // queue's own terminated flag is the final word
                if output.push_open(sequencer.wrap(unit)).is_err() {
                    debug!(
                        "CaptureStage[{}]: head queue closed, dropping unit",
                        ctx.name()
                    );
                    ctx.health().record_skipped();
                    break;
                }
                ctx.health().record_emitted(1);
            }
            Ok(None) => {
                info!("CaptureStage[{}]: end of stream", ctx.name());
                break;
            }
            Err(e) if e.is_transient() => {
                ctx.health().record_failure();
                let give_up = streak.bump();
                warn!(
                    "CaptureStage[{}]: {} ({} in a row)",
                    ctx.name(),
                    e,
                    streak.count()
                );
                if give_up {
                    error!(
                        "CaptureStage[{}]: too many consecutive read failures",
                        ctx.name()
                    );
                    exit = StageExit::Failed;
                    break;
                }
            }
            Err(e) => {
                ctx.health().record_failure();
                error!("CaptureStage[{}]: read failed: {}", ctx.name(), e);
                exit = StageExit::Failed;
                break;
            }
        }
    }

    if exit == StageExit::Failed {
        ctx.fail();
    } else {
        ctx.source_finished();
    }
    output.terminate();

    info!(
        "CaptureStage[{}]: finished ({} units read, {} forwarded)",
        ctx.name(),
        ctx.health().received(),
        ctx.health().emitted()
    );
    exit
}
