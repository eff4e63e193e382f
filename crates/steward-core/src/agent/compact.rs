//! History compaction
//!
//! When cumulative token usage crosses the configured threshold, the driver
//! asks the model service for a summary of the elidable prefix and replaces
//! it with a single `compress` block. Failure to summarize is non-fatal: the
//! pass logs and skips.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::model::{CallOptions, ModelMessage, ModelService};
use crate::session::MessageState;

use super::driver::LoopFlags;
use super::events::LoopEvent;

/// Messages always kept verbatim at the tail of the conversation.
const KEEP_RECENT_MESSAGES: usize = 4;

const SUMMARY_INSTRUCTION: &str = "Summarize the conversation so far for a \
continuation context: goals, decisions made, files touched, current state, \
and any unresolved problems. Be concise and factual.";

/// Run a compaction pass if the threshold is crossed. Never fails the turn.
pub(crate) async fn maybe_compact(
    model: &dyn ModelService,
    state: &mut MessageState,
    config: &AgentConfig,
    flags: &LoopFlags,
    event_tx: &mpsc::UnboundedSender<LoopEvent>,
) {
    if state.total_usage().total() < config.compact_threshold_tokens {
        return;
    }
    if state.messages().len() <= KEEP_RECENT_MESSAGES {
        return;
    }

    let elided = state.messages().len() - KEEP_RECENT_MESSAGES;
    flags.set_compressing(true);
    let _ = event_tx.send(LoopEvent::Compacting);

    let mut conversation = state.to_wire();
    conversation.push(ModelMessage::user_text(SUMMARY_INSTRUCTION));
    let options = CallOptions {
        model: config.model.clone(),
        system_prompt: None,
        tools: Vec::new(),
    };

    match model.call_text(conversation, &options).await {
        Ok(summary) => match state.apply_compaction(summary, elided) {
            Ok(()) => {
                info!(elided, "Compacted conversation history");
                let _ = event_tx.send(LoopEvent::CompactionDone {
                    elided_messages: elided,
                });
            }
            Err(e) => warn!("Failed to apply compaction: {e}"),
        },
        Err(e) => warn!("Compaction summarization failed, skipping: {e}"),
    }

    flags.set_compressing(false);
}
