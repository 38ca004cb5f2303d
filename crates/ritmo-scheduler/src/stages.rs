//! Stage state machine: which follow-up stage a quote is in once one of its
//! events resolves.

use ritmo_core::types::{BusinessStatus, EventType, RitmoStage};

/// Stage reached after `event` resolves successfully (sent or completed).
pub fn stage_after(event: EventType) -> RitmoStage {
    match event {
        EventType::EmailD1 => RitmoStage::FupD3,
        EventType::EmailD3 => RitmoStage::FupD7,
        EventType::CallD7 => RitmoStage::FupD14,
        EventType::EmailD14 => RitmoStage::Completed,
    }
}

/// Apply the cascade to a quote's current state.
///
/// Returns the new stage, or `None` when nothing changes: the quote is no
/// longer `sent`, the current stage is terminal, or the mapped stage would
/// move the quote backwards (a late automatic send after an earlier step was
/// completed by hand).
pub fn advance(
    business_status: BusinessStatus,
    current: RitmoStage,
    resolved: EventType,
) -> Option<RitmoStage> {
    if !business_status.is_followable() || current.is_terminal() {
        return None;
    }
    let next = stage_after(resolved);
    match (current.sequence_rank(), next.sequence_rank()) {
        (Some(cur), Some(nxt)) if nxt > cur => Some(next),
        _ => None,
    }
}
