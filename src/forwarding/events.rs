//! Per-forward state-change events, published on the generic [`crate::event::EventBus`].

use crate::config::ForwardRule;
use super::ForwardState;

/// Emitted whenever one forward's state changes.
#[derive(Debug, Clone)]
pub struct ForwardEvent {
    pub rule: ForwardRule,
    pub state: ForwardState,
    pub error_message: Option<String>,
}
