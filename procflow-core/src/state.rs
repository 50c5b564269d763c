use crate::types::NodeInstanceState;

// ── Node instance state machine ──
// Pending → Taken → Started → Complete        (structural auto-advance)
// Pending → Sent → Acknowledged → Taken → …   (activity dispatch)
// any non-terminal → Cancelled
// Pending → Skipped                           (starved join)
// (terminal states accept nothing)

/// Whether `from → to` is a legal node-instance transition.
///
/// The engine consults this table before every state write; an illegal pair
/// is rejected with `EngineError::IllegalTransition` instead of being
/// committed.
pub fn can_transition(from: NodeInstanceState, to: NodeInstanceState) -> bool {
    use NodeInstanceState::*;

    if from == to {
        return false;
    }
    match from {
        Pending => matches!(to, Sent | Taken | Cancelled | Skipped),
        // A worker may jump straight to Taken/Started/Complete if the
        // transport acknowledgment was lost.
        Sent => matches!(to, Acknowledged | Taken | Started | Complete | Failed | Cancelled),
        Acknowledged => matches!(to, Taken | Started | Complete | Failed | Cancelled),
        Taken => matches!(to, Started | Complete | Failed | Cancelled),
        Started => matches!(to, Complete | Failed | Cancelled),
        Complete | Failed | Cancelled | Skipped => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeInstanceState::*;

    #[test]
    fn structural_chain_is_legal() {
        assert!(can_transition(Pending, Taken));
        assert!(can_transition(Taken, Started));
        assert!(can_transition(Started, Complete));
    }

    #[test]
    fn dispatch_chain_is_legal() {
        assert!(can_transition(Pending, Sent));
        assert!(can_transition(Sent, Acknowledged));
        assert!(can_transition(Acknowledged, Taken));
        assert!(can_transition(Sent, Complete));
        assert!(can_transition(Sent, Failed));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [Complete, Failed, Cancelled, Skipped] {
            for target in [Pending, Sent, Taken, Started, Complete, Cancelled] {
                assert!(!can_transition(terminal, target));
            }
        }
    }

    #[test]
    fn no_backward_transitions() {
        assert!(!can_transition(Started, Taken));
        assert!(!can_transition(Taken, Sent));
        assert!(!can_transition(Acknowledged, Pending));
        assert!(!can_transition(Complete, Sent));
    }

    #[test]
    fn cancel_allowed_from_any_non_terminal() {
        for from in [Pending, Sent, Acknowledged, Taken, Started] {
            assert!(can_transition(from, Cancelled));
        }
    }
}
