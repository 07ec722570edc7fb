//! What to do with a supervised worker, given whether it is still running
//! and what its output says.

use crate::worker::signal::{Marker, Signal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Still working.
    Wait,
    /// Hand off as dev-complete.
    Complete { result: Option<String> },
    Block { reason: String },
    Fail { reason: String },
    /// Exited without saying; ask the reviewer.
    ReviewThenDecide,
}

/// | running | signal                         | action           |
/// |---------|--------------------------------|------------------|
/// | yes     | none, heuristic, coordinator   | Wait             |
/// | yes     | explicit marker                | act on marker    |
/// | no      | explicit marker                | act on marker    |
/// | no      | heuristic, coordinator result  | Complete         |
/// | no      | none                           | ReviewThenDecide |
///
/// A running worker that already printed a marker is stuck at the end of
/// its run; the caller stops it.
pub fn decide(running: bool, signal: &Signal) -> Action {
    match (running, signal) {
        (_, Signal::Explicit(marker)) => from_marker(marker),
        (true, _) => Action::Wait,
        (false, Signal::Heuristic { .. }) => Action::Complete { result: None },
        (false, Signal::CoordinatorResult(result)) => Action::Complete {
            result: Some(result.to_string()),
        },
        (false, Signal::None) => Action::ReviewThenDecide,
    }
}

fn from_marker(marker: &Marker) -> Action {
    match marker {
        Marker::Complete { result } => Action::Complete {
            result: result.as_ref().map(ToString::to_string),
        },
        Marker::Blocked { reason } => Action::Block {
            reason: reason.clone(),
        },
        Marker::Failed { reason } => Action::Fail {
            reason: reason.clone(),
        },
    }
}
