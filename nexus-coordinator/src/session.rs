//! Per-endpoint session decision table.
//!
//! Evaluated once per report with the endpoint's previous label, the newly
//! reported label and whether an active session is recorded. First match wins:
//!
//! | previous        | new              | transition                          |
//! |-----------------|------------------|-------------------------------------|
//! | none / Idle     | non-idle         | Start                               |
//! | X               | X (non-idle)     | Accrue, or Start if none is active  |
//! | X (non-idle)    | Idle or Y != X   | End (then Start Y if non-idle)      |
//! | none / Idle     | Idle             | Noop                                |

use nexus_protocol::is_idle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Accrue,
    End { successor: Option<String> },
    Noop,
}

pub fn decide(previous: Option<&str>, new_label: &str, has_active_session: bool) -> Transition {
    let previous_idle = previous.map_or(true, is_idle);
    let new_idle = is_idle(new_label);

    match (previous_idle, new_idle) {
        (true, false) => Transition::Start,
        (true, true) => Transition::Noop,
        (false, _) if previous == Some(new_label) => {
            if has_active_session {
                Transition::Accrue
            } else {
                // lost session record, heal by opening a fresh one
                Transition::Start
            }
        }
        (false, true) => Transition::End { successor: None },
        (false, false) => Transition::End {
            successor: Some(new_label.to_string()),
        },
    }
}
