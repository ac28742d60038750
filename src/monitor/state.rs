//! Monitor lifecycle transitions.
//!
//! ```text
//! monitoring ──trigger──▶ triggered ──report──▶ reported
//!      │                                          ▲
//!      └─────mature────▶ matured ───report────────┘
//!
//! reset (admin only): triggered | reported ──▶ monitoring
//! ```

use crate::models::MonitorState;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Trigger,
    Mature,
    Report,
    Reset,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Trigger => "trigger",
            Transition::Mature => "mature",
            Transition::Report => "report",
            Transition::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: MonitorState,
    pub transition: Transition,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} a monitor in state {}",
            self.transition.as_str(),
            self.from
        )
    }
}

impl std::error::Error for TransitionError {}

pub fn next_state(
    from: MonitorState,
    transition: Transition,
) -> Result<MonitorState, TransitionError> {
    use MonitorState::*;

    let to = match (from, transition) {
        (Monitoring, Transition::Trigger) => Triggered,
        (Monitoring, Transition::Mature) => Matured,
        (Triggered | Matured, Transition::Report) => Reported,
        (Triggered | Reported, Transition::Reset) => Monitoring,
        _ => return Err(TransitionError { from, transition }),
    };
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use MonitorState::*;

    const TRANSITIONS: [Transition; 4] = [
        Transition::Trigger,
        Transition::Mature,
        Transition::Report,
        Transition::Reset,
    ];

    #[test]
    fn test_happy_paths() {
        assert_eq!(next_state(Monitoring, Transition::Trigger), Ok(Triggered));
        assert_eq!(next_state(Monitoring, Transition::Mature), Ok(Matured));
        assert_eq!(next_state(Triggered, Transition::Report), Ok(Reported));
        assert_eq!(next_state(Matured, Transition::Report), Ok(Reported));
    }

    #[test]
    fn test_triggered_never_matures() {
        assert!(next_state(Triggered, Transition::Mature).is_err());
        assert!(next_state(Matured, Transition::Trigger).is_err());
    }

    #[test]
    fn test_reported_only_via_triggered_or_matured() {
        for from in MonitorState::ALL {
            let ok = next_state(from, Transition::Report).is_ok();
            assert_eq!(ok, from.awaiting_report(), "{from}");
        }
    }

    #[test]
    fn test_reset_scope() {
        assert_eq!(next_state(Reported, Transition::Reset), Ok(Monitoring));
        assert_eq!(next_state(Triggered, Transition::Reset), Ok(Monitoring));
        assert!(next_state(Monitoring, Transition::Reset).is_err());
        assert!(next_state(Matured, Transition::Reset).is_err());
    }

    #[test]
    fn test_reported_is_terminal_except_reset() {
        for t in TRANSITIONS {
            let res = next_state(Reported, t);
            if t == Transition::Reset {
                assert!(res.is_ok());
            } else {
                assert_eq!(
                    res,
                    Err(TransitionError {
                        from: Reported,
                        transition: t
                    })
                );
            }
        }
    }
}
