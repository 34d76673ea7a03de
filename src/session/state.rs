//! Session lifecycle states.

use std::fmt;

/// Lifecycle of a session.
///
/// States only move forward: `Connecting -> Negotiating -> Open -> Closing ->
/// Closed`, with `Closing` reachable from every state before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Negotiating,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Closed, Closing, Connecting, Negotiating, Open};
        matches!(
            (self, next),
            (Connecting, Negotiating)
                | (Negotiating, Open)
                | (Connecting | Negotiating | Open, Closing)
                | (Closing, Closed)
        )
    }

    /// `Closing` or `Closed`.
    #[must_use]
    pub fn is_closing(self) -> bool { self >= SessionState::Closing }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::SessionState::{self, *};

    #[rstest]
    #[case(Connecting, Negotiating, true)]
    #[case(Negotiating, Open, true)]
    #[case(Negotiating, Closing, true)]
    #[case(Open, Closing, true)]
    #[case(Closing, Closed, true)]
    #[case(Open, Negotiating, false)]
    #[case(Open, Closed, false)]
    #[case(Closed, Closing, false)]
    #[case(Closing, Closing, false)]
    fn transitions(#[case] from: SessionState, #[case] to: SessionState, #[case] legal: bool) {
        assert_eq!(from.can_transition_to(to), legal);
    }
}
