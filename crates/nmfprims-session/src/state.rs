//! Channel lifecycle as a single state enum with one transition table.

/// Lifecycle state of a duplex session channel.
///
/// ```text
/// Open ──BeginOutputClose──► OutputClosing ──OutputShutdown──► OutputClosed
///   │                             │                                │
///   InputEnded                    InputEnded                       InputEnded
///   ▼                             ▼                                ▼
/// PeerClosed ─BeginOutputClose─► OutputClosing{input} ─OutputShutdown─► InputClosed ─Release─► Closed
/// ```
///
/// `Abort` moves any non-faulted state to `Closed`; `Fault` moves any
/// non-terminal state to `Faulted`. `Closed` and `Faulted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// The peer ended its output; we may still send.
    PeerClosed,
    /// Our `End` record is being written.
    OutputClosing { input_closed: bool },
    OutputClosed,
    /// Both directions have ended; the connection is not yet released.
    InputClosed,
    Closed,
    Faulted,
}

/// Inputs to [`SessionState::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    BeginOutputClose,
    OutputShutdown,
    InputEnded,
    Release,
    Abort,
    Fault,
}

impl SessionState {
    /// Next state for `event`, or `None` if the transition is illegal.
    pub fn on(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        Some(match (self, event) {
            (S::Faulted, _) => return None,
            (S::Closed, _) => return None,
            (_, E::Fault) => S::Faulted,
            (_, E::Abort) => S::Closed,

            (S::Open, E::BeginOutputClose) => S::OutputClosing {
                input_closed: false,
            },
            (S::PeerClosed, E::BeginOutputClose) => S::OutputClosing { input_closed: true },

            (S::OutputClosing { input_closed: false }, E::OutputShutdown) => S::OutputClosed,
            (S::OutputClosing { input_closed: true }, E::OutputShutdown) => S::InputClosed,

            (S::Open, E::InputEnded) => S::PeerClosed,
            (S::OutputClosing { input_closed: false }, E::InputEnded) => {
                S::OutputClosing { input_closed: true }
            }
            (S::OutputClosed, E::InputEnded) => S::InputClosed,

            (S::InputClosed, E::Release) => S::Closed,

            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::PeerClosed => "PeerClosed",
            Self::OutputClosing { .. } => "OutputClosing",
            Self::OutputClosed => "OutputClosed",
            Self::InputClosed => "InputClosed",
            Self::Closed => "Closed",
            Self::Faulted => "Faulted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }

    pub fn can_send(self) -> bool {
        matches!(self, Self::Open | Self::PeerClosed)
    }

    /// Whether the peer may still send us records.
    pub fn input_open(self) -> bool {
        matches!(
            self,
            Self::Open | Self::OutputClosing { input_closed: false } | Self::OutputClosed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
