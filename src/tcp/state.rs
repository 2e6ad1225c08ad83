use std::fmt;

/// Server-side TCP connection states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
    Closed,
}

impl State {
    /// Whether moving from `self` to `to` is a legal transition.
    ///
    /// Abortive teardown (RST, hard stop) bypasses this table and assigns
    /// `Closed` directly.
    pub fn may_transition_to(self, to: State) -> bool {
        use State::*;
        match self {
            Closed => matches!(to, Listen | SynSent),
            Listen => matches!(to, SynReceived | SynSent | Listen),
            SynReceived => matches!(to, Established | FinWait1 | Closed),
            SynSent => matches!(to, SynReceived | Established | Closed),
            Established => matches!(to, CloseWait | FinWait1),
            FinWait1 => matches!(to, Closing | FinWait2 | TimeWait),
            FinWait2 => matches!(to, TimeWait),
            Closing => matches!(to, TimeWait),
            CloseWait => matches!(to, LastAck),
            LastAck => matches!(to, Closed),
            // TIME-WAIT is only left when the stop timer fires.
            TimeWait => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let txt = match self {
            State::Listen => "LISTEN",
            State::SynSent => "SYN-SENT",
            State::SynReceived => "SYN-RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN-WAIT-1",
            State::FinWait2 => "FIN-WAIT-2",
            State::CloseWait => "CLOSE-WAIT",
            State::LastAck => "LAST-ACK",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME-WAIT",
            State::Closed => "CLOSED",
        };
        f.write_str(txt)
    }
}
