use raceboat_plugin::RaceHandle;

/// §4.4. Reference-counted across dependents; the manager reuses an
/// existing context for a given `(channelId, linkAddress)` pair rather than
/// starting a second one (§8, invariant 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Activated,
    LinkEstablished,
    ConnectionOpen,
    Connected,
    Closing,
    ConnectionClosed,
    LinkClosed,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    ChannelActivated,
    LinkEstablished,
    ConnectionEstablished,
    /// The unconditional `ConnectionOpen -> Connected` step (§4.4 table,
    /// "ALWAYS" column).
    Always,
    AddDependent(RaceHandle),
    DetachDependent(RaceHandle),
    StateMachineFinished(RaceHandle),
    StateMachineFailed(RaceHandle),
    ReceivePackage,
    ConnClose,
    ConnectionDestroyed,
    LinkDestroyed,
    Fail,
}

/// Pure `(state, event) -> state` table from §4.4. `enter` side effects for
/// the resulting state live in `crate::manager`.
pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (_, Event::Fail) => Failed,
        (Initial, Event::ChannelActivated) => Activated,
        (Activated, Event::LinkEstablished) => LinkEstablished,
        (LinkEstablished, Event::ConnectionEstablished) => ConnectionOpen,
        (ConnectionOpen, _) => Connected,
        (
            Connected,
            Event::AddDependent(_)
            | Event::DetachDependent(_)
            | Event::StateMachineFinished(_)
            | Event::StateMachineFailed(_)
            | Event::ReceivePackage,
        ) => Connected,
        (Connected, Event::ConnClose) => Closing,
        (Closing, Event::ConnectionDestroyed) => ConnectionClosed,
        (ConnectionClosed, Event::LinkDestroyed) => LinkClosed,
        (other, _) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_connected() {
        let mut s = State::Initial;
        s = transition(s, &Event::ChannelActivated);
        s = transition(s, &Event::LinkEstablished);
        s = transition(s, &Event::ConnectionEstablished);
        assert_eq!(s, State::ConnectionOpen);
        s = transition(s, &Event::Always);
        assert_eq!(s, State::Connected);
    }

    #[test]
    fn empty_dependents_drains_to_link_closed() {
        let mut s = State::Connected;
        s = transition(s, &Event::ConnClose);
        assert_eq!(s, State::Closing);
        s = transition(s, &Event::ConnectionDestroyed);
        assert_eq!(s, State::ConnectionClosed);
        s = transition(s, &Event::LinkDestroyed);
        assert_eq!(s, State::LinkClosed);
    }

    #[test]
    fn fail_is_reachable_from_any_state() {
        assert_eq!(transition(State::Activated, &Event::Fail), State::Failed);
        assert_eq!(transition(State::Connected, &Event::Fail), State::Failed);
    }
}
