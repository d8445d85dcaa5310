/// §4.8. Bridges a bootstrap hello into a long-lived conduit on the final
/// channel: opens the final-channel connections named in the hello, sends
/// (or awaits) the hello-response carrying this side's own final
/// addresses, waits for every non-null expected connection to reach
/// `OPEN`, then detaches the initial connections and finishes as a
/// `Conduit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Accepted,
    WaitingForConnections,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    Accept,
    FinalConnConnected,
    AllConnectionsOpen,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::Accept) => Accepted,
        (Accepted, Event::FinalConnConnected) => WaitingForConnections,
        (WaitingForConnections, Event::FinalConnConnected) => WaitingForConnections,
        (WaitingForConnections, Event::AllConnectionsOpen) => Finished,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
