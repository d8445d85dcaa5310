/// §4.8. Like `dial` but negotiates addresses on an initial channel first,
/// then detaches the initial connections and finishes the conduit on the
/// final channel. Per the design note (§9), the initial connections are
/// detached only after the final connection is confirmed `OPEN`, to avoid
/// losing packages that arrive late on the initial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    InitialConnected,
    HelloSent,
    WaitingForConnections,
    FinalConnected,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    InitialConnConnected,
    HelloSent,
    FinalConnConnected,
    AllConnectionsOpen,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::InitialConnConnected) => InitialConnected,
        (InitialConnected, Event::HelloSent) => HelloSent,
        (HelloSent, Event::FinalConnConnected) => WaitingForConnections,
        (WaitingForConnections, Event::FinalConnConnected) => WaitingForConnections,
        (WaitingForConnections, Event::AllConnectionsOpen) => FinalConnected,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
