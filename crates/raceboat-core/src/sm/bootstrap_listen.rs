/// §4.8. Like `listen`, but the recv connection is on the initial channel;
/// every hello received there carries the peer's final-channel addresses
/// and spawns a `BootstrapPreConduit` instead of a plain `PreConduit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Listening,
    Closing,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    ConnConnected,
    HelloReceived,
    AcceptRequested,
    Close,
    Closed,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::ConnConnected) => Listening,
        (Listening, Event::HelloReceived | Event::AcceptRequested) => Listening,
        (Listening, Event::Close) => Closing,
        (Closing, Event::Closed) => Finished,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
