/// §4.6. Opens a recv connection and registers the zero packageId to catch
/// hello envelopes; every envelope spawns a queued `PreConduit`, matched one
/// at a time against `accept()` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    ConnectionOpen,
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
        (Listening | ConnectionOpen, Event::Close) => Closing,
        (Closing, Event::Closed) => Finished,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
