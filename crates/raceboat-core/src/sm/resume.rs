/// §4.7. Opens both connections and directly constructs a Conduit without
/// exchanging a hello; used to restart a long-lived conversation across
/// process restarts given a previously-agreed `packageId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    SendOpen,
    RecvOpen,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    SendConnConnected,
    RecvConnConnected,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::SendConnConnected) => SendOpen,
        (Initial, Event::RecvConnConnected) => RecvOpen,
        (SendOpen, Event::RecvConnConnected) => Finished,
        (RecvOpen, Event::SendConnConnected) => Finished,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
