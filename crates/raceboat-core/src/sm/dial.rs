/// §4.7. Opens recv first (to know its own address), then send; constructs
/// and sends the hello envelope; emits a Conduit handle immediately, with
/// `write` calls deferred by enqueueing until the send connection is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    RecvOpen,
    SendOpen,
    HelloSent,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    RecvConnConnected,
    SendConnConnected,
    HelloSent,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::RecvConnConnected) => RecvOpen,
        (RecvOpen, Event::SendConnConnected) => SendOpen,
        (SendOpen, Event::HelloSent) => HelloSent,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
