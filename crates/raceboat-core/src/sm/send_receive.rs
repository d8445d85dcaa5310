/// §4.5. Opens recv first, then send, sends the wrapped hello envelope
/// (§3) carrying the recv address, awaits exactly one response, then
/// terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    RecvOpen,
    SendOpen,
    WaitingForResponse,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    RecvConnConnected,
    SendConnConnected,
    HelloSent,
    ResponseReceived,
    PackageFailed,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::RecvConnConnected) => RecvOpen,
        (RecvOpen, Event::SendConnConnected) => SendOpen,
        (SendOpen, Event::HelloSent) => WaitingForResponse,
        (WaitingForResponse, Event::ResponseReceived) => Finished,
        (_, Event::PackageFailed | Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
