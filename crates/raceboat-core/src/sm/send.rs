/// §4.5. Fire-and-forget send: one dependent connection, one package, then
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    ConnectionOpen,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    ConnConnected,
    PackageSent,
    PackageFailed,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::ConnConnected) => ConnectionOpen,
        (ConnectionOpen, Event::PackageSent) => Finished,
        (ConnectionOpen, Event::PackageFailed | Event::StateMachineFailed) => Failed,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
