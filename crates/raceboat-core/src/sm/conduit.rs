/// §4.6. A live bidirectional pair: a send connection, a recv connection,
/// and a 16-byte packageId filter. `Failed` is sticky but non-terminal:
/// per §7, a Conduit propagates mid-stream failures to subsequent
/// reads/writes while `close()` still reports `OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum Event {
    ReceivePackage,
    Write,
    PackageSent,
    PackageFailed,
    ConnectionFailed,
    Close,
    Closed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Open, Event::ReceivePackage | Event::Write | Event::PackageSent) => Open,
        (Open, Event::PackageFailed | Event::ConnectionFailed) => Failed,
        (Failed, Event::ReceivePackage | Event::Write) => Failed,
        (_, Event::Close) => Closed,
        (_, Event::Closed) => Closed,
        (other, _) => other,
    }
}
