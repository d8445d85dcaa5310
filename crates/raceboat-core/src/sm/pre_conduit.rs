/// §4.6. Represents a received hello that has not yet been accepted. On
/// `accept`, starts a send-side connection to the hello's `linkAddress` on
/// `replyChannel`, then converts in place into a full `Conduit` context;
/// the listener's recv connection detaches from this context so the
/// Conduit can take ownership of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Accepted,
    Opening,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    Accept,
    SendConnConnected,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::Accept) => Accepted,
        (Accepted, Event::SendConnConnected) => Opening,
        (Opening, _) => Finished,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
