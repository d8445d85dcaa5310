/// §4.5. Opens a recv connection and exposes incoming payloads through a
/// queue. `WaitingForAppAndPlugin` covers the case where neither a pending
/// `receive()` call nor a delivered package has arrived yet; the two
/// `WaitingFor*` states track whichever one side is still missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    ConnectionOpen,
    WaitingForAppAndPlugin,
    WaitingForApp,
    WaitingForPlugin,
    Received,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Event {
    ConnConnected,
    ReceiveRequested,
    PackageArrived,
    Delivered,
    Closed,
    StateMachineFailed,
}

pub fn transition(state: State, event: &Event) -> State {
    use State::*;
    match (state, event) {
        (Initial, Event::ConnConnected) => WaitingForAppAndPlugin,
        (WaitingForAppAndPlugin, Event::ReceiveRequested) => WaitingForPlugin,
        (WaitingForAppAndPlugin, Event::PackageArrived) => WaitingForApp,
        (WaitingForPlugin, Event::PackageArrived) => Received,
        (WaitingForApp, Event::ReceiveRequested) => Received,
        (Received, Event::Delivered) => WaitingForAppAndPlugin,
        (_, Event::Closed) => Finished,
        (_, Event::StateMachineFailed) => Failed,
        (other, _) => other,
    }
}
