//! Per-worker control protocol, as seen from the supervisor.
//!
//! `step` is pure: it maps the current state and an event to the next state
//! and the action the supervisor must carry out. The supervisor owns all I/O.

use crate::protocol::ControlMessage;
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Process launched, no connection yet.
    #[default]
    Spawned,
    /// Connection accepted, waiting for `ready`.
    Connected,
    /// `monitor` sent, waiting for `monitoring`.
    Handshaking,
    Monitoring,
    /// `link_down` received, `link_up` being sent.
    LinkDownWait,
    Done,
}

impl WorkerState {
    pub fn is_done(self) -> bool {
        self == Self::Done
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Accepted,
    Message(ControlMessage),
    ReplySent,
    /// Supervisor is tearing the connection down.
    Terminated,
    /// Peer went away without `done`.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Reply(ControlMessage),
    /// Hand a report to the operator.
    Surface(StatsSnapshot),
    /// Print a line verbatim.
    Print(String),
    Close,
}

pub fn step(state: WorkerState, event: Event) -> (WorkerState, Action) {
    use WorkerState::*;

    match (state, event) {
        (Done, _) => (Done, Action::None),

        (_, Event::Message(ControlMessage::Done))
        | (_, Event::Terminated)
        | (_, Event::Disconnected) => (Done, Action::Close),

        (Spawned, Event::Accepted) => (Connected, Action::None),

        (Connected, Event::Message(ControlMessage::Ready { .. })) => {
            (Handshaking, Action::Reply(ControlMessage::Monitor))
        }
        // Anything but `ready` leaves the connection idle.
        (Connected, Event::Message(other)) => (Connected, Action::Print(other.display_text())),

        // The `monitoring` acknowledgement is taken on trust.
        (Handshaking, Event::Message(ControlMessage::Monitoring)) => (Monitoring, Action::None),
        (Handshaking, Event::Message(other)) => (Monitoring, Action::Print(other.display_text())),

        (Monitoring, Event::Message(ControlMessage::Report { snapshot })) => {
            (Monitoring, Action::Surface(snapshot))
        }
        (Monitoring, Event::Message(ControlMessage::LinkDown)) => {
            (LinkDownWait, Action::Reply(ControlMessage::LinkUp))
        }
        (Monitoring, Event::Message(other)) => (Monitoring, Action::Print(other.display_text())),

        (LinkDownWait, Event::ReplySent) => (Monitoring, Action::None),
        (LinkDownWait, Event::Message(other)) => {
            (LinkDownWait, Action::Print(other.display_text()))
        }

        (state, _) => (state, Action::None),
    }
}
