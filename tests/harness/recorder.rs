//! Handler that records every callback
//!
//! Each connection gets a clone of the same [`Recorder`], so all events
//! of a server arrive on one channel in the order the callbacks ran.

use rai::{Command, ConnectionHandle, ConnectionInfo, Error, Handler, Mode, Session};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Delay before a [`Action::Later`] line is sent.
const LATER_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum Event {
    Connected(ConnectionInfo),
    /// Keyword and payload.
    Command(String, String),
    Data(Vec<u8>),
    /// The mode the connection is in when `on_ready` runs.
    Ready(Mode),
    Secure,
    /// The closure given to `start_tls_then` ran.
    Callback,
    Timeout,
    Error(Error),
    End,
    Handle(ConnectionHandle),
}

/// What a callback does with its session.
#[derive(Debug, Clone, Copy)]
pub enum Action {
    Send(&'static str),
    StartData,
    StartTls,
    /// STARTTLS with a completion closure that sends the line.
    StartTlsThen(&'static str),
    End,
    /// Send the line from a spawned task through a connection handle.
    Later(&'static str),
    /// Report a connection handle as [`Event::Handle`].
    ShareHandle,
}

/// Actions for a command; the flag is whether the connection is secure.
pub type Policy = fn(&Command, bool) -> Vec<Action>;

fn no_actions(_: &Command, _: bool) -> Vec<Action> {
    Vec::new()
}

#[derive(Clone)]
pub struct Recorder {
    events: UnboundedSender<Event>,
    policy: Policy,
    greeting: Vec<Action>,
    secured: Vec<Action>,
    ready: Vec<Action>,
    timeout: Vec<Action>,
}

impl Recorder {
    /// A recorder that greets with `220 Welcome` and otherwise stays
    /// silent, plus the receiving end of its event channel.
    pub fn new() -> (Self, UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let recorder = Self {
            events,
            policy: no_actions,
            greeting: vec![Action::Send("220 Welcome")],
            secured: Vec::new(),
            ready: Vec::new(),
            timeout: Vec::new(),
        };
        (recorder, rx)
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn greeting(mut self, actions: Vec<Action>) -> Self {
        self.greeting = actions;
        self
    }

    pub fn on_secure(mut self, actions: Vec<Action>) -> Self {
        self.secured = actions;
        self
    }

    pub fn on_ready(mut self, actions: Vec<Action>) -> Self {
        self.ready = actions;
        self
    }

    pub fn on_timeout(mut self, actions: Vec<Action>) -> Self {
        self.timeout = actions;
        self
    }

    fn emit(&self, event: Event) {
        // The test may have stopped listening.
        let _ = self.events.send(event);
    }

    fn perform(&self, session: &mut Session<'_>, actions: &[Action]) {
        for action in actions {
            match *action {
                Action::Send(line) => session.send(line),
                Action::StartData => session.start_data_mode(),
                Action::StartTls => session.start_tls(),
                Action::StartTlsThen(line) => {
                    let events = self.events.clone();
                    session.start_tls_then(move |session| {
                        let _ = events.send(Event::Callback);
                        session.send(line);
                    });
                }
                Action::End => session.end(),
                Action::ShareHandle => self.emit(Event::Handle(session.handle())),
                Action::Later(line) => {
                    let handle = session.handle();
                    tokio::spawn(async move {
                        tokio::time::sleep(LATER_DELAY).await;
                        handle.send(line).expect("connection still open");
                    });
                }
            }
        }
    }
}

impl Handler for Recorder {
    async fn on_connect(&mut self, session: &mut Session<'_>) {
        self.emit(Event::Connected(session.info()));
        self.perform(session, &self.greeting);
    }

    async fn on_command(&mut self, session: &mut Session<'_>, command: Command) {
        let actions = (self.policy)(&command, session.is_secure());
        self.emit(Event::Command(
            command.keyword().to_string(),
            command.payload_str(),
        ));
        self.perform(session, &actions);
    }

    async fn on_data(&mut self, _session: &mut Session<'_>, data: bytes::Bytes) {
        self.emit(Event::Data(data.to_vec()));
    }

    async fn on_ready(&mut self, session: &mut Session<'_>) {
        self.emit(Event::Ready(session.mode()));
        self.perform(session, &self.ready);
    }

    async fn on_secure(&mut self, session: &mut Session<'_>) {
        self.emit(Event::Secure);
        self.perform(session, &self.secured);
    }

    async fn on_timeout(&mut self, session: &mut Session<'_>) {
        self.emit(Event::Timeout);
        self.perform(session, &self.timeout);
    }

    async fn on_error(&mut self, _session: &mut Session<'_>, error: Error) {
        self.emit(Event::Error(error));
    }

    fn on_end(&mut self) {
        self.emit(Event::End);
    }
}
