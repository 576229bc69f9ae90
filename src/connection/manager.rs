use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{Backoff, ConnectionEvent, ConnectionState, Connector, FrameSink, Link};
use crate::errors::AppError;
use crate::models::{ClientRole, SessionInfo};
use crate::protocol::OutboundFrame;
use crate::timer::ScheduledTask;

/// Heartbeats are never sent more often than this.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub role: ClientRole,
    pub token: String,
    pub session_id: Option<String>,
    pub heartbeat_interval: Duration,
    /// Pause between AUTH and the subscription replay.
    pub auth_settle: Duration,
    pub backoff: Backoff,
}

enum Command {
    Connect,
    Close,
    Shutdown,
    Subscribe(String),
    Unsubscribe(String),
    SetSubscriptions(Vec<String>),
    Send(OutboundFrame),
    Deliver { frame: OutboundFrame, done: oneshot::Sender<bool> },
    SetSession { session_id: String, heartbeat_interval: Option<Duration> },
    SetToken(String),
    Opened { epoch: u64, result: Result<Link, AppError> },
    ReconnectDue { epoch: u64 },
    ReplayDue { epoch: u64 },
    Heartbeat { epoch: u64 },
}

/// Cheap, cloneable front door to the connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    role: ClientRole,
}

impl ConnectionHandle {
    /// Spawns the connection actor. Nothing is opened until [`connect`](Self::connect).
    pub fn spawn(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let role = settings.role;

        let actor = ConnectionActor {
            settings,
            connector,
            commands: cmd_tx.downgrade(),
            events: event_tx,
            state: state_tx,
            desired: false,
            attempt: 0,
            epoch: 0,
            targets: BTreeSet::new(),
            announced: BTreeSet::new(),
            ready: false,
            outbound: None,
            inbound: None,
            heartbeat: ScheduledTask::new(),
            reconnect: ScheduledTask::new(),
            replay: ScheduledTask::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { commands: cmd_tx, state: state_rx, role }, event_rx)
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    /// Opens the connection and keeps it open until [`close`](Self::close).
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Closes the transport and stops all reconnect attempts.
    pub fn close(&self) {
        self.command(Command::Close);
    }

    /// Closes the connection and stops the actor for good.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    pub fn subscribe(&self, conversation_id: impl Into<String>) {
        self.command(Command::Subscribe(conversation_id.into()));
    }

    pub fn unsubscribe(&self, conversation_id: impl Into<String>) {
        self.command(Command::Unsubscribe(conversation_id.into()));
    }

    /// Replaces the whole target subscription set.
    pub fn set_subscriptions<I, S>(&self, conversation_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = conversation_ids.into_iter().map(Into::into).collect();
        self.command(Command::SetSubscriptions(ids));
    }

    /// Applies a negotiated session: the id rides on the next AUTH and the
    /// heartbeat interval takes effect immediately.
    pub fn set_session(&self, session: &SessionInfo) {
        let heartbeat_interval = (session.heartbeat_interval_seconds > 0)
            .then(|| Duration::from_secs(session.heartbeat_interval_seconds));
        self.command(Command::SetSession {
            session_id: session.session_id.clone(),
            heartbeat_interval,
        });
    }

    /// Replaces the credential for the next AUTH and forgets the negotiated
    /// session, which belonged to the old credential.
    pub fn set_token(&self, token: impl Into<String>) {
        self.command(Command::SetToken(token.into()));
    }

    /// Best-effort send. Returns `false` if the frame was dropped because the
    /// connection is not open; dropped frames are never replayed.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!("Dropping {} frame while disconnected", frame.kind());
            return false;
        }
        self.commands.send(Command::Send(frame)).is_ok()
    }

    /// Like [`send`](Self::send), but resolves only once the actor has handed
    /// the frame to the transport. A transport whose peer has already gone
    /// away is torn down first, so `true` means the frame went out on a live
    /// transport.
    pub async fn deliver(&self, frame: OutboundFrame) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!("Dropping {} frame while disconnected", frame.kind());
            return false;
        }
        let (done, result) = oneshot::channel();
        if self.commands.send(Command::Deliver { frame, done }).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Connection actor for {} has stopped", self.role);
        }
    }
}

impl FrameSink for ConnectionHandle {
    fn send_frame(&self, frame: OutboundFrame) -> bool {
        self.send(frame)
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct ConnectionActor {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    /// Cleared only by an explicit close.
    desired: bool,
    attempt: u32,
    /// Bumped for every transport so late timer messages can be ignored.
    epoch: u64,
    targets: BTreeSet<String>,
    /// Conversations a SUB was sent for on the current transport.
    announced: BTreeSet<String>,
    ready: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: Option<mpsc::UnboundedReceiver<String>>,
    heartbeat: ScheduledTask,
    reconnect: ScheduledTask,
    replay: ScheduledTask,
}

impl ConnectionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            // Inbound first: a hang-up must be seen before any command queued after it.
            let next = tokio::select! {
                biased;
                frame = next_inbound(self.inbound.as_mut()) => Next::Inbound(frame),
                command = commands.recv() => Next::Command(command),
            };
            match next {
                Next::Inbound(Some(text)) => {
                    let _ = self.events.send(ConnectionEvent::Frame(text));
                }
                Next::Inbound(None) => {
                    info!("Transport for {} closed by peer", self.settings.role);
                    self.on_lost();
                }
                Next::Command(Some(Command::Shutdown)) | Next::Command(None) => {
                    self.close();
                    break;
                }
                Next::Command(Some(command)) => self.handle(command),
            }
        }
        debug!("Connection actor for {} stopped", self.settings.role);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Close | Command::Shutdown => self.close(),
            Command::Subscribe(id) => self.subscribe(id),
            Command::Unsubscribe(id) => self.unsubscribe(&id),
            Command::SetSubscriptions(ids) => self.set_subscriptions(ids),
            Command::Send(frame) => {
                if !self.transmit(&frame) {
                    debug!("Dropping {} frame: transport not open", frame.kind());
                }
            }
            Command::Deliver { frame, done } => {
                let sent = self.transmit(&frame);
                if !sent {
                    debug!("Dropping {} frame: transport not open", frame.kind());
                }
                let _ = done.send(sent);
            }
            Command::SetSession { session_id, heartbeat_interval } => {
                self.settings.session_id = Some(session_id);
                if let Some(interval) = heartbeat_interval {
                    self.settings.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
                    if self.outbound.is_some() {
                        self.start_heartbeat();
                    }
                }
            }
            Command::SetToken(token) => {
                self.settings.token = token;
                self.settings.session_id = None;
            }
            Command::Opened { epoch, result } => self.on_opened(epoch, result),
            Command::ReconnectDue { epoch } => {
                if self.desired && epoch == self.epoch && self.current() == ConnectionState::Disconnected {
                    self.open();
                }
            }
            Command::ReplayDue { epoch } => {
                if epoch == self.epoch {
                    self.replay_subscriptions();
                }
            }
            Command::Heartbeat { epoch } => {
                if epoch == self.epoch {
                    self.transmit(&OutboundFrame::Ping);
                }
            }
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state.send_replace(next) != next {
            let _ = self.events.send(ConnectionEvent::State(next));
        }
    }

    fn connect(&mut self) {
        if matches!(self.current(), ConnectionState::Connecting | ConnectionState::Connected) {
            debug!("connect() ignored: already {:?}", self.current());
            return;
        }
        self.desired = true;
        self.reconnect.cancel();
        self.open();
    }

    fn open(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.set_state(ConnectionState::Connecting);

        let connector = self.connector.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = connector.open().await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Opened { epoch, result });
            }
        });
    }

    fn on_opened(&mut self, epoch: u64, result: Result<Link, AppError>) {
        if epoch != self.epoch || !self.desired {
            debug!("Discarding transport opened after close");
            return;
        }
        match result {
            Ok(link) => self.on_open(link),
            Err(e) => {
                warn!("Failed to open transport for {}: {e}", self.settings.role);
                self.on_lost();
            }
        }
    }

    fn on_open(&mut self, link: Link) {
        let epoch = self.epoch;
        self.attempt = 0;
        self.ready = false;
        self.announced.clear();
        self.outbound = Some(link.outbound);
        self.inbound = Some(link.inbound);

        self.set_state(ConnectionState::Connected);
        info!("Connected as {}", self.settings.role);
        self.start_heartbeat();

        let auth = OutboundFrame::Auth {
            token: self.settings.token.clone(),
            client: self.settings.role,
            session_id: self.settings.session_id.clone(),
        };
        self.transmit(&auth);

        let commands = self.commands.clone();
        self.replay.start(self.settings.auth_settle, move || {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::ReplayDue { epoch });
            }
        });
    }

    fn start_heartbeat(&mut self) {
        let epoch = self.epoch;
        let commands = self.commands.clone();
        let period = self.settings.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        self.heartbeat.start_repeating(period, move || {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Heartbeat { epoch });
            }
        });
    }

    fn replay_subscriptions(&mut self) {
        if self.outbound.is_none() {
            return;
        }
        let pending: Vec<String> = self.targets.difference(&self.announced).cloned().collect();
        let count = pending.len();
        for id in pending {
            self.transmit(&OutboundFrame::Sub { conversation_id: id.clone() });
            self.announced.insert(id);
        }
        self.ready = true;
        debug!("Replayed {count} subscriptions");
        let _ = self.events.send(ConnectionEvent::Ready);
    }

    fn teardown_transport(&mut self) {
        self.heartbeat.cancel();
        self.replay.cancel();
        self.outbound = None;
        self.inbound = None;
        self.announced.clear();
        self.ready = false;
    }

    fn on_lost(&mut self) {
        self.teardown_transport();
        self.set_state(ConnectionState::Disconnected);
        if !self.desired {
            return;
        }
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.settings.backoff.delay(self.attempt);
        info!("Reconnecting in {delay:?} (attempt {})", self.attempt);

        let epoch = self.epoch;
        let commands = self.commands.clone();
        self.reconnect.start(delay, move || {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::ReconnectDue { epoch });
            }
        });
    }

    fn close(&mut self) {
        self.desired = false;
        self.attempt = 0;
        self.reconnect.cancel();
        self.epoch += 1;
        self.teardown_transport();
        self.set_state(ConnectionState::Disconnected);
    }

    fn subscribe(&mut self, id: String) {
        if !self.targets.insert(id.clone()) {
            return;
        }
        if self.ready && self.announced.insert(id.clone()) {
            self.transmit(&OutboundFrame::Sub { conversation_id: id });
        }
    }

    fn unsubscribe(&mut self, id: &str) {
        if !self.targets.remove(id) {
            return;
        }
        if self.announced.remove(id) {
            self.transmit(&OutboundFrame::Unsub { conversation_id: id.to_string() });
        }
    }

    fn set_subscriptions(&mut self, ids: Vec<String>) {
        let next: BTreeSet<String> = ids.into_iter().collect();
        if self.ready {
            let removed: Vec<String> = self.announced.difference(&next).cloned().collect();
            let added: Vec<String> = next.difference(&self.announced).cloned().collect();
            for id in removed {
                self.transmit(&OutboundFrame::Unsub { conversation_id: id.clone() });
                self.announced.remove(&id);
            }
            for id in added {
                self.transmit(&OutboundFrame::Sub { conversation_id: id.clone() });
                self.announced.insert(id);
            }
        }
        self.targets = next;
    }

    fn transmit(&self, frame: &OutboundFrame) -> bool {
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(e) => {
                warn!("Failed to encode {} frame: {e}", frame.kind());
                false
            }
        }
    }
}

enum Next {
    Inbound(Option<String>),
    Command(Option<Command>),
}

/// Next frame of the open transport; never resolves while there is none.
async fn next_inbound(inbound: Option<&mut mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
