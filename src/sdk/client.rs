use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::{ClientConfig, CompiledClientConfig, ConfigError};
use crate::messages::ActionCommand;
use crate::session::{Session, SessionAction, SessionError, SessionEvent};
use crate::transport::{Connector, SessionTransport, WebSocketConnector};

/// Events buffered per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long `disconnect` waits for the device to acknowledge the close before
/// the transport is dropped.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors emitted by the high-level client.
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// Configuration rejected while building the client.
    Config(ConfigError),
    /// Precondition failures from the session, e.g. sending before authentication.
    Session(SessionError),
    /// `connect` called while a previous connection loop is still running.
    AlreadyRunning,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Config(err) => write!(f, "config error: {}", err),
            ClientError::Session(err) => write!(f, "session error: {}", err),
            ClientError::AlreadyRunning => write!(f, "client is already connecting or connected"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err)
    }
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        ClientError::Session(err)
    }
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Terminate,
}

#[derive(Debug)]
enum DriverCommand {
    Outbound(Outbound),
    Close,
}

enum Flow {
    Continue,
    /// Transport finished closing on its own.
    Closed,
    Terminate,
}

/// State shared between the client handle and its supervising task.
struct Shared {
    config: CompiledClientConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    events: broadcast::Sender<SessionEvent>,
    commands: Mutex<Option<mpsc::UnboundedSender<DriverCommand>>>,
    auto_reconnect: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // no subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Publishes events immediately and returns the transport work in order.
    fn publish(&self, actions: Vec<SessionAction>) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for action in actions {
            match action {
                SessionAction::Send(frame) => match codec::encode_frame(&frame) {
                    Ok(text) => outbound.push(Outbound::Text(text)),
                    Err(err) => self.emit(SessionEvent::Error(err.into())),
                },
                SessionAction::Emit(event) => self.emit(event),
                SessionAction::Terminate => outbound.push(Outbound::Terminate),
            }
        }
        outbound
    }

    fn command(&self, command: DriverCommand) {
        let sent = self
            .commands
            .lock()
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false);
        if !sent {
            debug!("no connection task; command dropped");
        }
    }
}

/// Client for one Remootio device.
///
/// # Guarantees
/// * A single supervising task owns the websocket and runs the reconnect loop.
/// * Action calls return precondition failures synchronously; everything the
///   device does is reported through [`RemootioClient::subscribe`].
/// * Every connection attempt starts from an empty session and authenticates again.
pub struct RemootioClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RemootioClient {
    /// Builds a client that talks to the device over a websocket.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Builds a client over a caller-provided transport.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let config = config.compile()?;
        let session = Session::new(config.keys().clone(), config.keepalive_interval());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                connector,
                session: Mutex::new(session),
                events,
                commands: Mutex::new(None),
                auto_reconnect: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
            }),
            task: Mutex::new(None),
        })
    }

    /// Registers a new event listener.
    ///
    /// # Guarantees
    /// * Events arrive in the order the session produced them.
    /// * A subscriber more than [`EVENT_CHANNEL_CAPACITY`] events behind sees
    ///   `RecvError::Lagged` and skips ahead; other subscribers are unaffected.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// `true` while a transport is open, authenticated or not.
    pub fn is_connected(&self) -> bool {
        self.shared.session.lock().is_connected()
    }

    /// `true` once the session key has been confirmed by a `QUERY` round trip.
    pub fn is_authenticated(&self) -> bool {
        self.shared.session.lock().is_authenticated()
    }

    /// Latest action id acknowledged by the device, `None` before a challenge.
    pub fn last_action_id(&self) -> Option<u32> {
        self.shared.session.lock().last_action_id()
    }

    /// Starts the connection loop in the background. Must be called inside a
    /// tokio runtime.
    ///
    /// With `auto_reconnect` every close, including keepalive failures, is
    /// followed by a fresh attempt after the configured delay.
    pub fn connect(&self, auto_reconnect: bool) -> Result<(), ClientError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(ClientError::AlreadyRunning);
        }
        self.shared
            .auto_reconnect
            .store(auto_reconnect, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.commands.lock() = Some(tx);
        *task = Some(tokio::spawn(supervise(self.shared.clone(), rx, cancel)));
        Ok(())
    }

    /// Disables reconnects and asks the transport to close.
    ///
    /// Returns immediately; a `Disconnect` event follows once the close completes.
    pub fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.shared.cancel.lock().cancel();
        self.shared.command(DriverCommand::Close);
    }

    /// Resolves once the connection loop has exited.
    pub async fn wait_closed(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(%err, "connection task ended abnormally");
            }
        }
    }

    /// Sends `AUTH`. Only needed when `authenticate_on_connect` is disabled.
    ///
    /// # Errors
    /// Returns [`ClientError::Session`] wrapping:
    /// * [`SessionError::NotConnected`] if no transport is open.
    pub fn authenticate(&self) -> Result<(), ClientError> {
        self.run(Session::authenticate)
    }

    /// Sends `HELLO`; the reply arrives as an incoming `SERVER_HELLO` message.
    ///
    /// # Errors
    /// Returns [`ClientError::Session`] wrapping:
    /// * [`SessionError::NotConnected`] if no transport is open.
    pub fn send_hello(&self) -> Result<(), ClientError> {
        self.run(Session::hello)
    }

    /// Encrypts and sends one action under the session key.
    ///
    /// The device's answer is delivered as an incoming `response` payload;
    /// this call only reports whether the action could be sent.
    ///
    /// # Errors
    /// Returns [`ClientError::Session`] wrapping:
    /// * [`SessionError::NotConnected`] if no transport is open.
    /// * [`SessionError::NotAuthenticated`] before a challenge has been received.
    /// * [`SessionError::InvalidDuration`] for hold durations outside `1..=1440` minutes.
    pub fn send_action(&self, command: ActionCommand) -> Result<(), ClientError> {
        self.run(|session| session.send_action(command))
    }

    /// Asks for the current gate state (`QUERY`).
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`].
    pub fn send_query(&self) -> Result<(), ClientError> {
        self.send_action(ActionCommand::Query)
    }

    /// Pulses the main output (`TRIGGER`).
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`].
    pub fn send_trigger(&self) -> Result<(), ClientError> {
        self.send_action(ActionCommand::Trigger)
    }

    /// Pulses the secondary output (`TRIGGER_SECONDARY`).
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`].
    pub fn send_trigger_secondary(&self) -> Result<(), ClientError> {
        self.send_action(ActionCommand::TriggerSecondary)
    }

    /// Opens the gate (`OPEN`); needs a sensor on the device.
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`].
    pub fn send_open(&self) -> Result<(), ClientError> {
        self.send_action(ActionCommand::Open)
    }

    /// Closes the gate (`CLOSE`); needs a sensor on the device.
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`].
    pub fn send_close(&self) -> Result<(), ClientError> {
        self.send_action(ActionCommand::Close)
    }

    /// Restarts the device (`RESTART`).
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`].
    pub fn send_restart(&self) -> Result<(), ClientError> {
        self.send_action(ActionCommand::Restart)
    }

    /// Keeps the main output active for `minutes`.
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`], including
    /// [`SessionError::InvalidDuration`] when `minutes` is 0 or above 1440.
    pub fn hold_trigger_output_active(&self, minutes: u32) -> Result<(), ClientError> {
        self.send_action(ActionCommand::HoldTriggerOutputActive { minutes })
    }

    /// Keeps the secondary output active for `minutes`.
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`], including
    /// [`SessionError::InvalidDuration`] when `minutes` is 0 or above 1440.
    pub fn hold_trigger_secondary_output_active(&self, minutes: u32) -> Result<(), ClientError> {
        self.send_action(ActionCommand::HoldTriggerSecondaryOutputActive { minutes })
    }

    /// Keeps the open output active for `minutes`.
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`], including
    /// [`SessionError::InvalidDuration`] when `minutes` is 0 or above 1440.
    pub fn hold_open_output_active(&self, minutes: u32) -> Result<(), ClientError> {
        self.send_action(ActionCommand::HoldOpenOutputActive { minutes })
    }

    /// Keeps the close output active for `minutes`.
    ///
    /// # Errors
    /// Same as [`RemootioClient::send_action`], including
    /// [`SessionError::InvalidDuration`] when `minutes` is 0 or above 1440.
    pub fn hold_close_output_active(&self, minutes: u32) -> Result<(), ClientError> {
        self.send_action(ActionCommand::HoldCloseOutputActive { minutes })
    }

    fn run<F>(&self, op: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut Session) -> Result<Vec<SessionAction>, SessionError>,
    {
        let actions = {
            let mut session = self.shared.session.lock();
            op(&mut *session)?
        };
        for outbound in self.shared.publish(actions) {
            self.shared.command(DriverCommand::Outbound(outbound));
        }
        Ok(())
    }
}

impl Drop for RemootioClient {
    fn drop(&mut self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.shared.cancel.lock().cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// Reconnect loop. Each iteration is one connection attempt from a clean session.
async fn supervise(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    cancel: CancellationToken,
) {
    loop {
        let begin = shared.session.lock().begin_connect();
        match begin {
            Ok(actions) => {
                shared.publish(actions);
            }
            Err(err) => {
                warn!(%err, "cannot start connection attempt");
                shared.emit(SessionEvent::Error(err));
                break;
            }
        }
        // anything queued for a previous connection is stale
        while commands.try_recv().is_ok() {}

        let url = shared.config.url().to_string();
        let attempt = tokio::select! {
            _ = cancel.cancelled() => None,
            result = shared.connector.connect(&url) => Some(result),
        };
        match attempt {
            Some(Ok(transport)) => run_connection(&shared, transport, &mut commands).await,
            Some(Err(err)) => {
                warn!(%err, %url, "connection attempt failed");
                shared.emit(SessionEvent::Error(SessionError::Transport(err.to_string())));
            }
            None => debug!("connection attempt cancelled"),
        }

        let closed = shared.session.lock().on_closed();
        shared.publish(closed);

        if !shared.auto_reconnect.load(Ordering::SeqCst) || cancel.is_cancelled() {
            break;
        }
        let delay = shared.config.reconnect_delay();
        info!(delay = ?delay, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
    debug!("connection loop finished");
}

async fn run_connection(
    shared: &Shared,
    mut transport: Box<dyn SessionTransport>,
    commands: &mut mpsc::UnboundedReceiver<DriverCommand>,
) {
    let opened = shared.session.lock().on_open(Instant::now());
    let mut pending = shared.publish(opened);
    if shared.config.authenticate_on_connect() {
        let auth = shared.session.lock().authenticate();
        match auth {
            Ok(actions) => pending.extend(shared.publish(actions)),
            Err(err) => shared.emit(SessionEvent::Error(err)),
        }
    }
    if let Flow::Terminate = perform(shared, transport.as_mut(), pending).await {
        transport.terminate();
        return;
    }

    loop {
        let deadline = shared.session.lock().next_keepalive_deadline();
        let flow = tokio::select! {
            inbound = transport.recv() => match inbound {
                Some(Ok(text)) => {
                    let actions = shared.session.lock().handle_message(&text);
                    let outbound = shared.publish(actions);
                    perform(shared, transport.as_mut(), outbound).await
                }
                Some(Err(err)) => {
                    warn!(%err, "transport receive failed");
                    shared.emit(SessionEvent::Error(SessionError::Transport(err.to_string())));
                    Flow::Terminate
                }
                None => return,
            },
            command = commands.recv() => match command {
                Some(DriverCommand::Outbound(outbound)) => {
                    perform(shared, transport.as_mut(), vec![outbound]).await
                }
                Some(DriverCommand::Close) => {
                    shared.session.lock().begin_close();
                    debug!("closing transport");
                    match transport.close().await {
                        Ok(()) => drain_after_close(shared, transport.as_mut()).await,
                        Err(err) => {
                            shared.emit(SessionEvent::Error(SessionError::Transport(err.to_string())));
                            Flow::Terminate
                        }
                    }
                }
                None => Flow::Terminate,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let actions = shared.session.lock().poll_keepalive(Instant::now());
                let outbound = shared.publish(actions);
                perform(shared, transport.as_mut(), outbound).await
            }
        };
        match flow {
            Flow::Continue => {}
            Flow::Closed => return,
            Flow::Terminate => {
                transport.terminate();
                return;
            }
        }
    }
}

/// Reads until the peer finishes the close handshake, giving up after
/// [`CLOSE_TIMEOUT`]. Nothing is sent on a closing transport.
async fn drain_after_close(shared: &Shared, transport: &mut dyn SessionTransport) -> Flow {
    let deadline = Instant::now() + CLOSE_TIMEOUT;
    loop {
        match timeout_at(deadline, transport.recv()).await {
            Ok(Some(Ok(text))) => {
                let actions = shared.session.lock().handle_message(&text);
                let dropped = shared.publish(actions);
                if !dropped.is_empty() {
                    debug!(count = dropped.len(), "outbound work discarded while closing");
                }
            }
            Ok(Some(Err(err))) => {
                debug!(%err, "receive failed while closing");
                return Flow::Terminate;
            }
            Ok(None) => return Flow::Closed,
            Err(_) => {
                debug!(
                    timeout = ?CLOSE_TIMEOUT,
                    "close not acknowledged, dropping transport"
                );
                return Flow::Terminate;
            }
        }
    }
}

async fn perform(
    shared: &Shared,
    transport: &mut dyn SessionTransport,
    outbound: Vec<Outbound>,
) -> Flow {
    for item in outbound {
        match item {
            Outbound::Text(text) => {
                if let Err(err) = transport.send(text).await {
                    warn!(%err, "transport send failed");
                    shared.emit(SessionEvent::Error(SessionError::Transport(err.to_string())));
                    return Flow::Terminate;
                }
            }
            Outbound::Terminate => return Flow::Terminate,
        }
    }
    Flow::Continue
}
