//! A single TCP link to a bulb.
//!
//! Each connection runs as one task that polls a send half and a receive half
//! concurrently. The send half drains the connection's [`CommandQueue`] at the
//! pace its rate limiter allows; the receive half decodes replies and hands
//! them, together with the command they answer, to the owning bulb through an
//! event channel. Every task ends with exactly one [`ConnectionEvent::Dead`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::control_interface::command::Command;
use crate::error::{BulbError, Result};
use crate::queue::rate_limiter::RateMode;
use crate::queue::{Admission, CommandQueue, Dequeue, QueueConfig};
use crate::util::codec::{self, Decoder, Message};
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Closing gracefully: no new commands, flushing what is queued.
    Draining,
    Dead,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state_str = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Draining => "draining",
            ConnectionState::Dead => "dead",
        };
        write!(f, "{}", state_str)
    }
}

/// Per-connection knobs, taken from the owning bulb's configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub queue: QueueConfig,
    pub min_interval: Duration,
    pub burst_window: Duration,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub drain_grace: Duration,
}

/// What a connection reports to its owner.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Connected(Uuid),
    /// An inbound message. `command` is the command it answers, if any.
    Message {
        connection: Uuid,
        command: Option<Command>,
        message: Message,
    },
    /// Terminal. `error` is `None` after a graceful close.
    Dead {
        connection: Uuid,
        error: Option<BulbError>,
    },
}

struct InFlight {
    command: Command,
    sent_at: Instant,
}

struct Shared {
    id: Uuid,
    label: String,
    state: Mutex<ConnectionState>,
    queue: Mutex<CommandQueue>,
    pending: Mutex<HashMap<u32, InFlight>>,
    /// Something was queued, or the connection started draining.
    wake: Notify,
    /// A command was put in flight.
    tracked: Notify,
    closing: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn next_expiry(&self, response_timeout: Duration) -> Option<Instant> {
        lock(&self.pending)
            .values()
            .map(|f| f.sent_at + response_timeout)
            .min()
    }

    fn expire_pending(&self, now: Instant, response_timeout: Duration) {
        lock(&self.pending).retain(|id, in_flight| {
            let alive = in_flight.sent_at + response_timeout > now;
            if !alive {
                warn!(
                    "{}: no reply to command {} within {:?}, dropping it",
                    self.label, id, response_timeout
                );
            }
            alive
        });
    }
}

/// Handle to one link. The link itself lives in a spawned task.
pub struct Connection {
    shared: Arc<Shared>,
    addr: Option<SocketAddr>,
}

impl Connection {
    fn new(label: &str, settings: &ConnectionSettings, addr: Option<SocketAddr>) -> Self {
        Connection {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                label: label.to_string(),
                state: Mutex::new(ConnectionState::Disconnected),
                queue: Mutex::new(CommandQueue::new(
                    settings.queue,
                    settings.min_interval,
                    settings.burst_window,
                )),
                pending: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                tracked: Notify::new(),
                closing: Notify::new(),
            }),
            addr,
        }
    }

    /// Starts connecting to `addr` after `delay`.
    pub(crate) fn open(
        handle: &Handle,
        label: &str,
        addr: SocketAddr,
        settings: ConnectionSettings,
        delay: Duration,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let connection = Connection::new(label, &settings, Some(addr));
        connection.shared.set_state(ConnectionState::Connecting);
        let shared = connection.shared.clone();
        handle.spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let connected = tokio::select! {
                result = timeout(settings.connect_timeout, TcpStream::connect(addr)) => result,
                _ = shared.closing.notified() => {
                    finish(&shared, &events, Ok(()));
                    return;
                }
            };
            let stream = match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let error = BulbError::Connect {
                        addr,
                        message: e.to_string(),
                    };
                    finish(&shared, &events, Err(error));
                    return;
                }
                Err(_) => {
                    let error = BulbError::ConnectTimeout {
                        addr,
                        timeout: settings.connect_timeout,
                    };
                    finish(&shared, &events, Err(error));
                    return;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("{}: could not set TCP_NODELAY: {}", shared.label, e);
            }
            info!("{}: connected to {}", shared.label, addr);
            run_session(stream, shared, settings, events).await;
        });
        connection
    }

    /// Runs a session over an already established stream.
    #[cfg(test)]
    pub(crate) fn with_stream<S>(
        handle: &Handle,
        label: &str,
        stream: S,
        settings: ConnectionSettings,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Connection::new(label, &settings, None);
        connection.shared.set_state(ConnectionState::Connecting);
        let shared = connection.shared.clone();
        handle.spawn(run_session(stream, shared, settings, events));
        connection
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn rate_mode(&self) -> RateMode {
        lock(&self.shared.queue).mode(Instant::now())
    }

    /// Hands a command to this connection's queue.
    pub fn enqueue(&self, command: Command) -> Result<Admission> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Draining => return Err(BulbError::Draining),
            _ => {
                return Err(BulbError::NotReady {
                    device_id: self.shared.label.clone(),
                })
            }
        }
        let admission = lock(&self.shared.queue).enqueue(command, Instant::now())?;
        if let Admission::Evicted(evicted) = &admission {
            debug!(
                "{}: command {} evicted from the queue",
                self.shared.label, evicted.id
            );
        }
        self.shared.wake.notify_one();
        Ok(admission)
    }

    /// Stops accepting commands and closes once the queue is flushed or the
    /// grace period is over. Does not wait for either.
    pub fn close(&self) {
        let mut state = lock(&self.shared.state);
        match *state {
            ConnectionState::Draining | ConnectionState::Dead => return,
            _ => *state = ConnectionState::Draining,
        }
        drop(state);
        debug!("{}: draining connection {}", self.shared.label, self.shared.id);
        self.shared.closing.notify_one();
        self.shared.wake.notify_one();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_session<S>(
    stream: S,
    shared: Arc<Shared>,
    settings: ConnectionSettings,
    events: UnboundedSender<ConnectionEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let draining = {
        let mut state = lock(&shared.state);
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
            false
        } else {
            true
        }
    };
    if !draining {
        let _ = events.send(ConnectionEvent::Connected(shared.id));
    }

    let (reader, writer) = tokio::io::split(stream);
    let result = tokio::select! {
        result = receive_loop(reader, &shared, &settings, &events) => result,
        result = send_loop(writer, &shared) => result,
        _ = drain_timer(&shared, settings.drain_grace) => Ok(()),
    };
    finish(&shared, &events, result);
}

/// Marks the connection dead, discards everything it still holds and
/// notifies the owner.
fn finish(shared: &Shared, events: &UnboundedSender<ConnectionEvent>, result: Result<()>) {
    shared.set_state(ConnectionState::Dead);
    let queued = lock(&shared.queue).clear().len();
    let in_flight = lock(&shared.pending).drain().count();
    let error = match result {
        Ok(()) => {
            info!("{}: connection {} closed", shared.label, shared.id);
            None
        }
        Err(e) => {
            warn!("{}: connection {} died: {}", shared.label, shared.id, e);
            Some(e)
        }
    };
    if queued + in_flight > 0 {
        warn!(
            "{}: discarding {} queued and {} unanswered commands",
            shared.label, queued, in_flight
        );
    }
    let _ = events.send(ConnectionEvent::Dead {
        connection: shared.id,
        error,
    });
}

async fn send_loop<S: AsyncWrite>(mut writer: WriteHalf<S>, shared: &Shared) -> Result<()> {
    loop {
        let now = Instant::now();
        let step = lock(&shared.queue).dequeue_ready(now);
        match step {
            Dequeue::Ready(commands) => {
                for command in commands {
                    let frame = codec::encode(command.id, &command.payload)?;
                    debug!(
                        "{}: sending {} ({})",
                        shared.label, command.id, command.payload.method
                    );
                    // Track before writing so a fast reply always finds it.
                    lock(&shared.pending).insert(
                        command.id,
                        InFlight {
                            command,
                            sent_at: now,
                        },
                    );
                    shared.tracked.notify_one();
                    writer.write_all(&frame).await?;
                }
                writer.flush().await?;
            }
            Dequeue::Wait(at) => {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            Dequeue::Idle => {
                if shared.state() == ConnectionState::Draining {
                    return Ok(());
                }
                let burst_deadline = lock(&shared.queue).limiter_mut().burst_deadline();
                match burst_deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = sleep_until(at) => {
                                lock(&shared.queue).limiter_mut().expire(Instant::now());
                            }
                            _ = shared.wake.notified() => {}
                        }
                    }
                    None => shared.wake.notified().await,
                }
            }
        }
    }
}

async fn receive_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    shared: &Shared,
    settings: &ConnectionSettings,
    events: &UnboundedSender<ConnectionEvent>,
) -> Result<()> {
    let mut decoder = Decoder::new();
    loop {
        let expiry = shared.next_expiry(settings.response_timeout);
        let read = tokio::select! {
            read = reader.read_buf(decoder.buffer_mut()) => read?,
            _ = sleep_until_opt(expiry) => {
                shared.expire_pending(Instant::now(), settings.response_timeout);
                continue;
            }
            _ = shared.tracked.notified() => continue,
        };
        if read == 0 {
            return Err(BulbError::transport("peer closed the connection"));
        }
        for message in decoder.drain_messages()? {
            let command = match &message {
                Message::Response(response) => {
                    let command = lock(&shared.pending)
                        .remove(&response.id)
                        .map(|in_flight| in_flight.command);
                    if command.is_none() {
                        debug!(
                            "{}: {}",
                            shared.label,
                            BulbError::CorrelationMismatch(response.id)
                        );
                    }
                    command
                }
                Message::Notification(_) => None,
            };
            let _ = events.send(ConnectionEvent::Message {
                connection: shared.id,
                command,
                message,
            });
        }
    }
}

async fn drain_timer(shared: &Shared, grace: Duration) {
    shared.closing.notified().await;
    sleep(grace).await;
    info!("{}: drain grace period of {:?} is over", shared.label, grace);
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
