pub mod command;
pub mod connection;

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::config::deserialize_duration_millis;
use crate::error::{BulbError, Result};
use crate::queue::rate_limiter::{DEFAULT_BURST_WINDOW, DEFAULT_MIN_INTERVAL};
use crate::queue::{Admission, QueueConfig, QueuePolicy};
use crate::util::codec::{Message, Response};
use crate::util::discovery::{parse_property, DeviceIdentifier, PROPERTIES};
use crate::util::lock;
use crate::util::traits::Registry;
use command::{Command, Method, Payload, ResponseCallback};
use connection::{Connection, ConnectionEvent, ConnectionSettings, ConnectionState};

/// Bulbs accept at most this many simultaneous connections.
pub const MAX_CONNECTIONS: usize = 4;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Per-bulb settings. Must be final before [`Bulb::activate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BulbConfig {
    /// Number of TCP connections to open, 1 to [`MAX_CONNECTIONS`].
    pub connections: usize,
    pub queue: QueueConfig,
    #[serde(
        rename = "min_interval_ms",
        deserialize_with = "deserialize_duration_millis"
    )]
    pub min_interval: Duration,
    #[serde(
        rename = "burst_window_ms",
        deserialize_with = "deserialize_duration_millis"
    )]
    pub burst_window: Duration,
    #[serde(
        rename = "connect_timeout_ms",
        deserialize_with = "deserialize_duration_millis"
    )]
    pub connect_timeout: Duration,
    /// How many failed connects may be replaced over the bulb's lifetime.
    pub connect_attempts: u32,
    #[serde(
        rename = "response_timeout_ms",
        deserialize_with = "deserialize_duration_millis"
    )]
    pub response_timeout: Duration,
    #[serde(
        rename = "drain_grace_ms",
        deserialize_with = "deserialize_duration_millis"
    )]
    pub drain_grace: Duration,
    pub ipv6_prefix: Option<String>,
}

impl Default for BulbConfig {
    fn default() -> Self {
        BulbConfig {
            connections: 1,
            queue: QueueConfig::default(),
            min_interval: DEFAULT_MIN_INTERVAL,
            burst_window: DEFAULT_BURST_WINDOW,
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 2,
            response_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(2),
            ipv6_prefix: None,
        }
    }
}

impl BulbConfig {
    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue: self.queue,
            min_interval: self.min_interval,
            burst_window: self.burst_window,
            connect_timeout: self.connect_timeout,
            response_timeout: self.response_timeout,
            drain_grace: self.drain_grace,
        }
    }
}

/// Receives messages that do not answer a pending command.
pub type DefaultCallback = Arc<dyn Fn(&Bulb, &Message) + Send + Sync + 'static>;

type RetireHook = Box<dyn FnOnce(&Bulb) + Send + 'static>;

/// Hue and saturation with brightness as the value, as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Colour {
    pub hue: Option<i64>,
    pub saturation: Option<i64>,
    pub value: Option<i64>,
}

/// White mode settings, as last reported. Temperature is in kelvin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct White {
    pub brightness: Option<i64>,
    pub temperature: Option<i64>,
}

#[derive(Default)]
struct Multiplexer {
    activated: bool,
    closing: bool,
    registered: bool,
    retired: bool,
    connections: Vec<Connection>,
    cursor: usize,
    replacements_left: u32,
    /// Every address of the device, preferred first.
    addresses: Vec<SocketAddr>,
}

impl Multiplexer {
    /// Next connected link in round-robin order, skipping the others.
    fn next_connected(&mut self) -> Option<&Connection> {
        let count = self.connections.len();
        let index = (0..count)
            .map(|step| (self.cursor + step) % count)
            .find(|&index| self.connections[index].is_connected())?;
        self.cursor = (index + 1) % count;
        Some(&self.connections[index])
    }

    fn remove(&mut self, id: Uuid) -> Option<Connection> {
        let index = self.connections.iter().position(|c| c.id() == id)?;
        if index < self.cursor {
            self.cursor -= 1;
        }
        let connection = self.connections.remove(index);
        if self.cursor >= self.connections.len() {
            self.cursor = 0;
        }
        Some(connection)
    }

    /// The address to try after `failed`, wrapping around the list.
    fn address_after(&self, failed: Option<SocketAddr>) -> Option<SocketAddr> {
        let count = self.addresses.len();
        let index = failed
            .and_then(|failed| self.addresses.iter().position(|a| *a == failed))
            .map_or(0, |index| (index + 1) % count);
        self.addresses.get(index).copied()
    }
}

struct BulbInner {
    device: DeviceIdentifier,
    handle: Handle,
    registry: Option<Arc<dyn Registry>>,
    config: Mutex<BulbConfig>,
    mux: Mutex<Multiplexer>,
    seq: AtomicU32,
    properties: Mutex<BTreeMap<String, Value>>,
    default_callback: Mutex<Option<DefaultCallback>>,
    retire_hook: Mutex<Option<RetireHook>>,
}

/// One light bulb, reachable over up to four connections.
///
/// Cheap to clone; all clones refer to the same device. Commands are spread
/// round-robin over the connections that are up, which is a fairness policy
/// and not an ordering guarantee. Use a single connection when commands must
/// reach the device in submission order.
#[derive(Clone)]
pub struct Bulb {
    inner: Arc<BulbInner>,
}

impl Bulb {
    pub fn new(handle: Handle, device: DeviceIdentifier, registry: Option<Arc<dyn Registry>>) -> Self {
        Bulb::with_config(handle, device, BulbConfig::default(), registry)
    }

    pub fn with_config(
        handle: Handle,
        device: DeviceIdentifier,
        config: BulbConfig,
        registry: Option<Arc<dyn Registry>>,
    ) -> Self {
        let properties = device.properties.clone();
        let mut config = config;
        config.connections = config.connections.clamp(1, MAX_CONNECTIONS);
        Bulb {
            inner: Arc::new(BulbInner {
                device,
                handle,
                registry,
                config: Mutex::new(config),
                mux: Mutex::new(Multiplexer::default()),
                seq: AtomicU32::new(0),
                properties: Mutex::new(properties),
                default_callback: Mutex::new(None),
                retire_hook: Mutex::new(None),
            }),
        }
    }

    pub fn device(&self) -> &DeviceIdentifier {
        &self.inner.device
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device.device_id
    }

    pub fn config(&self) -> BulbConfig {
        lock(&self.inner.config).clone()
    }

    fn configure<F: FnOnce(&mut BulbConfig)>(&self, change: F) -> Result<()> {
        if lock(&self.inner.mux).activated {
            return Err(BulbError::Configuration(format!(
                "bulb {} is already active",
                self.device_id()
            )));
        }
        change(&mut lock(&self.inner.config));
        Ok(())
    }

    /// Sets how many connections to open, clamped to 1..=4.
    pub fn set_connections(&self, connections: usize) -> Result<()> {
        let clamped = connections.clamp(1, MAX_CONNECTIONS);
        if clamped != connections {
            warn!(
                "{}: {} connections requested, using {}",
                self.device_id(),
                connections,
                clamped
            );
        }
        self.configure(|config| config.connections = clamped)
    }

    pub fn set_queue_limit(&self, max_len: usize, policy: QueuePolicy) -> Result<()> {
        self.configure(|config| config.queue = QueueConfig { max_len, policy })
    }

    pub fn set_queue_max(&self, max_len: usize) -> Result<()> {
        self.configure(|config| config.queue.max_len = max_len)
    }

    pub fn set_queue_policy(&self, policy: QueuePolicy) -> Result<()> {
        self.configure(|config| config.queue.policy = policy)
    }

    /// Installs the handler for notifications and replies nobody waits for.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&Bulb, &Message) + Send + Sync + 'static,
    {
        *lock(&self.inner.default_callback) = Some(Arc::new(callback));
    }

    /// Runs `hook` once, when the bulb retires.
    pub(crate) fn on_retire<F>(&self, hook: F)
    where
        F: FnOnce(&Bulb) + Send + 'static,
    {
        *lock(&self.inner.retire_hook) = Some(Box::new(hook));
    }

    /**
    Opens the configured number of connections.

    Returns as soon as they are started. The bulb accepts commands once the
    first one is connected, and registers itself at that point. Every link
    starts on the preferred address; a link that fails to connect is replaced
    by one to the next address. A closed bulb cannot be activated.
    */
    pub fn activate(&self) -> Result<()> {
        let config = self.config();
        let mut device = self.inner.device.clone();
        if let Some(prefix) = &config.ipv6_prefix {
            device.apply_ipv6_prefix(prefix);
        }
        let addresses = device.socket_addrs();
        let addr = *addresses.first().ok_or_else(|| {
            BulbError::Configuration(format!("bulb {} has no address", self.device_id()))
        })?;

        let mut mux = lock(&self.inner.mux);
        if mux.closing {
            return Err(BulbError::Configuration(format!(
                "bulb {} is closed",
                self.device_id()
            )));
        }
        if mux.activated {
            return Err(BulbError::Configuration(format!(
                "bulb {} is already active",
                self.device_id()
            )));
        }
        mux.activated = true;
        mux.replacements_left = config.connect_attempts;
        mux.addresses = addresses;

        let (events_tx, events_rx) = unbounded_channel();
        info!(
            "{}: opening {} connection(s) to {}",
            self.device_id(),
            config.connections,
            addr
        );
        for _ in 0..config.connections {
            mux.connections.push(Connection::open(
                &self.inner.handle,
                self.device_id(),
                addr,
                config.connection_settings(),
                Duration::ZERO,
                events_tx.clone(),
            ));
        }
        drop(mux);
        self.inner
            .handle
            .spawn(supervise(self.clone(), events_rx, events_tx));
        Ok(())
    }

    /// Attaches an already established stream as one more connection.
    #[cfg(test)]
    pub(crate) fn activate_with_streams<S>(&self, streams: Vec<S>) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let config = self.config();
        let mut mux = lock(&self.inner.mux);
        mux.activated = true;
        let (events_tx, events_rx) = unbounded_channel();
        for stream in streams {
            mux.connections.push(Connection::with_stream(
                &self.inner.handle,
                self.device_id(),
                stream,
                config.connection_settings(),
                events_tx.clone(),
            ));
        }
        mux.addresses = self.device().socket_addrs();
        drop(mux);
        self.inner
            .handle
            .spawn(supervise(self.clone(), events_rx, events_tx));
        Ok(())
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self
                .inner
                .seq
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /**
    Queues `payload` on the next connected link and returns its correlation id.

    Never waits. `callback`, if given, runs at most once, when the reply
    arrives; a command that is evicted, times out or dies with its connection
    never triggers it.
    */
    pub fn send(&self, payload: Payload, callback: Option<ResponseCallback>) -> Result<u32> {
        self.submit(payload, callback).map(|(id, _)| id)
    }

    /// [`Self::send`], also reporting how the connection's queue took it.
    pub fn submit(
        &self,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) -> Result<(u32, Admission)> {
        if !self.inner.device.supports(payload.method) {
            return Err(BulbError::Unsupported {
                device_id: self.device_id().to_string(),
                method: payload.method,
            });
        }
        let mut mux = lock(&self.inner.mux);
        if mux.retired || mux.closing {
            return Err(BulbError::NotReady {
                device_id: self.device_id().to_string(),
            });
        }
        let connection = mux.next_connected().ok_or_else(|| BulbError::NotReady {
            device_id: self.device_id().to_string(),
        })?;
        let id = self.next_id();
        let admission = connection.enqueue(Command::new(id, payload, callback))?;
        Ok((id, admission))
    }

    /// [`Self::send`] with a closure for the reply.
    pub fn send_with<F>(&self, payload: Payload, on_response: F) -> Result<u32>
    where
        F: FnOnce(&Bulb, &Response) + Send + 'static,
    {
        self.send(payload, Some(Box::new(on_response)))
    }

    /// Drains and closes every connection. The bulb unregisters once the last
    /// one is gone.
    pub fn close(&self) {
        let mut mux = lock(&self.inner.mux);
        if mux.closing {
            return;
        }
        mux.closing = true;
        info!("{}: closing", self.device_id());
        for connection in &mux.connections {
            connection.close();
        }
    }

    pub fn connection_states(&self) -> Vec<ConnectionState> {
        lock(&self.inner.mux)
            .connections
            .iter()
            .map(Connection::state)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        lock(&self.inner.mux)
            .connections
            .iter()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Queue length of every connection, in rotation order.
    pub fn queue_lengths(&self) -> Vec<usize> {
        lock(&self.inner.mux)
            .connections
            .iter()
            .map(Connection::queue_len)
            .collect()
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.inner.mux).registered
    }

    /// True once the bulb has lost every connection and given up.
    pub fn is_retired(&self) -> bool {
        lock(&self.inner.mux).retired
    }

    pub fn properties(&self) -> BTreeMap<String, Value> {
        lock(&self.inner.properties).clone()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        lock(&self.inner.properties).get(name).cloned()
    }

    pub fn power(&self) -> Option<String> {
        self.property("power")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn name(&self) -> Option<String> {
        self.property("name")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn int_property(&self, name: &str) -> Option<i64> {
        self.property(name).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// Brightness in percent, 0 if unknown.
    pub fn brightness(&self) -> i64 {
        self.int_property("bright").unwrap_or(0)
    }

    /// Colour as a packed 24-bit RGB value, 0 if unknown.
    pub fn rgb(&self) -> i64 {
        self.int_property("rgb").unwrap_or(0)
    }

    pub fn colour(&self) -> Colour {
        Colour {
            hue: self.int_property("hue"),
            saturation: self.int_property("sat"),
            value: self.int_property("bright"),
        }
    }

    pub fn white(&self) -> White {
        White {
            brightness: self.int_property("bright"),
            temperature: self.int_property("ct"),
        }
    }

    /// The id the device reports about itself.
    pub fn bulb_id(&self) -> Option<u64> {
        self.property("id").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => u64::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok(),
            _ => None,
        })
    }

    fn on_connected(&self, connection: Uuid) {
        let first = {
            let mut mux = lock(&self.inner.mux);
            let first = !mux.registered && !mux.retired;
            if first {
                mux.registered = true;
            }
            first
        };
        debug!("{}: connection {} is up", self.device_id(), connection);
        if first {
            if let Some(registry) = &self.inner.registry {
                registry.register(self);
            }
        }
    }

    /// Caches the values a `get_prop` reply carries, keyed by the names asked for.
    fn on_reply(&self, command: &Command, response: &Response) {
        if command.payload.method != Method::GetProp {
            return;
        }
        let values = match &response.result {
            Some(values) => values,
            None => return,
        };
        let mut properties = lock(&self.inner.properties);
        for (name, value) in command.payload.params.iter().zip(values) {
            let name = match name.as_str() {
                Some(name) => name,
                None => continue,
            };
            let value = match value {
                Value::String(raw) => parse_property(name, raw),
                other if PROPERTIES.contains(&name) => Some(other.clone()),
                _ => None,
            };
            if let Some(value) = value {
                properties.insert(name.to_string(), value);
            }
        }
    }

    fn on_message(&self, message: &Message) {
        if let Message::Notification(notification) = message {
            if notification.method == "props" {
                let mut properties = lock(&self.inner.properties);
                for (name, value) in &notification.params {
                    if PROPERTIES.contains(&name.as_str()) {
                        properties.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        let callback = lock(&self.inner.default_callback).clone();
        match callback {
            Some(callback) => callback(self, message),
            None => debug!("{}: no handler for {:?}", self.device_id(), message),
        }
    }

    /// Handles a dead connection. Returns true when the bulb is retired.
    fn on_dead(
        &self,
        connection: Uuid,
        error: Option<BulbError>,
        events: &UnboundedSender<ConnectionEvent>,
    ) -> bool {
        let mut mux = lock(&self.inner.mux);
        let failed = mux.remove(connection).and_then(|c| c.addr());

        let next = match &error {
            Some(e) if e.is_connect_error() && !mux.closing && mux.replacements_left > 0 => {
                mux.address_after(failed)
            }
            _ => None,
        };
        if let Some(addr) = next {
            mux.replacements_left -= 1;
            let config = self.config();
            info!(
                "{}: replacing failed connection with one to {} ({} attempt(s) left)",
                self.device_id(),
                addr,
                mux.replacements_left
            );
            mux.connections.push(Connection::open(
                &self.inner.handle,
                self.device_id(),
                addr,
                config.connection_settings(),
                RECONNECT_DELAY,
                events.clone(),
            ));
        }

        if !mux.connections.is_empty() || mux.retired {
            return false;
        }
        let was_registered = mux.registered;
        mux.retired = true;
        mux.registered = false;
        drop(mux);

        info!("{}: no connection left", self.device_id());
        if was_registered {
            if let Some(registry) = &self.inner.registry {
                registry.unregister(self);
            }
        } else {
            debug!("{}: never came up, nothing to unregister", self.device_id());
        }
        let hook = lock(&self.inner.retire_hook).take();
        if let Some(hook) = hook {
            hook(self);
        }
        true
    }
}

impl fmt::Debug for Bulb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulb")
            .field("device_id", &self.device_id())
            .field("connections", &self.connection_states())
            .finish()
    }
}

/// Routes connection events for one bulb until it retires.
async fn supervise(
    bulb: Bulb,
    mut events: UnboundedReceiver<ConnectionEvent>,
    sender: UnboundedSender<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected(connection) => bulb.on_connected(connection),
            ConnectionEvent::Message {
                command: Some(command),
                message: Message::Response(response),
                ..
            } => {
                bulb.on_reply(&command, &response);
                command.complete(&bulb, &response);
            }
            ConnectionEvent::Message {
                connection,
                message,
                ..
            } => {
                debug!("{}: unsolicited message on {}", bulb.device_id(), connection);
                bulb.on_message(&message);
            }
            ConnectionEvent::Dead { connection, error } => {
                if bulb.on_dead(connection, error, &sender) {
                    break;
                }
            }
        }
    }
    debug!("{}: supervisor finished", bulb.device_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_interface::command::Method;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[derive(Default)]
    struct CountingRegistry {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl Registry for CountingRegistry {
        fn register(&self, _bulb: &Bulb) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }

        fn unregister(&self, _bulb: &Bulb) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn device() -> DeviceIdentifier {
        let mut device =
            DeviceIdentifier::new("0x15243f".to_string(), "127.0.0.1".parse().unwrap(), 55443);
        device.properties.insert("power".to_string(), json!("off"));
        device.properties.insert("bright".to_string(), json!(40));
        device
    }

    fn toggle() -> Payload {
        Payload::new(Method::Toggle, vec![]).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_configuration_is_frozen_after_activation() {
        let bulb = Bulb::new(Handle::current(), device(), None);
        bulb.set_connections(9).unwrap();
        assert_eq!(bulb.config().connections, MAX_CONNECTIONS);
        bulb.set_queue_limit(5, QueuePolicy::Adapt).unwrap();

        let (client, _server) = tokio::io::duplex(1024);
        bulb.activate_with_streams(vec![client]).unwrap();
        assert!(matches!(
            bulb.set_connections(2),
            Err(BulbError::Configuration(_))
        ));
        assert!(matches!(
            bulb.set_queue_policy(QueuePolicy::Drop),
            Err(BulbError::Configuration(_))
        ));
        assert!(matches!(bulb.activate(), Err(BulbError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_send_before_activation_is_not_ready() {
        let bulb = Bulb::new(Handle::current(), device(), None);
        assert!(matches!(
            bulb.send(toggle(), None),
            Err(BulbError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_method_is_rejected() {
        let mut device = device();
        device.support.insert(Method::Toggle);
        let bulb = Bulb::new(Handle::current(), device, None);
        let payload = Payload::new(Method::SetRgb, vec![json!(255)]).unwrap();
        assert!(matches!(
            bulb.send(payload, None),
            Err(BulbError::Unsupported { method: Method::SetRgb, .. })
        ));
    }

    #[tokio::test]
    async fn test_round_robin_spreads_commands_evenly() {
        let registry = Arc::new(CountingRegistry::default());
        let bulb = Bulb::new(Handle::current(), device(), Some(registry.clone()));
        let mut servers = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, server) = tokio::io::duplex(4096);
            clients.push(client);
            servers.push(server);
        }
        bulb.activate_with_streams(clients).unwrap();
        wait_for(|| bulb.connected_count() == 3).await;
        assert_eq!(registry.registered.load(Ordering::SeqCst), 1);

        for _ in 0..6 {
            bulb.send(toggle(), None).unwrap();
        }
        assert_eq!(bulb.queue_lengths().len(), 3);

        for server in servers {
            let mut lines = BufReader::new(server).lines();
            let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert!(first["id"].as_u64() < second["id"].as_u64());
        }
    }

    #[tokio::test]
    async fn test_reply_reaches_callback_and_notifications_update_properties() {
        let bulb = Bulb::new(Handle::current(), device(), None);
        let (client, server) = tokio::io::duplex(4096);
        bulb.activate_with_streams(vec![client]).unwrap();
        wait_for(|| bulb.connected_count() == 1).await;

        let unsolicited = Arc::new(AtomicUsize::new(0));
        let counter = unsolicited.clone();
        bulb.register_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = bulb
            .send_with(toggle(), move |bulb, response| {
                let _ = tx.send((bulb.device_id().to_string(), response.clone()));
            })
            .unwrap();

        let (reader, mut writer) = tokio::io::split(server);
        let mut lines = BufReader::new(reader).lines();
        let request: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["id"], json!(id));
        assert_eq!(request["method"], json!("toggle"));

        let reply = format!(
            "{{\"method\":\"props\",\"params\":{{\"power\":\"on\",\"bright\":80}}}}\r\n{{\"id\":{},\"result\":[\"ok\"]}}\r\n",
            id
        );
        writer.write_all(reply.as_bytes()).await.unwrap();

        let (device_id, response) = rx.await.unwrap();
        assert_eq!(device_id, "0x15243f");
        assert!(response.is_ok());
        wait_for(|| unsolicited.load(Ordering::SeqCst) == 1).await;
        assert_eq!(bulb.power().as_deref(), Some("on"));
        assert_eq!(bulb.brightness(), 80);
    }

    #[tokio::test]
    async fn test_losing_last_connection_unregisters_once() {
        let registry = Arc::new(CountingRegistry::default());
        let bulb = Bulb::new(Handle::current(), device(), Some(registry.clone()));
        let (client, server) = tokio::io::duplex(1024);
        bulb.activate_with_streams(vec![client]).unwrap();
        wait_for(|| bulb.is_registered()).await;

        drop(server);
        wait_for(|| bulb.is_retired()).await;
        assert_eq!(registry.registered.load(Ordering::SeqCst), 1);
        assert_eq!(registry.unregistered.load(Ordering::SeqCst), 1);
        assert!(matches!(
            bulb.send(toggle(), None),
            Err(BulbError::NotReady { .. })
        ));
        assert!(bulb.connection_states().is_empty());
    }

    #[tokio::test]
    async fn test_bulb_that_never_connects_is_not_unregistered() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let registry = Arc::new(CountingRegistry::default());
        let device = DeviceIdentifier::new("0xbeef".to_string(), "127.0.0.1".parse().unwrap(), port);
        let config = BulbConfig {
            connections: 2,
            connect_timeout: Duration::from_millis(200),
            connect_attempts: 1,
            ..BulbConfig::default()
        };
        let bulb = Bulb::with_config(Handle::current(), device, config, Some(registry.clone()));
        let retired = Arc::new(AtomicUsize::new(0));
        let hook_runs = retired.clone();
        bulb.on_retire(move |_| {
            hook_runs.fetch_add(1, Ordering::SeqCst);
        });
        bulb.activate().unwrap();

        wait_for(|| bulb.is_retired()).await;
        assert!(!bulb.is_registered());
        assert_eq!(registry.registered.load(Ordering::SeqCst), 0);
        assert_eq!(registry.unregistered.load(Ordering::SeqCst), 0);
        assert_eq!(retired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_bulb_cannot_be_activated() {
        let registry = Arc::new(CountingRegistry::default());
        let bulb = Bulb::new(Handle::current(), device(), Some(registry.clone()));
        bulb.close();
        assert!(matches!(bulb.activate(), Err(BulbError::Configuration(_))));
        assert!(bulb.connection_states().is_empty());
        assert!(matches!(
            bulb.send(toggle(), None),
            Err(BulbError::NotReady { .. })
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.registered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_replacement_address_rotates() {
        let first: SocketAddr = "[fd00::15:243f]:55443".parse().unwrap();
        let second: SocketAddr = "192.168.1.239:55443".parse().unwrap();
        let mut mux = Multiplexer::default();
        assert_eq!(mux.address_after(Some(first)), None);

        mux.addresses = vec![first, second];
        assert_eq!(mux.address_after(Some(first)), Some(second));
        assert_eq!(mux.address_after(Some(second)), Some(first));
        assert_eq!(mux.address_after(None), Some(first));

        mux.addresses = vec![second];
        assert_eq!(mux.address_after(Some(second)), Some(second));
    }

    #[tokio::test]
    async fn test_get_prop_reply_fills_property_cache() {
        let bulb = Bulb::new(Handle::current(), device(), None);
        let (client, server) = tokio::io::duplex(4096);
        bulb.activate_with_streams(vec![client]).unwrap();
        wait_for(|| bulb.connected_count() == 1).await;

        let payload = Payload::get_prop(&["power", "bright", "ct", "hue", "sat", "rgb", "flowing"]).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = bulb
            .send_with(payload, move |bulb, _| {
                let _ = tx.send(bulb.brightness());
            })
            .unwrap();

        let (reader, mut writer) = tokio::io::split(server);
        let mut lines = BufReader::new(reader).lines();
        let request: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["method"], json!("get_prop"));
        let reply = format!(
            "{{\"id\":{},\"result\":[\"on\",\"75\",\"4000\",\"120\",\"50\",\"255\",\"\"]}}\r\n",
            id
        );
        writer.write_all(reply.as_bytes()).await.unwrap();

        // The cache is filled before the callback sees the reply.
        assert_eq!(rx.await.unwrap(), 75);
        assert_eq!(bulb.power().as_deref(), Some("on"));
        assert_eq!(bulb.rgb(), 255);
        assert_eq!(
            bulb.colour(),
            Colour {
                hue: Some(120),
                saturation: Some(50),
                value: Some(75),
            }
        );
        assert_eq!(
            bulb.white(),
            White {
                brightness: Some(75),
                temperature: Some(4000),
            }
        );
        assert_eq!(bulb.property("flowing"), Some(json!("")));
    }

    #[tokio::test]
    async fn test_accessors_without_reports() {
        let mut device = DeviceIdentifier::new("0x15243f".to_string(), "127.0.0.1".parse().unwrap(), 55443);
        let bulb = Bulb::new(Handle::current(), device.clone(), None);
        assert_eq!(bulb.rgb(), 0);
        assert_eq!(bulb.brightness(), 0);
        assert_eq!(bulb.colour(), Colour::default());
        assert_eq!(bulb.white(), White::default());
        assert_eq!(bulb.bulb_id(), None);

        device.properties.insert("id".to_string(), json!(0x15243f));
        let bulb = Bulb::new(Handle::current(), device.clone(), None);
        assert_eq!(bulb.bulb_id(), Some(0x15243f));

        device.properties.insert("id".to_string(), json!("0x000000000015243f"));
        let bulb = Bulb::new(Handle::current(), device, None);
        assert_eq!(bulb.bulb_id(), Some(0x15243f));
    }
}
