use std::cmp::max;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use derivative::Derivative;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::config::deserialize_duration_millis;
use crate::control_interface::command::Method;
use crate::error::{BulbError, Result};
use crate::util::lock;
use crate::util::registry::DeviceTracker;

pub const MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const DISCOVERY_PORT: u16 = 1982;
pub const SEARCH_TARGET: &str = "wifi_bulb";

/// Default pause between rounds of search requests.
pub const DEFAULT_REST_INTERVAL: Duration = Duration::from_secs(360);

const LOCATION_SCHEME: &str = "yeelight://";
const MAX_DATAGRAM: usize = 2048;

/// Properties kept from discovery headers and `props` notifications.
pub const PROPERTIES: &[&str] = &[
    "power", "bg_power", "bright", "bg_bright", "nl_br", "ct", "bg_ct", "rgb", "bg_rgb", "hue",
    "bg_hue", "sat", "bg_sat", "color_mode", "bg_lmode", "flowing", "bg_flowing", "flow_params",
    "bg_flow_params", "music_on", "name", "delayoff", "fw_ver", "model", "id",
];

const INT_PROPERTIES: &[&str] = &[
    "bright", "bg_bright", "nl_br", "ct", "bg_ct", "rgb", "bg_rgb", "hue", "bg_hue", "sat",
    "bg_sat", "delayoff",
];

const HEX_PROPERTIES: &[&str] = &["id"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Where search requests go. Usually the multicast group.
    pub search_addr: SocketAddr,
    /// Local address to listen on. Binding the discovery port also catches
    /// the bulbs' unsolicited advertisements.
    pub bind_addr: SocketAddr,
    /// Pause after every round of `broadcast(times)` requests.
    #[serde(
        rename = "rest_interval_ms",
        deserialize_with = "deserialize_duration_millis"
    )]
    pub rest_interval: Duration,
    /// Gap between the requests of one round.
    #[serde(
        rename = "search_interval_ms",
        deserialize_with = "deserialize_duration_millis"
    )]
    pub search_interval: Duration,
    /// Prefix used to derive an IPv6 address for each device.
    pub ipv6_prefix: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            search_addr: SocketAddr::from((MULTICAST_ADDRESS, DISCOVERY_PORT)),
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)),
            rest_interval: DEFAULT_REST_INTERVAL,
            search_interval: Duration::from_secs(1),
            ipv6_prefix: None,
        }
    }
}

/// Identity and last known state of a bulb, as learned from discovery.
///
/// Two identifiers are equal when id, addresses and port match; the state
/// fields are ignored.
#[derive(Derivative)]
#[derivative(Hash, PartialEq, Eq)]
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentifier {
    pub device_id: String,
    /// Addresses to try, preferred first.
    pub addresses: Vec<IpAddr>,
    pub port: u16,

    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub model: Option<String>,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub firmware_version: Option<String>,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub name: Option<String>,

    /**
    Methods listed in the `support` header.

    Empty if the device did not send one, in which case nothing is filtered.
    */
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub support: BTreeSet<Method>,

    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub properties: BTreeMap<String, Value>,
}

impl DeviceIdentifier {
    pub fn new(device_id: String, address: IpAddr, port: u16) -> Self {
        DeviceIdentifier {
            device_id,
            addresses: vec![address],
            port,
            model: None,
            firmware_version: None,
            name: None,
            support: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Builds an identity from a parsed reply. Needs at least `id` and
    /// `location`.
    pub fn from_headers(headers: &HashMap<String, String>, ipv6_prefix: Option<&str>) -> Result<Self> {
        let device_id = headers
            .get("id")
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BulbError::DiscoveryParse("missing id header".to_string()))?;
        let location = headers
            .get("location")
            .ok_or_else(|| BulbError::DiscoveryParse("missing location header".to_string()))?;
        let location = location.strip_prefix(LOCATION_SCHEME).unwrap_or(location);
        let location: SocketAddr = location
            .trim_end_matches('/')
            .parse()
            .map_err(|_| BulbError::DiscoveryParse(format!("bad location {}", location)))?;

        let mut device = DeviceIdentifier::new(device_id, location.ip(), location.port());
        device.model = headers.get("model").cloned();
        device.firmware_version = headers.get("fw_ver").cloned();
        device.name = headers.get("name").cloned().filter(|n| !n.is_empty());
        if let Some(support) = headers.get("support") {
            device.support = support
                .split_whitespace()
                .filter_map(|m| m.parse::<Method>().ok())
                .collect();
        }
        for (key, value) in headers {
            if let Some(value) = parse_property(key, value) {
                device.properties.insert(key.clone(), value);
            }
        }
        if let Some(prefix) = ipv6_prefix {
            device.apply_ipv6_prefix(prefix);
        }
        Ok(device)
    }

    /// Puts the address derived from `prefix` in front of the address list.
    pub fn apply_ipv6_prefix(&mut self, prefix: &str) {
        match derive_ipv6(prefix, &self.device_id) {
            Some(address) => {
                let address = IpAddr::V6(address);
                self.addresses.retain(|a| *a != address);
                self.addresses.insert(0, address);
            }
            None => warn!(
                "Could not derive an IPv6 address for {} from prefix {}",
                self.device_id, prefix
            ),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addresses
            .first()
            .map(|ip| SocketAddr::new(*ip, self.port))
    }

    /// Every known address with the command port, preferred first.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    pub fn supports(&self, method: Method) -> bool {
        self.support.is_empty() || self.support.contains(&method)
    }
}

pub(crate) fn parse_property(key: &str, value: &str) -> Option<Value> {
    if !PROPERTIES.contains(&key) {
        return None;
    }
    if INT_PROPERTIES.contains(&key) {
        value.trim().parse::<i64>().ok().map(Value::from)
    } else if HEX_PROPERTIES.contains(&key) {
        let digits = value.trim().trim_start_matches("0x");
        u64::from_str_radix(digits, 16).ok().map(Value::from)
    } else {
        Some(Value::String(value.to_string()))
    }
}

/// Places the low 64 bits of the device id under `prefix`.
///
/// A prefix ending in `::` is parsed as given. Anything else is treated as the
/// leading groups of a /64 and completed with `::`. Returns `None` if the
/// result is not a valid address.
pub fn derive_ipv6(prefix: &str, device_id: &str) -> Option<Ipv6Addr> {
    let interface_id = u64::from_str_radix(device_id.trim_start_matches("0x"), 16).ok()?;
    let network = if prefix.ends_with("::") {
        prefix.to_string()
    } else if prefix.ends_with(':') {
        format!("{}:", prefix)
    } else {
        format!("{}::", prefix)
    };
    let network = u128::from(network.parse::<Ipv6Addr>().ok()?);
    Some(Ipv6Addr::from(
        (network & !u128::from(u64::MAX)) | u128::from(interface_id),
    ))
}

/// Splits a reply into lower-cased header names and trimmed values.
pub fn parse_headers(data: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| BulbError::DiscoveryParse("reply is not UTF-8".to_string()))?;
    let mut headers = HashMap::new();
    for line in text.split('\n').map(|l| l.trim_end_matches('\r')).skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    if headers.is_empty() {
        return Err(BulbError::DiscoveryParse("no header lines".to_string()));
    }
    Ok(headers)
}

pub fn search_request(search_addr: SocketAddr) -> String {
    [
        "M-SEARCH * HTTP/1.1".to_string(),
        format!("HOST: {}", search_addr),
        "MAN: \"ssdp:discover\"".to_string(),
        format!("ST: {}", SEARCH_TARGET),
        String::new(),
        String::new(),
    ]
    .join("\r\n")
}

type DeviceHandler = Arc<dyn Fn(DeviceIdentifier) + Send + Sync>;

/// Listens for bulb announcements and reports each new device once.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    handle: Handle,
    listener: Mutex<Option<JoinHandle<()>>>,
    broadcaster: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /**
    Binds the discovery socket and starts listening.

    `on_new_device` is called once per device id that `tracker` does not yet
    know about; the id is left pending in the tracker until the bulb built for
    it registers or gives up.
    */
    pub async fn start<F>(
        handle: Handle,
        config: DiscoveryConfig,
        tracker: Arc<DeviceTracker>,
        on_new_device: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(DeviceIdentifier) + Send + Sync + 'static,
    {
        let socket = Self::bind(&config).await?;
        let socket = Arc::new(socket);
        let handler: DeviceHandler = Arc::new(on_new_device);

        let listener = handle.spawn(Self::listen(
            socket.clone(),
            config.ipv6_prefix.clone(),
            tracker,
            handler,
        ));
        info!(
            "Discovery listening on {}",
            socket.local_addr().context("Failed to read local address")?
        );

        Ok(Discovery {
            socket,
            config,
            handle,
            listener: Mutex::new(Some(listener)),
            broadcaster: Mutex::new(None),
        })
    }

    async fn bind(config: &DiscoveryConfig) -> anyhow::Result<UdpSocket> {
        let socket = match UdpSocket::bind(config.bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    "Could not bind {} ({}), falling back to an ephemeral port",
                    config.bind_addr, e
                );
                let mut fallback = config.bind_addr;
                fallback.set_port(0);
                UdpSocket::bind(fallback)
                    .await
                    .context("Failed to bind discovery socket")?
            }
        };
        socket.set_broadcast(true)?;
        if let IpAddr::V4(group) = config.search_addr.ip() {
            if group.is_multicast() {
                socket.set_multicast_ttl_v4(1)?;
                if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    warn!("Could not join multicast group {}: {}", group, e);
                }
            }
        }
        Ok(socket)
    }

    async fn listen(
        socket: Arc<UdpSocket>,
        ipv6_prefix: Option<String>,
        tracker: Arc<DeviceTracker>,
        handler: DeviceHandler,
    ) {
        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((number_of_bytes, src_addr)) => Self::handle_datagram(
                    &buffer[..number_of_bytes],
                    src_addr,
                    ipv6_prefix.as_deref(),
                    &tracker,
                    &handler,
                ),
                Err(e) => {
                    error!("Failed to receive discovery datagram: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn handle_datagram(
        data: &[u8],
        src_addr: SocketAddr,
        ipv6_prefix: Option<&str>,
        tracker: &DeviceTracker,
        handler: &DeviceHandler,
    ) {
        let device = match Self::decode_discovery_response(data, ipv6_prefix) {
            Ok(device) => device,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", src_addr, e);
                return;
            }
        };
        if !tracker.claim(&device.device_id) {
            debug!("Device {} is already known, skipping", device.device_id);
            return;
        }
        info!("Found device: {} at {}", device.device_id, src_addr);
        handler(device);
    }

    pub fn decode_discovery_response(data: &[u8], ipv6_prefix: Option<&str>) -> Result<DeviceIdentifier> {
        let headers = parse_headers(data)?;
        DeviceIdentifier::from_headers(&headers, ipv6_prefix)
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends a single search request.
    pub async fn broadcast_once(&self) -> anyhow::Result<()> {
        Self::send_search(&self.socket, self.config.search_addr).await
    }

    async fn send_search(socket: &UdpSocket, search_addr: SocketAddr) -> anyhow::Result<()> {
        socket
            .send_to(search_request(search_addr).as_bytes(), search_addr)
            .await
            .context("Failed to send search request")?;
        Ok(())
    }

    /**
    Sends `times` search requests, rests for the configured interval, and
    repeats until [`Self::cancel`]. Replaces any earlier schedule.
    */
    pub fn broadcast(&self, times: u32) {
        let socket = self.socket.clone();
        let search_addr = self.config.search_addr;
        let search_interval = self.config.search_interval;
        let rest_interval = self.config.rest_interval;
        let times = max(times, 1);
        let task = self.handle.spawn(async move {
            loop {
                for _ in 0..times {
                    if let Err(e) = Self::send_search(&socket, search_addr).await {
                        warn!("{:#}", e);
                    }
                    sleep(search_interval).await;
                }
                sleep(rest_interval).await;
            }
        });
        if let Some(previous) = lock(&self.broadcaster).replace(task) {
            previous.abort();
        }
    }

    /// Stops listening and broadcasting. Safe to call more than once.
    pub fn cancel(&self) {
        let listener = lock(&self.listener).take();
        let broadcaster = lock(&self.broadcaster).take();
        if listener.is_some() || broadcaster.is_some() {
            info!("Stopping discovery");
        }
        for task in listener.into_iter().chain(broadcaster) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Sends one search request to the default multicast group and collects
    /// replies until `given_timeout` expires.
    pub async fn find_devices(given_timeout: Duration) -> anyhow::Result<HashSet<DeviceIdentifier>> {
        let config = DiscoveryConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            ..DiscoveryConfig::default()
        };
        Self::find_devices_with(&config, given_timeout).await
    }

    pub async fn find_devices_with(
        config: &DiscoveryConfig,
        given_timeout: Duration,
    ) -> anyhow::Result<HashSet<DeviceIdentifier>> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        socket.set_broadcast(true)?;
        Self::send_search(&socket, config.search_addr).await?;

        let mut discovered_devices = HashMap::<String, DeviceIdentifier>::new();
        let mut buffer = [0u8; MAX_DATAGRAM];
        let timeout_end = Instant::now() + given_timeout;

        loop {
            let now = Instant::now();
            if now >= timeout_end {
                break;
            }
            match timeout(timeout_end - now, socket.recv_from(&mut buffer)).await {
                Ok(Ok((number_of_bytes, src_addr))) => {
                    match Self::decode_discovery_response(
                        &buffer[..number_of_bytes],
                        config.ipv6_prefix.as_deref(),
                    ) {
                        // Bulbs often answer the same request several times.
                        Ok(device) if discovered_devices.contains_key(&device.device_id) => {
                            debug!("Found device {} again, skipping", device.device_id);
                        }
                        Ok(device) => {
                            info!("Found device: {} at {}", device.device_id, src_addr);
                            discovered_devices.insert(device.device_id.clone(), device);
                        }
                        Err(e) => debug!("Ignoring datagram from {}: {}", src_addr, e),
                    }
                }
                Ok(Err(e)) => {
                    error!("Failed to receive response: {}", e);
                    break;
                }
                Err(_) => {
                    info!("Discovery time complete. If devices are missing, try increasing the search timeout.");
                    break;
                }
            }
        }

        Ok(discovered_devices.into_values().collect())
    }

    pub fn pretty_print_devices(devices: &HashSet<DeviceIdentifier>) {
        let address = |d: &DeviceIdentifier| {
            d.socket_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        };
        let max_address_width = devices.iter().map(|d| address(d).len()).max().unwrap_or(0);
        let max_device_id_width = devices.iter().map(|d| d.device_id.len()).max().unwrap_or(0);
        let max_model_width = devices
            .iter()
            .map(|d| max(d.model.as_deref().unwrap_or("").len(), 5))
            .max()
            .unwrap_or(0);
        let max_name_width = devices
            .iter()
            .map(|d| max(d.name.as_deref().unwrap_or("").len(), 20))
            .max()
            .unwrap_or(0);

        println!(
            "{:<address_width$} {:<device_id_width$} {:<model_width$} {:<name_width$}",
            "Address",
            "Device ID",
            "Model",
            "Name",
            address_width = max_address_width + 2,
            device_id_width = max_device_id_width + 2,
            model_width = max_model_width + 2,
            name_width = max_name_width + 2,
        );
        println!(
            "{:<address_width$} {:<device_id_width$} {:<model_width$} {:<name_width$}",
            "-".repeat(max_address_width),
            "-".repeat(max_device_id_width),
            "-".repeat(max_model_width),
            "-".repeat(max_name_width),
            address_width = max_address_width + 2,
            device_id_width = max_device_id_width + 2,
            model_width = max_model_width + 2,
            name_width = max_name_width + 2,
        );
        for device in devices {
            println!(
                "{:<address_width$} {:<device_id_width$} {:<model_width$} {:<name_width$}",
                address(device),
                device.device_id,
                device.model.as_deref().unwrap_or(""),
                device.name.as_deref().unwrap_or(""),
                address_width = max_address_width + 2,
                device_id_width = max_device_id_width + 2,
                model_width = max_model_width + 2,
                name_width = max_name_width + 2,
            );
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(device_id: &str, location: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
             Cache-Control: max-age=3600\r\n\
             Location: yeelight://{}\r\n\
             Server: POSIX UPnP/1.0 YGLC/1\r\n\
             id: {}\r\n\
             model: color\r\n\
             fw_ver: 18\r\n\
             support: get_prop set_default set_power toggle set_bright set_rgb set_hsv\r\n\
             power: on\r\n\
             bright: 100\r\n\
             rgb: 16711680\r\n\
             name: desk\r\n\r\n",
            location, device_id
        )
    }

    #[test]
    fn test_decode_discovery_response() {
        let data = reply("0x000000000015243f", "192.168.1.239:55443");
        let device = Discovery::decode_discovery_response(data.as_bytes(), None).unwrap();
        assert_eq!(device.device_id, "0x000000000015243f");
        assert_eq!(
            device.socket_addr(),
            Some("192.168.1.239:55443".parse().unwrap())
        );
        assert_eq!(device.model.as_deref(), Some("color"));
        assert_eq!(device.name.as_deref(), Some("desk"));
        assert!(device.supports(Method::SetRgb));
        assert!(!device.supports(Method::StartCf));
        assert_eq!(device.properties["bright"], Value::from(100));
        assert_eq!(device.properties["id"], Value::from(0x15243f_u64));
        assert_eq!(device.properties["power"], Value::from("on"));
    }

    #[test]
    fn test_malformed_replies_are_rejected() {
        assert!(Discovery::decode_discovery_response(b"\xff\xfe", None).is_err());
        assert!(Discovery::decode_discovery_response(b"HTTP/1.1 200 OK\r\n\r\n", None).is_err());
        let no_id = "HTTP/1.1 200 OK\r\nLocation: yeelight://10.0.0.2:55443\r\n\r\n";
        assert!(matches!(
            Discovery::decode_discovery_response(no_id.as_bytes(), None),
            Err(BulbError::DiscoveryParse(_))
        ));
        let bad_location = reply("0x1", "not-an-address");
        assert!(Discovery::decode_discovery_response(bad_location.as_bytes(), None).is_err());
    }

    #[test]
    fn test_ipv6_prefix_derivation() {
        assert_eq!(
            derive_ipv6("fd00:1:2:3::", "0x000000000015243f"),
            Some("fd00:1:2:3::15:243f".parse().unwrap())
        );
        assert_eq!(
            derive_ipv6("fd00:1:2:3", "0x0123456789abcdef"),
            Some("fd00:1:2:3:123:4567:89ab:cdef".parse().unwrap())
        );
        assert_eq!(
            derive_ipv6("fd00:1:2:3:", "0x15243f"),
            Some("fd00:1:2:3::15:243f".parse().unwrap())
        );
        assert_eq!(derive_ipv6("fd00::1::", "0x1"), None);
        assert_eq!(derive_ipv6("fd00::", "not-hex"), None);

        let data = reply("0x000000000015243f", "192.168.1.239:55443");
        let device = Discovery::decode_discovery_response(data.as_bytes(), Some("fd00::")).unwrap();
        assert_eq!(device.addresses.len(), 2);
        assert_eq!(
            device.socket_addr(),
            Some("[fd00::15:243f]:55443".parse().unwrap())
        );
        assert_eq!(
            device.socket_addrs(),
            vec![
                "[fd00::15:243f]:55443".parse::<SocketAddr>().unwrap(),
                "192.168.1.239:55443".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_search_request_format() {
        let request = search_request(SocketAddr::from((MULTICAST_ADDRESS, DISCOVERY_PORT)));
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:1982\r\n"));
        assert!(request.contains("ST: wifi_bulb\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    async fn local_discovery(
        tracker: Arc<DeviceTracker>,
        seen: Arc<AtomicUsize>,
    ) -> (Discovery, UdpSocket) {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DiscoveryConfig {
            search_addr: device.local_addr().unwrap(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..DiscoveryConfig::default()
        };
        let discovery = Discovery::start(Handle::current(), config, tracker, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        (discovery, device)
    }

    #[tokio::test]
    async fn test_duplicate_replies_report_one_device() {
        let tracker = Arc::new(DeviceTracker::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let (discovery, device) = local_discovery(tracker.clone(), seen.clone()).await;
        let target = discovery.local_addr().unwrap();

        discovery.broadcast_once().await.unwrap();
        let mut buffer = [0u8; MAX_DATAGRAM];
        let (n, _) = device.recv_from(&mut buffer).await.unwrap();
        assert!(buffer[..n].starts_with(b"M-SEARCH"));

        let first = reply("0xaa", "127.0.0.1:55443");
        let other = reply("0xbb", "127.0.0.1:55444");
        for packet in [first.as_str(), "garbage", first.as_str(), other.as_str()] {
            device.send_to(packet.as_bytes(), target).await.unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.pending_count(), 2);
        assert!(discovery.is_running());
        discovery.cancel();
        discovery.cancel();
        assert!(!discovery.is_running());
    }
}
