use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use rand::Rng;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout, Instant};

use bulb_control_lib::config::ClientConfig;
use bulb_control_lib::control_interface::command::{Method, Payload};
use bulb_control_lib::control_interface::{Bulb, BulbConfig};
use bulb_control_lib::error::BulbError;
use bulb_control_lib::queue::{Admission, QueuePolicy};
use bulb_control_lib::util::discovery::{DeviceIdentifier, Discovery};
use bulb_control_lib::util::traits::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "bulb_control",
    about = "Discovers and controls LAN smart light bulbs",
    version = "0.1.0"
)]
pub struct Cli {
    /// YAML file with discovery and bulb settings
    #[clap(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `discover` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Where to reach a bulb without discovering it first.
#[derive(clap::Args)]
pub struct Target {
    /// IP address of the bulb
    #[clap(long)]
    ip: IpAddr,

    /// Command port of the bulb
    #[clap(long, default_value_t = 55443)]
    port: u16,

    /// Number of connections to open (1-4)
    #[clap(long)]
    connections: Option<usize>,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Searches the network for bulbs
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,
    },
    /// Sends one command and prints the reply
    #[clap(name = "send")]
    Send {
        #[clap(flatten)]
        target: Target,

        /// Method name, e.g. toggle or set_bright
        method: String,

        /// Parameters; each is read as JSON, falling back to a plain string
        params: Vec<String>,

        /// How long to wait for the reply, in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,
    },
    /// Streams random colours at a bulb to exercise the queue policies
    #[clap(name = "flood")]
    Flood {
        #[clap(flatten)]
        target: Target,

        /// Number of commands to submit
        #[clap(long, default_value_t = 50)]
        count: u32,

        /// Pause between submissions, in milliseconds
        #[clap(long, value_parser = parse_duration, default_value = "100")]
        interval: Duration,

        /// Overflow policy of each connection's queue
        #[clap(long, value_enum)]
        policy: Option<QueuePolicy>,

        /// Queue length per connection
        #[clap(long)]
        queue_max: Option<usize>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let millis = s
        .parse::<u64>()
        .map_err(|_| "could not parse duration in milliseconds")?;
    Ok(Duration::from_millis(millis))
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))
        }
        None => Ok(ClientConfig::default()),
    }
}

/// Prints registry events to the terminal.
struct ConsoleRegistry;

impl Registry for ConsoleRegistry {
    fn register(&self, bulb: &Bulb) {
        println!("Bulb {} is online", bulb.device_id());
    }

    fn unregister(&self, bulb: &Bulb) {
        println!("Bulb {} went away", bulb.device_id());
    }
}

fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Builds and activates a bulb for `target`, then waits for a live connection.
async fn connect(target: &Target, mut config: BulbConfig) -> Result<Bulb> {
    if let Some(connections) = target.connections {
        config.connections = connections;
    }
    let device = DeviceIdentifier::new(format!("{}", target.ip), target.ip, target.port);
    let bulb = Bulb::with_config(
        Handle::current(),
        device,
        config.clone(),
        Some(Arc::new(ConsoleRegistry)),
    );
    bulb.activate()?;

    let deadline = Instant::now() + config.connect_timeout + Duration::from_millis(500);
    while bulb.connected_count() == 0 {
        if bulb.is_retired() || Instant::now() >= deadline {
            return Err(anyhow!("Could not connect to {}:{}", target.ip, target.port));
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(bulb)
}

/// Lets queued commands drain, then closes the bulb.
async fn shut_down(bulb: &Bulb, grace: Duration) {
    bulb.close();
    let deadline = Instant::now() + grace + Duration::from_millis(200);
    while !bulb.is_retired() && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Discover { output, timeout } => {
            // Replies to a one-shot search come back unicast to the sender.
            let mut discovery = config.discovery.clone();
            discovery.bind_addr.set_port(0);
            let devices =
                Discovery::find_devices_with(&discovery, Duration::from_millis(timeout)).await?;
            match output {
                OutputFormat::Plaintext => {
                    Discovery::pretty_print_devices(&devices);
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string(&devices)?;
                    println!("{}", json);
                }
                OutputFormat::Yaml => {
                    let yaml = serde_yaml::to_string(&devices)?;
                    println!("{}", yaml);
                }
            }
        }
        Commands::Send {
            target,
            method,
            params,
            timeout: reply_timeout,
        } => {
            let method: Method = method.parse()?;
            let payload = Payload::new(method, params.iter().map(|p| parse_param(p)).collect())?;
            let bulb = connect(&target, config.bulb.clone()).await?;

            let (tx, rx) = tokio::sync::oneshot::channel();
            let id = bulb.send_with(payload, move |_, response| {
                let _ = tx.send(response.clone());
            })?;
            info!("Sent command {} ({})", id, method);

            match timeout(Duration::from_millis(reply_timeout), rx).await {
                Ok(Ok(response)) => match (&response.result, &response.error) {
                    (Some(result), _) => println!("{}", serde_json::to_string(result)?),
                    (None, Some(error)) => {
                        println!("Device error {}: {}", error.code, error.message)
                    }
                    (None, None) => println!("Empty reply"),
                },
                Ok(Err(_)) => warn!("Connection closed before a reply arrived"),
                Err(_) => warn!("No reply within {} ms", reply_timeout),
            }
            shut_down(&bulb, config.bulb.drain_grace).await;
        }
        Commands::Flood {
            target,
            count,
            interval,
            policy,
            queue_max,
        } => {
            let mut bulb_config = config.bulb.clone();
            if let Some(policy) = policy {
                bulb_config.queue.policy = policy;
            }
            if let Some(max_len) = queue_max {
                bulb_config.queue.max_len = max_len;
            }
            let bulb = connect(&target, bulb_config.clone()).await?;
            println!(
                "Flooding {} with {} commands, queue {} / {}",
                bulb.device_id(),
                count,
                bulb_config.queue.max_len,
                bulb_config.queue.policy
            );

            let (mut queued, mut evicted, mut bursts, mut rejected) = (0u32, 0u32, 0u32, 0u32);
            for _ in 0..count {
                let rgb: u32 = rand::thread_rng().gen_range(0..=0xff_ffff);
                let payload = Payload::new(
                    Method::SetRgb,
                    vec![rgb.into(), "sudden".into(), 30.into()],
                )?;
                match bulb.submit(payload, None) {
                    Ok((_, Admission::Queued)) => queued += 1,
                    Ok((_, Admission::Evicted(old))) => {
                        queued += 1;
                        evicted += 1;
                        info!("Command {} was evicted", old.id);
                    }
                    Ok((_, Admission::Burst)) => {
                        queued += 1;
                        bursts += 1;
                    }
                    Err(BulbError::QueueFull { .. }) => rejected += 1,
                    Err(e) => return Err(e.into()),
                }
                sleep(interval).await;
            }

            println!(
                "Accepted {}, evicted {}, rejected {}, burst triggers {}, still queued {:?}",
                queued,
                evicted,
                rejected,
                bursts,
                bulb.queue_lengths()
            );
            shut_down(&bulb, bulb_config.drain_grace).await;
        }
    }

    Ok(())
}
