//! # Bulb Control Library for Yeelight-style Wi-Fi Bulbs
//!
//! `bulb-control-lib` discovers smart bulbs on the local network and keeps
//! persistent command connections open to them. Outgoing traffic is shaped
//! per connection so the bulbs' firmware is not overwhelmed: commands wait in
//! a bounded queue and leave at most once per second, unless the queue
//! overflows under the `adapt` policy, in which case the backlog is flushed in
//! burst mode.
//!
//! ## Features
//!
//! - Multicast discovery with periodic rebroadcast and duplicate suppression
//! - One to four TCP connections per bulb, used round-robin
//! - Bounded command queues with `drop`, `head`, `random` and `adapt` policies
//! - Reply correlation with per-command callbacks
//! - A two-method [`util::traits::Registry`] hook for the caller's bookkeeping
//!
//! ## Example
//!
//! ```no_run
//! use bulb_control_lib::control_interface::command::{Method, Payload};
//! use bulb_control_lib::control_interface::Bulb;
//! use bulb_control_lib::util::discovery::Discovery;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devices = Discovery::find_devices(Duration::from_secs(3)).await?;
//!     for device in devices {
//!         let bulb = Bulb::new(tokio::runtime::Handle::current(), device, None);
//!         bulb.activate()?;
//!         tokio::time::sleep(Duration::from_millis(500)).await;
//!         bulb.send_with(Payload::new(Method::Toggle, vec![])?, |bulb, response| {
//!             println!("{}: {:?}", bulb.device_id(), response);
//!         })?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Yeelight or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// Client-wide configuration, deserialisable from YAML or JSON.
pub mod config;

// The `control_interface` module holds the per-bulb multiplexer, its TCP
// connections and the command types sent over them.
//
// Example usage:
//
// ```
// use bulb_control_lib::control_interface::command::{Method, Payload};
//
// let payload = Payload::new(Method::SetBright, vec![50.into(), "smooth".into(), 300.into()]).unwrap();
// ```
pub mod control_interface;

pub mod error;

// Per-connection command queue and the rate limiter that paces it.
pub mod queue;

// The `util` module provides discovery, the wire codec and the registry
// bridge.
pub mod util;
