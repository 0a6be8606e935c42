//! Bounded per-connection command queue with overflow policies.

pub mod rate_limiter;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use clap::ValueEnum;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::control_interface::command::Command;
use crate::error::{BulbError, Result};
use rate_limiter::{RateLimiter, RateMode};

pub const DEFAULT_QUEUE_MAX: usize = 16;

/// What to do with a command that arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Refuse the new command.
    #[default]
    Drop,
    /// Keep the new command, sacrifice the oldest one.
    Head,
    /// Keep the new command, sacrifice a random queued one.
    Random,
    /// Keep everything and flush the backlog in burst mode.
    Adapt,
}

impl FromStr for QueuePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(QueuePolicy::Drop),
            "head" => Ok(QueuePolicy::Head),
            "random" => Ok(QueuePolicy::Random),
            "adapt" => Ok(QueuePolicy::Adapt),
            _ => Err(anyhow!("Invalid queue policy")),
        }
    }
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policy_str = match self {
            QueuePolicy::Drop => "drop",
            QueuePolicy::Head => "head",
            QueuePolicy::Random => "random",
            QueuePolicy::Adapt => "adapt",
        };
        write!(f, "{}", policy_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_len: usize,
    pub policy: QueuePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_len: DEFAULT_QUEUE_MAX,
            policy: QueuePolicy::Drop,
        }
    }
}

/// Outcome of a successful [`CommandQueue::enqueue`].
#[derive(Debug)]
pub enum Admission {
    Queued,
    /// The command was queued and this older one was evicted to make room.
    Evicted(Command),
    /// The queue grew past its limit and burst mode is now active.
    Burst,
}

/// Outcome of [`CommandQueue::dequeue_ready`].
#[derive(Debug)]
pub enum Dequeue {
    /// Send these now, in order.
    Ready(Vec<Command>),
    /// Something is queued but the rate limit forbids sending before this instant.
    Wait(Instant),
    /// Nothing queued.
    Idle,
}

#[derive(Debug)]
pub struct CommandQueue {
    config: QueueConfig,
    commands: VecDeque<Command>,
    limiter: RateLimiter,
}

impl CommandQueue {
    pub fn new(config: QueueConfig, min_interval: Duration, burst_window: Duration) -> Self {
        CommandQueue {
            config,
            commands: VecDeque::with_capacity(config.max_len.min(64)),
            limiter: RateLimiter::new(min_interval, burst_window),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn mode(&mut self, now: Instant) -> RateMode {
        self.limiter.mode(now)
    }

    pub fn limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.limiter
    }

    /// Correlation ids in queue order.
    pub fn ids(&self) -> Vec<u32> {
        self.commands.iter().map(|c| c.id).collect()
    }

    /// Admits `command` according to the configured policy.
    pub fn enqueue(&mut self, command: Command, now: Instant) -> Result<Admission> {
        let max = self.config.max_len;
        let command = command.with_enqueued_at(now);
        if self.commands.len() < max {
            self.commands.push_back(command);
            return Ok(Admission::Queued);
        }

        match self.config.policy {
            QueuePolicy::Drop => {
                debug!("Queue full, dropping command {}", command.id);
                Err(BulbError::QueueFull { max })
            }
            QueuePolicy::Head => {
                // With a zero-length queue the newcomer is its own victim.
                if max == 0 {
                    return Err(BulbError::QueueFull { max });
                }
                self.commands.push_back(command);
                match self.commands.pop_front() {
                    Some(evicted) => {
                        debug!("Queue full, evicted oldest command {}", evicted.id);
                        Ok(Admission::Evicted(evicted))
                    }
                    None => Err(BulbError::QueueFull { max }),
                }
            }
            QueuePolicy::Random => {
                let existing = self.commands.len();
                // Only pre-existing entries are candidates; none means the
                // newcomer itself is evicted.
                if existing == 0 {
                    return Err(BulbError::QueueFull { max });
                }
                self.commands.push_back(command);
                let victim = rand::thread_rng().gen_range(0..existing);
                match self.commands.remove(victim) {
                    Some(evicted) => {
                        debug!("Queue full, evicted command {} at random", evicted.id);
                        Ok(Admission::Evicted(evicted))
                    }
                    None => Err(BulbError::QueueFull { max }),
                }
            }
            QueuePolicy::Adapt => {
                self.commands.push_back(command);
                self.limiter.enter_burst(now);
                Ok(Admission::Burst)
            }
        }
    }

    /// Takes whatever the rate limiter allows to be sent at `now`.
    ///
    /// Normal mode releases the head only; burst mode flushes the whole queue.
    /// Every released command counts as a send for the limiter.
    pub fn dequeue_ready(&mut self, now: Instant) -> Dequeue {
        let mode = self.limiter.mode(now);
        if self.commands.is_empty() {
            return Dequeue::Idle;
        }
        let permitted = self.limiter.next_permitted(now);
        if permitted > now {
            return Dequeue::Wait(permitted);
        }
        let ready: Vec<Command> = match mode {
            RateMode::Burst => self.commands.drain(..).collect(),
            RateMode::Normal => self.commands.pop_front().into_iter().collect(),
        };
        self.limiter.record_send(now);
        Dequeue::Ready(ready)
    }

    /// Empties the queue, returning what was pending.
    pub fn clear(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }
}
