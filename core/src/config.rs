//! Watchdog timeout configuration.
//!
//! Timeouts are per-operation, not per-connection-lifetime: a device with
//! many short successful exchanges never accumulates timeout budget.

use crate::error::LinkError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable deadlines for the session watchdogs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTimeouts {
    /// Connection establishment (also bounds disconnect confirmation).
    pub connect: Duration,
    /// First inbound fragment after a command is fully acknowledged.
    pub first_response: Duration,
    /// Gap between consecutive inbound fragments of one response.
    pub inter_fragment_response: Duration,
    /// Acknowledgement of one outbound fragment, steady state.
    pub send_ack: Duration,
    /// Acknowledgement of the very first fragment of a message.
    pub first_send_ack: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(20),
            first_response: Duration::from_millis(1500),
            inter_fragment_response: Duration::from_millis(200),
            send_ack: Duration::from_millis(200),
            first_send_ack: Duration::from_millis(100),
        }
    }
}

impl LinkTimeouts {
    pub fn with_connect(mut self, value: Duration) -> Self {
        self.connect = value;
        self
    }

    pub fn with_first_response(mut self, value: Duration) -> Self {
        self.first_response = value;
        self
    }

    pub fn with_inter_fragment_response(mut self, value: Duration) -> Self {
        self.inter_fragment_response = value;
        self
    }

    pub fn with_send_ack(mut self, value: Duration) -> Self {
        self.send_ack = value;
        self
    }

    pub fn with_first_send_ack(mut self, value: Duration) -> Self {
        self.first_send_ack = value;
        self
    }

    /// Read one timeout by its configuration name.
    pub fn get(&self, name: &str) -> Result<Duration, LinkError> {
        match name {
            "connect" => Ok(self.connect),
            "first-response" => Ok(self.first_response),
            "inter-fragment-response" => Ok(self.inter_fragment_response),
            "send-ack" => Ok(self.send_ack),
            "first-send-ack" => Ok(self.first_send_ack),
            other => Err(LinkError::UnknownTimeout(other.to_string())),
        }
    }

    /// Set one timeout by its configuration name.
    pub fn set(&mut self, name: &str, value: Duration) -> Result<(), LinkError> {
        match name {
            "connect" => self.connect = value,
            "first-response" => self.first_response = value,
            "inter-fragment-response" => self.inter_fragment_response = value,
            "send-ack" => self.send_ack = value,
            "first-send-ack" => self.first_send_ack = value,
            other => return Err(LinkError::UnknownTimeout(other.to_string())),
        }
        Ok(())
    }

    /// Names accepted by [`get`](Self::get) and [`set`](Self::set).
    pub fn names() -> &'static [&'static str] {
        &[
            "connect",
            "first-response",
            "inter-fragment-response",
            "send-ack",
            "first-send-ack",
        ]
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        for name in Self::names() {
            let value = self.get(name)?;
            if value.is_zero() {
                return Err(LinkError::UnknownTimeout(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}
