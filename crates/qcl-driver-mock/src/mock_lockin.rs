//! Mock lock-in amplifier.
//!
//! Answers `features/devtype` and `features/options` from its configuration,
//! records every node write and subscription, and returns either scripted
//! poll responses or synthetic demodulator samples for the subscribed nodes.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use qcl_core::capabilities::{DetectorHandle, DetectorLink};
use qcl_core::data::{DemodSample, DemodSampleBlock, NodeValue, PollResponse};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Behaviour of a [`MockLockin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockLockinConfig {
    /// Device id returned by discovery (default: "dev4242")
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// `features/devtype` (default: "MFLI")
    #[serde(default = "default_devtype")]
    pub devtype: String,

    /// `features/options`, newline separated (default: "MF\nMD")
    #[serde(default = "default_options")]
    pub options: String,

    /// Timestamp clock in ticks per second (default: 60 MHz)
    #[serde(default = "default_clock_base")]
    pub clock_base: f64,

    /// Synthetic samples per poll and subscribed node (default: 8)
    #[serde(default = "default_samples_per_poll")]
    pub samples_per_poll: usize,

    /// Every n-th poll returns no sample node
    #[serde(default)]
    pub missing_every: Option<u32>,

    /// Every n-th poll flags data loss
    #[serde(default)]
    pub data_loss_every: Option<u32>,

    /// Refuse connections (default: false)
    #[serde(default)]
    pub refuse_connection: bool,
}

fn default_device_id() -> String {
    "dev4242".to_string()
}

fn default_devtype() -> String {
    "MFLI".to_string()
}

fn default_options() -> String {
    "MF\nMD".to_string()
}

fn default_clock_base() -> f64 {
    60e6
}

fn default_samples_per_poll() -> usize {
    8
}

impl Default for MockLockinConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            devtype: default_devtype(),
            options: default_options(),
            clock_base: default_clock_base(),
            samples_per_poll: default_samples_per_poll(),
            missing_every: None,
            data_loss_every: None,
            refuse_connection: false,
        }
    }
}

// =============================================================================
// Call log
// =============================================================================

/// One recorded [`DetectorLink`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum LockinCall {
    /// `connect(address, port)`
    Connect(String, u16),
    /// `detect_device`
    DetectDevice,
    /// `get_string(path)`
    GetString(String),
    /// `set_value(path, value)`
    SetValue(String, NodeValue),
    /// `subscribe(path)`
    Subscribe(String),
    /// `unsubscribe(path)`
    Unsubscribe(String),
    /// `sync`
    Sync,
    /// `poll(duration, timeout)`
    Poll(Duration, Duration),
    /// `clock_base`
    ClockBase,
    /// `disconnect`
    Disconnect,
}

// =============================================================================
// MockLockin
// =============================================================================

#[derive(Debug, Default)]
struct LockinState {
    calls: Vec<LockinCall>,
    open_session: Option<u32>,
    next_session: u32,
    subscriptions: Vec<String>,
    scripted: VecDeque<PollResponse>,
    polls: u32,
    next_timestamp: u64,
}

/// Simulated lock-in implementing [`DetectorLink`].
#[derive(Debug)]
pub struct MockLockin {
    config: MockLockinConfig,
    state: Mutex<LockinState>,
}

impl Default for MockLockin {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLockin {
    /// MF-family lock-in with default settings.
    pub fn new() -> Self {
        Self::with_config(MockLockinConfig::default())
    }

    /// Lock-in with the given behaviour.
    pub fn with_config(config: MockLockinConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LockinState {
                next_session: 1,
                ..Default::default()
            }),
        }
    }

    /// Behaviour this lock-in was built with.
    pub fn config(&self) -> &MockLockinConfig {
        &self.config
    }

    /// Queue a response returned by the next poll instead of synthetic data.
    pub fn push_response(&self, response: PollResponse) {
        self.state.lock().scripted.push_back(response);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<LockinCall> {
        self.state.lock().calls.clone()
    }

    /// Every node write, in order.
    pub fn set_values(&self) -> Vec<(String, NodeValue)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                LockinCall::SetValue(path, value) => Some((path.clone(), *value)),
                _ => None,
            })
            .collect()
    }

    /// Last value written to `path`.
    pub fn value_of(&self, path: &str) -> Option<NodeValue> {
        self.set_values()
            .into_iter()
            .rev()
            .find(|(p, _)| p.eq_ignore_ascii_case(path))
            .map(|(_, v)| v)
    }

    /// Subscriptions currently active.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Number of `sync` calls.
    pub fn sync_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, LockinCall::Sync))
            .count()
    }

    fn checked(&self, session: &DetectorHandle, call: LockinCall) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.open_session {
            Some(open) if open == session.raw() => Ok(()),
            _ => Err(anyhow!("session {} is not open", session.raw())),
        }
    }

    fn synthesize(&self, state: &mut LockinState) -> PollResponse {
        let poll = state.polls;
        if every(self.config.missing_every, poll) {
            return PollResponse::new();
        }
        let data_loss = every(self.config.data_loss_every, poll);
        let step = (self.config.clock_base / 1_000.0) as u64;

        let mut response = PollResponse::new();
        for path in state.subscriptions.clone() {
            let samples = (0..self.config.samples_per_poll)
                .map(|i| {
                    let phase = i as f64 * 0.1;
                    let ts = state.next_timestamp;
                    state.next_timestamp += step;
                    DemodSample {
                        x: 3e-6 * phase.cos(),
                        y: 4e-6 * phase.cos(),
                        timestamp: ts,
                    }
                })
                .collect();
            response = response.with_node(&path, DemodSampleBlock { samples, data_loss });
        }
        response
    }
}

fn every(n: Option<u32>, poll: u32) -> bool {
    matches!(n, Some(n) if n > 0 && poll % n == 0)
}

#[async_trait]
impl DetectorLink for MockLockin {
    async fn connect(&self, address: &str, port: u16) -> Result<DetectorHandle> {
        let mut state = self.state.lock();
        state
            .calls
            .push(LockinCall::Connect(address.to_string(), port));
        if self.config.refuse_connection {
            bail!("connection to {}:{} refused", address, port);
        }
        let raw = state.next_session;
        state.next_session += 1;
        state.open_session = Some(raw);
        Ok(DetectorHandle::new(raw))
    }

    async fn detect_device(&self, session: &DetectorHandle) -> Result<String> {
        self.checked(session, LockinCall::DetectDevice)?;
        Ok(self.config.device_id.clone())
    }

    async fn get_string(&self, session: &DetectorHandle, path: &str) -> Result<String> {
        self.checked(session, LockinCall::GetString(path.to_string()))?;
        let prefix = format!("/{}/", self.config.device_id.to_ascii_lowercase());
        match path.to_ascii_lowercase().strip_prefix(&prefix) {
            Some("features/devtype") => Ok(self.config.devtype.clone()),
            Some("features/options") => Ok(self.config.options.clone()),
            _ => bail!("unknown node {}", path),
        }
    }

    async fn set_value(
        &self,
        session: &DetectorHandle,
        path: &str,
        value: NodeValue,
    ) -> Result<()> {
        self.checked(session, LockinCall::SetValue(path.to_string(), value))
    }

    async fn subscribe(&self, session: &DetectorHandle, path: &str) -> Result<()> {
        self.checked(session, LockinCall::Subscribe(path.to_string()))?;
        let mut state = self.state.lock();
        if !state.subscriptions.iter().any(|p| p.eq_ignore_ascii_case(path)) {
            state.subscriptions.push(path.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, session: &DetectorHandle, path: &str) -> Result<()> {
        self.checked(session, LockinCall::Unsubscribe(path.to_string()))?;
        let mut state = self.state.lock();
        if path == "*" {
            state.subscriptions.clear();
        } else {
            state.subscriptions.retain(|p| !p.eq_ignore_ascii_case(path));
        }
        Ok(())
    }

    async fn sync(&self, session: &DetectorHandle) -> Result<()> {
        self.checked(session, LockinCall::Sync)
    }

    async fn poll(
        &self,
        session: &DetectorHandle,
        duration: Duration,
        timeout: Duration,
    ) -> Result<PollResponse> {
        self.checked(session, LockinCall::Poll(duration, timeout))?;
        let mut state = self.state.lock();
        state.polls += 1;
        if let Some(scripted) = state.scripted.pop_front() {
            return Ok(scripted);
        }
        Ok(self.synthesize(&mut state))
    }

    async fn clock_base(&self, session: &DetectorHandle, _device: &str) -> Result<f64> {
        self.checked(session, LockinCall::ClockBase)?;
        Ok(self.config.clock_base)
    }

    async fn disconnect(&self, session: DetectorHandle) -> Result<()> {
        self.checked(&session, LockinCall::Disconnect)?;
        let mut state = self.state.lock();
        state.open_session = None;
        state.subscriptions.clear();
        Ok(())
    }
}
