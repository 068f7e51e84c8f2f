//! Synchronized detection through the lock-in amplifier.
//!
//! [`AcquisitionSession`] owns the lock-in session. [`configure`] brings the
//! instrument to a known state for demodulated sampling of the laser signal;
//! [`collect`] runs one subscribe/poll/unsubscribe cycle and appends the
//! magnitudes and time axis to an [`AcquisitionBuffer`].
//!
//! [`configure`]: AcquisitionSession::configure
//! [`collect`]: AcquisitionSession::collect

mod collect;
mod configure;

pub use collect::CycleSummary;

use qcl_core::capabilities::{DetectorHandle, DetectorLink};
use qcl_core::data::{DetectorConfiguration, DeviceFamily};
use qcl_core::error::{FaultContext, QclError, QclResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

// =============================================================================
// AcquisitionBuffer
// =============================================================================

/// Per-cycle magnitude and time sequences, index-aligned with poll cycles.
///
/// Both sequences always have the same length; a cycle without samples adds
/// an empty entry to each.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcquisitionBuffer {
    magnitudes: Vec<Vec<f64>>,
    times: Vec<Vec<f64>>,
}

impl AcquisitionBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one cycle. Callers pass equal-length sequences.
    pub(crate) fn push_cycle(&mut self, magnitudes: Vec<f64>, times: Vec<f64>) {
        self.magnitudes.push(magnitudes);
        self.times.push(times);
    }

    /// Magnitude sequences, one per cycle.
    pub fn magnitudes(&self) -> &[Vec<f64>] {
        &self.magnitudes
    }

    /// Time sequences in seconds, one per cycle.
    pub fn times(&self) -> &[Vec<f64>] {
        &self.times
    }

    /// Number of cycles recorded.
    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    /// True when no cycle has been recorded.
    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    /// Samples per cycle.
    pub fn cycle_lengths(&self) -> Vec<usize> {
        self.magnitudes.iter().map(Vec::len).collect()
    }
}

// =============================================================================
// AcquisitionSession
// =============================================================================

/// An open lock-in session.
///
/// Dropping a session that is still open schedules the disconnect on the
/// current Tokio runtime.
pub struct AcquisitionSession {
    link: Arc<dyn DetectorLink>,
    session: Option<DetectorHandle>,
    device: String,
    config: DetectorConfiguration,
    family: Option<DeviceFamily>,
    modulation_hz: Option<f64>,
}

impl std::fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("session", &self.session)
            .field("device", &self.device)
            .field("family", &self.family)
            .field("modulation_hz", &self.modulation_hz)
            .finish()
    }
}

impl AcquisitionSession {
    /// Connect to the data server and identify the device.
    #[instrument(skip(link, config), fields(address = %config.address, port = config.port), err)]
    pub async fn connect(
        link: Arc<dyn DetectorLink>,
        config: DetectorConfiguration,
    ) -> QclResult<Self> {
        let session = link
            .connect(&config.address, config.port)
            .await
            .detector_fault("connecting to lock-in")?;

        let detected = link.detect_device(&session).await;
        let device = match detected {
            Ok(device) => device.to_ascii_lowercase(),
            Err(e) => {
                if let Err(close) = link.disconnect(session).await {
                    warn!(error = %close, "lock-in disconnect failed");
                }
                return Err(QclError::Detector(format!(
                    "identifying lock-in device: {e:#}"
                )));
            }
        };
        info!(%device, "connected to lock-in");

        Ok(Self {
            link,
            session: Some(session),
            device,
            config,
            family: None,
            modulation_hz: None,
        })
    }

    /// Device id (e.g. `dev4242`).
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Family detected by [`configure`](Self::configure).
    pub fn family(&self) -> Option<DeviceFamily> {
        self.family
    }

    /// Reference oscillator frequency last written, in Hz.
    pub fn modulation_frequency(&self) -> Option<f64> {
        self.modulation_hz
    }

    /// Settings this session was opened with.
    pub fn config(&self) -> &DetectorConfiguration {
        &self.config
    }

    /// Absolute path of a device node.
    pub(crate) fn node(&self, suffix: &str) -> String {
        format!("/{}/{}", self.device, suffix)
    }

    pub(crate) fn parts(&self) -> QclResult<(&dyn DetectorLink, &DetectorHandle)> {
        match &self.session {
            Some(session) => Ok((self.link.as_ref(), session)),
            None => Err(QclError::Detector("lock-in session closed".to_string())),
        }
    }

    /// Collect `cycles` cycles into a new buffer.
    pub async fn collect_cycles(&self, cycles: usize) -> QclResult<AcquisitionBuffer> {
        let mut buffer = AcquisitionBuffer::new();
        for _ in 0..cycles {
            self.collect(&mut buffer).await?;
        }
        Ok(buffer)
    }

    /// Close the session. Failures are logged; calling it again does nothing.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            match self.link.disconnect(session).await {
                Ok(()) => info!(device = %self.device, "lock-in disconnected"),
                Err(e) => warn!(device = %self.device, error = %e, "lock-in disconnect failed"),
            }
        }
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!(device = %self.device, "lock-in session dropped while open, scheduling disconnect");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let link = Arc::clone(&self.link);
                runtime.spawn(async move {
                    if let Err(e) = link.disconnect(session).await {
                        warn!(error = %e, "lock-in disconnect failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!("no runtime available, lock-in session left open");
            }
        }
    }
}
