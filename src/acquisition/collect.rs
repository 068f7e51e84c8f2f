//! One subscribe/poll/unsubscribe acquisition cycle.

use crate::acquisition::{AcquisitionBuffer, AcquisitionSession};
use qcl_core::capabilities::{DetectorHandle, DetectorLink};
use qcl_core::data::DemodSampleBlock;
use qcl_core::error::{FaultContext, QclResult};
use serde::Serialize;
use tracing::{debug, instrument, warn};

/// What one cycle added to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    /// Samples appended.
    pub samples: usize,
    /// The instrument reported lost samples.
    pub data_loss: bool,
    /// The poll returned no block for the subscribed node.
    pub missing: bool,
}

/// Magnitudes and seconds since device start for one block.
fn convert(block: &DemodSampleBlock, clock_base: f64) -> (Vec<f64>, Vec<f64>) {
    block
        .samples
        .iter()
        .map(|s| (s.magnitude(), s.timestamp as f64 / clock_base))
        .unzip()
}

impl AcquisitionSession {
    /// Run one acquisition cycle and append its result to `buffer`.
    ///
    /// Subscriptions are always cleared before returning, whether or not the
    /// poll succeeded. A cycle in which the node returned no block appends an
    /// empty entry to both sequences so they stay index-aligned.
    #[instrument(skip(self, buffer), fields(device = %self.device, cycle = buffer.len()), err)]
    pub async fn collect(&self, buffer: &mut AcquisitionBuffer) -> QclResult<CycleSummary> {
        let (link, session) = self.parts()?;
        let path = self.node(&format!("demods/{}/sample", self.config.demod_channel));

        let result = self.poll_cycle(link, session, &path, buffer).await;

        let cleared = link
            .unsubscribe(session, "*")
            .await
            .detector_fault("clearing subscriptions");
        match (result, cleared) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unsub)) => {
                warn!(error = %unsub, "unsubscribe after failed cycle also failed");
                Err(e)
            }
        }
    }

    async fn poll_cycle(
        &self,
        link: &dyn DetectorLink,
        session: &DetectorHandle,
        path: &str,
        buffer: &mut AcquisitionBuffer,
    ) -> QclResult<CycleSummary> {
        link.sync(session).await.detector_fault("syncing lock-in")?;
        link.subscribe(session, path)
            .await
            .detector_fault(&format!("subscribing to {path}"))?;

        let response = link
            .poll(session, self.config.poll_length, self.config.poll_timeout)
            .await
            .detector_fault("polling lock-in")?;

        let Some(block) = response.sample(path) else {
            warn!(%path, "no samples returned for node");
            buffer.push_cycle(Vec::new(), Vec::new());
            return Ok(CycleSummary {
                samples: 0,
                data_loss: false,
                missing: true,
            });
        };

        let clock_base = link
            .clock_base(session, &self.device)
            .await
            .detector_fault("reading clock base")?;
        if block.data_loss {
            warn!(%path, samples = block.samples.len(), "lock-in reported data loss");
        }

        let (magnitudes, times) = convert(block, clock_base);
        let samples = magnitudes.len();
        buffer.push_cycle(magnitudes, times);
        debug!(samples, "cycle collected");

        Ok(CycleSummary {
            samples,
            data_loss: block.data_loss,
            missing: false,
        })
    }
}
