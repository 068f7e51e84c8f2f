//! Lock-in setup for demodulated sampling of the laser signal.

use crate::acquisition::AcquisitionSession;
use qcl_core::data::{has_option, DeviceFamily, NodeValue};
use qcl_core::error::{FaultContext, QclError, QclResult};
use tracing::{debug, info, instrument};

/// Demodulator filter order (24 dB/oct).
const FILTER_ORDER: i64 = 4;

/// Reference trigger threshold in volts.
const TRIGGER_LEVEL_V: f64 = 0.5;

/// ADC select value for the second demodulator (trigger input 1).
const TRIGGER_ADC: i64 = 8;

fn check_modulation(frequency_hz: f64) -> QclResult<()> {
    if frequency_hz.is_finite() && frequency_hz > 0.0 {
        Ok(())
    } else {
        Err(QclError::Configuration(format!(
            "modulation frequency must be positive, got {frequency_hz}"
        )))
    }
}

impl AcquisitionSession {
    async fn set(&self, suffix: &str, value: impl Into<NodeValue>) -> QclResult<()> {
        let (link, session) = self.parts()?;
        let path = self.node(suffix);
        let value = value.into();
        debug!(%path, ?value, "set node");
        link.set_value(session, &path, value)
            .await
            .detector_fault(&format!("setting {path}"))
    }

    async fn read(&self, suffix: &str) -> QclResult<String> {
        let (link, session) = self.parts()?;
        let path = self.node(suffix);
        link.get_string(session, &path)
            .await
            .detector_fault(&format!("reading {path}"))
    }

    /// Point the reference oscillator at the laser modulation frequency.
    ///
    /// Called by [`configure`](Self::configure) and again whenever the laser
    /// pulse rate changes while sampling.
    pub async fn set_modulation_frequency(&mut self, frequency_hz: f64) -> QclResult<()> {
        check_modulation(frequency_hz)?;
        let osc = format!("oscs/{}/freq", self.config.osc_channel);
        self.set(&osc, frequency_hz).await?;
        info!(frequency_hz, "reference oscillator set");
        self.modulation_hz = Some(frequency_hz);
        Ok(())
    }

    /// Bring the lock-in to a known state for a laser pulsing at
    /// `modulation_hz`.
    ///
    /// Every demodulator, trigger and signal output is quiesced before any
    /// configuration node is written. Family-specific steps follow the
    /// [`DeviceFamily`] capability table; an unknown device type fails before
    /// anything family-specific is touched. Ends with an unsubscribe-all, a
    /// sync and a wait of [`settle_delay`] so the demodulator filters settle.
    ///
    /// [`settle_delay`]: qcl_core::data::DetectorConfiguration::settle_delay
    #[instrument(skip(self), fields(device = %self.device), err)]
    pub async fn configure(&mut self, modulation_hz: f64) -> QclResult<DeviceFamily> {
        check_modulation(modulation_hz)?;
        let devtype = self.read("features/devtype").await?;
        let options = self.read("features/options").await?;

        // Quiesce
        self.set("demods/*/rate", 0.0).await?;
        self.set("demods/*/trigger", 0i64).await?;
        self.set("sigouts/*/enables/*", 0i64).await?;

        let family = DeviceFamily::from_devtype(&devtype)?;
        let caps = family.capabilities();
        info!(%devtype, ?family, "lock-in family detected");
        if caps.disable_demods {
            self.set("demods/*/enable", 0i64).await?;
        }
        if caps.disable_scopes {
            self.set("scopes/*/enable", 0i64).await?;
        }
        if caps.reset_scope_trigger {
            self.set("scopes/*/trigchannel", -1i64).await?;
        }

        let cfg = self.config.clone();
        let input = format!("sigins/{}", cfg.input_channel);
        self.set(&format!("{input}/imp50"), 0i64).await?;
        self.set(&format!("{input}/ac"), 1i64).await?;
        self.set(&format!("{input}/diff"), 0i64).await?;
        self.set(&format!("{input}/float"), 0i64).await?;
        self.set(&format!("{input}/range"), cfg.input_range_v).await?;

        let demod = format!("demods/{}", cfg.demod_channel);
        self.set("demods/*/phaseshift", 0.0).await?;
        self.set("demods/*/order", FILTER_ORDER).await?;
        self.set(&format!("{demod}/rate"), cfg.demod_rate).await?;
        self.set(&format!("{demod}/harmonic"), 1i64).await?;
        if caps.explicit_demod_enable {
            self.set(&format!("{demod}/enable"), 1i64).await?;
        }
        if has_option(&options, "MF") {
            self.set("demods/*/oscselect", i64::from(cfg.osc_channel))
                .await?;
            self.set("demods/*/adcselect", i64::from(cfg.input_channel))
                .await?;
        }
        self.set("demods/*/timeconstant", cfg.time_constant_s).await?;
        self.set_modulation_frequency(modulation_hz).await?;

        // External reference locked to the laser trigger on demod 1.
        self.set("extrefs/0/enable", 1i64).await?;
        self.set("triggers/in/0/level", TRIGGER_LEVEL_V).await?;
        self.set("demods/0/adcselect", 0i64).await?;
        self.set("demods/1/adcselect", TRIGGER_ADC).await?;

        let (link, session) = self.parts()?;
        link.unsubscribe(session, "*")
            .await
            .detector_fault("clearing subscriptions")?;
        link.sync(session).await.detector_fault("syncing lock-in")?;

        let settle = cfg.settle_delay();
        info!(?settle, "waiting for demodulator filters to settle");
        tokio::time::sleep(settle).await;

        self.family = Some(family);
        Ok(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qcl_core::data::DetectorConfiguration;
    use qcl_driver_mock::{LockinCall, MockLockin, MockLockinConfig};
    use std::sync::Arc;

    async fn configured(devtype: &str, options: &str) -> (Arc<MockLockin>, QclResult<DeviceFamily>) {
        let lockin = Arc::new(MockLockin::with_config(MockLockinConfig {
            devtype: devtype.into(),
            options: options.into(),
            ..Default::default()
        }));
        let mut acq = AcquisitionSession::connect(lockin.clone(), DetectorConfiguration::default())
            .await
            .unwrap();
        let result = acq.configure(100_000.0).await;
        (lockin, result)
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiesce_precedes_configuration() {
        let (lockin, family) = configured("MFLI", "MF\nMD").await;
        assert_eq!(family.unwrap(), DeviceFamily::Mf);

        let writes: Vec<String> = lockin.set_values().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            &writes[..3],
            [
                "/dev4242/demods/*/rate",
                "/dev4242/demods/*/trigger",
                "/dev4242/sigouts/*/enables/*"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mf_family_nodes() {
        let (lockin, _) = configured("MFLI", "MF\nMD").await;

        assert_eq!(lockin.value_of("/dev4242/scopes/*/enable"), Some(NodeValue::Int(0)));
        assert_eq!(lockin.value_of("/dev4242/demods/*/enable"), None);
        assert_eq!(lockin.value_of("/dev4242/demods/*/oscselect"), Some(NodeValue::Int(0)));
        assert_eq!(lockin.value_of("/dev4242/demods/0/adcselect"), Some(NodeValue::Int(0)));
        assert_eq!(lockin.value_of("/dev4242/demods/1/adcselect"), Some(NodeValue::Int(8)));
        assert_eq!(
            lockin.value_of("/dev4242/oscs/0/freq"),
            Some(NodeValue::Double(100_000.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_uhf_enables_demod_explicitly() {
        let (lockin, family) = configured("UHFLI", "").await;
        assert_eq!(family.unwrap(), DeviceFamily::Uhf);
        assert_eq!(lockin.value_of("/dev4242/demods/*/enable"), Some(NodeValue::Int(0)));
        assert_eq!(lockin.value_of("/dev4242/demods/0/enable"), Some(NodeValue::Int(1)));
        // No MF option: oscillator select is left alone.
        assert_eq!(lockin.value_of("/dev4242/demods/*/oscselect"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hf2_resets_scope_trigger() {
        let (lockin, _) = configured("HF2LI", "").await;
        assert_eq!(
            lockin.value_of("/dev4242/scopes/*/trigchannel"),
            Some(NodeValue::Int(-1))
        );
        assert_eq!(lockin.value_of("/dev4242/scopes/*/enable"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_family_fails_after_quiesce() {
        let (lockin, family) = configured("XYZ", "").await;
        assert!(matches!(family, Err(QclError::Detector(_))));

        // Quiesce still ran, nothing family-specific did.
        assert_eq!(lockin.set_values().len(), 3);
        assert!(!lockin.calls().contains(&LockinCall::Sync));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_ends_with_sync_and_settle() {
        let start = tokio::time::Instant::now();
        let (lockin, _) = configured("MFLI", "MF").await;

        let calls = lockin.calls();
        assert_eq!(calls.last(), Some(&LockinCall::Sync));
        assert_eq!(
            calls[calls.len() - 2],
            LockinCall::Unsubscribe("*".into())
        );
        // 10 time constants of 10 ms.
        assert!(start.elapsed() >= std::time::Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oscillator_follows_modulation_frequency() {
        let lockin = Arc::new(MockLockin::new());
        let mut acq = AcquisitionSession::connect(lockin.clone(), DetectorConfiguration::default())
            .await
            .unwrap();

        acq.configure(50_000.0).await.unwrap();
        assert_eq!(
            lockin.value_of("/dev4242/oscs/0/freq"),
            Some(NodeValue::Double(50_000.0))
        );
        assert_eq!(acq.modulation_frequency(), Some(50_000.0));

        acq.set_modulation_frequency(80_000.0).await.unwrap();
        assert_eq!(
            lockin.value_of("/dev4242/oscs/0/freq"),
            Some(NodeValue::Double(80_000.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_modulation_is_rejected() {
        let lockin = Arc::new(MockLockin::new());
        let mut acq = AcquisitionSession::connect(lockin.clone(), DetectorConfiguration::default())
            .await
            .unwrap();

        let err = acq.configure(0.0).await.unwrap_err();
        assert!(matches!(err, QclError::Configuration(_)), "{err}");
        assert!(lockin.set_values().is_empty());
        assert_eq!(acq.family(), None);
    }
}
