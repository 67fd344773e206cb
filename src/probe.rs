use tracing::debug;

use crate::{
    error::{ConfigError, Result},
    plan::ProbeBinding,
    registry::{Retention, SignalRegistry},
    signal::Signal,
};

/// A probe recorded while building, bound once every partition is lowered.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub key: u64,
    pub label: String,
    pub partition: u32,
    pub target: Signal,
    pub sample_every: Option<f64>,
}

/// Steps between samples: `max(1, round(sample_every / dt))`, or 1 when no
/// interval is given.
pub fn sampling_period(
    probe: &str,
    sample_every: Option<f64>,
    dt: f64,
) -> Result<u64> {
    let sample_every = match sample_every {
        Some(s) => s,
        None => return Ok(1),
    };
    if !sample_every.is_finite() || sample_every <= 0. {
        Err(ConfigError::InvalidProbePeriod {
            probe: probe.into(),
            sample_every,
        })?
    }
    Ok(libm::round(sample_every / dt).max(1.) as u64)
}

/// Resolves each probe's target in its own partition.
///
/// A target no partition holds is transmitted to the probe's partition
/// unchanged. A target held only elsewhere is an error.
pub fn bind(
    requests: &[ProbeRequest],
    registry: &mut SignalRegistry,
    dt: f64,
) -> Result<Vec<ProbeBinding>> {
    let mut bindings = Vec::with_capacity(requests.len());
    for request in requests {
        let key = registry.identify(&request.target);
        let holders = registry.holders(key);
        if holders.is_empty() {
            registry.register(request.partition, &request.target, Retention::Keep)?;
        } else if !holders.contains(&request.partition) {
            Err(ConfigError::ProbeTargetMissing {
                probe: request.label.clone(),
                signal: request.target.to_string(),
                partition: request.partition,
            })?
        }
        let period = sampling_period(&request.label, request.sample_every, dt)?;
        debug!(
            "probe {} reads {} in partition {} every {} steps",
            request.label, request.target, request.partition, period
        );
        bindings.push(ProbeBinding {
            probe: request.key,
            label: request.label.clone(),
            partition: request.partition,
            signal: key.get(),
            period,
        });
    }
    Ok(bindings)
}
