use typed_builder::TypedBuilder;

use crate::error::{ConfigError, Result};

/// Parameters that shape the lowered plan.
#[derive(Debug, Clone, TypedBuilder)]
pub struct LoweringConfig {
    /// Simulation step in seconds.
    #[builder(default = 0.001)]
    pub dt: f64,
    /// Lowpass and Alpha filters with `tau <= filter_skip_ratio * dt` keep
    /// their continuous coefficients.
    #[builder(default = 0.03)]
    pub filter_skip_ratio: f64,
    #[builder(default, setter(strip_option, into))]
    pub label: Option<String>,
    /// zstd level used when encoding partition plans.
    #[builder(default = 3)]
    pub compression_level: i32,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LoweringConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.dt.is_finite() || self.dt <= 0. {
            Err(ConfigError::InvalidStep(self.dt))?;
        }
        Ok(())
    }

    pub fn plan_label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("model, dt={:.6}", self.dt),
        }
    }
}
