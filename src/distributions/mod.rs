use crate::error::{SimError, SimResult};
use rand::Rng;
use rand_distr::{Distribution as _, Exp, LogNormal, Weibull};
use serde::{Deserialize, Serialize};

/// A duration or inter-arrival time distribution, in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Distribution {
    Exponential { rate: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Weibull { shape: f64, scale: f64 },
    /// Observed values, drawn uniformly.
    Empirical { values: Vec<f64> },
    Fixed { value: f64 },
}

impl Distribution {
    pub fn validate(&self) -> SimResult<()> {
        match self {
            Distribution::Exponential { rate } => positive("exponential rate", *rate),
            Distribution::LogNormal { mu, sigma } => {
                if !mu.is_finite() {
                    return Err(SimError::InvalidParameter(format!(
                        "lognormal mu must be finite, got {}",
                        mu
                    )));
                }
                non_negative("lognormal sigma", *sigma)
            }
            Distribution::Weibull { shape, scale } => {
                positive("weibull shape", *shape)?;
                positive("weibull scale", *scale)
            }
            Distribution::Empirical { values } => {
                if values.is_empty() {
                    return Err(SimError::InvalidParameter(
                        "empirical table must not be empty".to_string(),
                    ));
                }
                values
                    .iter()
                    .try_for_each(|&v| non_negative("empirical value", v))
            }
            Distribution::Fixed { value } => non_negative("fixed value", *value),
        }
    }

    /// Draw one non-negative variate.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SimResult<f64> {
        self.validate()?;

        let value = match self {
            Distribution::Exponential { rate } => Exp::new(*rate)
                .map_err(|e| SimError::InvalidParameter(format!("exponential: {}", e)))?
                .sample(rng),
            Distribution::LogNormal { mu, sigma } => LogNormal::new(*mu, *sigma)
                .map_err(|e| SimError::InvalidParameter(format!("lognormal: {}", e)))?
                .sample(rng),
            Distribution::Weibull { shape, scale } => Weibull::new(*scale, *shape)
                .map_err(|e| SimError::InvalidParameter(format!("weibull: {}", e)))?
                .sample(rng),
            Distribution::Empirical { values } => values[rng.gen_range(0..values.len())],
            Distribution::Fixed { value } => *value,
        };

        Ok(value.max(0.0))
    }

    pub fn mean(&self) -> f64 {
        match self {
            Distribution::Exponential { rate } => 1.0 / rate,
            Distribution::LogNormal { mu, sigma } => (mu + sigma * sigma / 2.0).exp(),
            Distribution::Weibull { shape, scale } => scale * gamma(1.0 + 1.0 / shape),
            Distribution::Empirical { values } => {
                values.iter().sum::<f64>() / values.len().max(1) as f64
            }
            Distribution::Fixed { value } => *value,
        }
    }
}

fn positive(name: &str, value: f64) -> SimResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!(
            "{} must be positive and finite, got {}",
            name, value
        )))
    }
}

fn non_negative(name: &str, value: f64) -> SimResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!(
            "{} must be non-negative and finite, got {}",
            name, value
        )))
    }
}

fn gamma(x: f64) -> f64 {
    crate::stats::special::ln_gamma(x).exp()
}
