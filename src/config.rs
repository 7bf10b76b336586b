//! Centralized configuration for the theme life-cycle core.
//!
//! `Config` implements [`Default`] with the documented defaults, and
//! `Deserialize`/`Serialize` so a driver can load a partial TOML
//! document and fall back to the default for whatever it omits.
//!
//! ```
//! use theme_core::config::Config;
//!
//! let cfg = Config::default();
//! assert_eq!(cfg.em_restarts, 5);
//! assert!((cfg.lambda_background - 0.92).abs() < 1e-12);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ThemeError, ThemeResult};

/// All tunable parameters for an EM + Baum-Welch/Viterbi run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Themes per partition (K).
    pub k: usize,
    /// Background mixing weight λ_B ∈ (0,1).
    pub lambda_background: f64,
    /// Number of independent EM restarts per partition.
    pub em_restarts: usize,
    /// Maximum EM iterations per restart.
    pub em_max_iterations: usize,
    /// EM convergence threshold on |ΔL|.
    pub em_convergence_eps: f64,
    /// Theme-filtering factor τ applied to 1/K.
    pub theme_filter_tau: f64,
    /// Maximum Baum-Welch iterations.
    pub bw_max_iterations: usize,
    /// Convergence threshold on ‖π*−π‖₁.
    pub pi_threshold: f64,
    /// Convergence threshold on ‖A*−A‖₁.
    pub a_threshold: f64,
    /// Block size for block-parallel Baum-Welch.
    pub bw_block_size: usize,
    /// Block size for block-parallel Viterbi.
    pub viterbi_block_size: usize,
    /// Force the sequential Baum-Welch path regardless of the
    /// `T * N^2` threshold.
    pub force_sequential_baum_welch: bool,
    /// Seed driving every deterministic RNG stream in a run.
    pub rng_seed: u64,
    /// Floor substituted for a zero background probability.
    pub background_floor: f64,
    /// Floor substituted for a zero normalization denominator.
    pub denominator_floor: f64,
    /// Consecutive numerical-degeneracy events that abort a fit.
    pub max_consecutive_degeneracies: u32,
    /// Absolute tolerance for treating a re-estimated `A` entry as
    /// "still sparse".
    pub sparsity_tolerance: f64,
    /// `T * N^2` threshold below which Baum-Welch runs sequentially.
    pub sequential_fallback_threshold: u64,
    /// Optional wall-clock budget for a single fit.
    #[serde(with = "duration_secs_opt")]
    pub run_timeout: Option<std::time::Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 10,
            lambda_background: 0.92,
            em_restarts: 5,
            em_max_iterations: 30,
            em_convergence_eps: 1e-3,
            theme_filter_tau: 2.0,
            bw_max_iterations: 100,
            pi_threshold: 1e-4,
            a_threshold: 1e-4,
            bw_block_size: 1_048_576,
            viterbi_block_size: 1_048_576,
            force_sequential_baum_welch: false,
            rng_seed: 0,
            background_floor: 1e-12,
            denominator_floor: 1e-12,
            max_consecutive_degeneracies: 3,
            sparsity_tolerance: 1e-12,
            sequential_fallback_threshold: 1_000_000_000,
            run_timeout: None,
        }
    }
}

impl Config {
    /// Parses a `Config` from a TOML document, filling any omitted
    /// field with its default.
    pub fn from_toml_str(s: &str) -> ThemeResult<Self> {
        toml::from_str(s).map_err(|e| ThemeError::InvalidConfiguration(e.to_string()))
    }

    /// Validates the parameters that are fatal if out of range.
    /// Called by [`crate::em::fit_em`] and
    /// [`crate::driver`] before doing any work.
    pub fn validate(&self) -> ThemeResult<()> {
        if self.k == 0 {
            return Err(ThemeError::InvalidConfiguration(
                "k must be >= 1".to_string(),
            ));
        }
        if !(self.lambda_background > 0.0 && self.lambda_background < 1.0) {
            return Err(ThemeError::InvalidConfiguration(format!(
                "lambda_background must be in (0,1), got {}",
                self.lambda_background
            )));
        }
        if self.em_restarts == 0 {
            return Err(ThemeError::InvalidConfiguration(
                "em_restarts must be >= 1".to_string(),
            ));
        }
        if self.em_max_iterations == 0 {
            return Err(ThemeError::InvalidConfiguration(
                "em_max_iterations must be >= 1".to_string(),
            ));
        }
        if self.bw_block_size == 0 || self.viterbi_block_size == 0 {
            return Err(ThemeError::InvalidConfiguration(
                "block sizes must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.em_max_iterations, 30);
        assert_eq!(cfg.bw_max_iterations, 100);
        assert_eq!(cfg.bw_block_size, 1_048_576);
        assert!(cfg.run_timeout.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_k() {
        let mut cfg = Config::default();
        cfg.k = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ThemeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_bad_lambda() {
        let mut cfg = Config::default();
        cfg.lambda_background = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = Config::from_toml_str("k = 7\nem_restarts = 2\n").unwrap();
        assert_eq!(cfg.k, 7);
        assert_eq!(cfg.em_restarts, 2);
        // Untouched fields keep their default.
        assert!((cfg.lambda_background - 0.92).abs() < 1e-12);
    }
}
