//! Numerical core of a theme life-cycle analysis pipeline: EM theme
//! extraction against a fixed background word distribution, and a
//! background-plus-themes Hidden Markov Model trained with
//! (optionally block-parallel) scaled Baum-Welch and decoded with
//! (optionally block-parallel) Viterbi.
//!
//! This crate owns none of tokenization, persistence, or the outer
//! CLI/service surface — it consumes already-vocabulary-indexed
//! documents through [`vocab::Vocabulary`] and [`types::Document`],
//! and returns themes, a trained [`hmm::Hmm`], and a decoded state
//! path for a driver to act on.

pub mod config;
pub mod driver;
pub mod em;
pub mod error;
pub mod executor;
pub mod hmm;
pub mod numeric;
pub mod scan;
pub mod types;
pub mod vocab;

pub use config::Config;
pub use error::{ThemeError, ThemeResult};
pub use hmm::Hmm;
