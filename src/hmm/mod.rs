//! Hidden Markov Model storage and construction.
//!
//! State 0 is always the background state; states `1..N` are themes.
//! `A` (transition) and `pi` (initial distribution) are trained by
//! [`baum_welch`]; `B` (emission) is derived once from the EM themes
//! and held fixed during training.

pub mod baum_welch;
pub mod viterbi;

use serde::{Deserialize, Serialize};

use crate::error::{ThemeError, ThemeResult};
use crate::numeric::Matrix;
use crate::types::{BackgroundModel, Theme};

/// The full parameter set of one HMM: `pi` (length `N`), `A` (`N x N`,
/// row-stochastic), `B` (`N x M`, row-stochastic, fixed at
/// construction time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hmm {
    pub num_states: usize,
    pub vocabulary_size: usize,
    pub pi: Vec<f64>,
    pub a: Matrix,
    #[serde(skip_serializing_if = "Option::is_none")]
    b: Option<Matrix>,
}

impl Hmm {
    /// Builds an HMM with the default "background + self-loop" initial
    /// conditions: uniform `pi`, and
    /// `A[i][i] = 0.9, A[i][0] = 0.1` for every theme state `i != 0`,
    /// `A[0][j] = 1/N` for every `j` (including self).
    pub fn with_default_initial_conditions(
        background: &BackgroundModel,
        themes: &[Theme],
    ) -> ThemeResult<Self> {
        if themes.is_empty() {
            return Err(ThemeError::EmptyInput(
                "at least one theme is required to build an HMM".to_string(),
            ));
        }
        let num_states = themes.len() + 1;
        let vocabulary_size = background.vocabulary_size();

        let mut b = Matrix::zeros(num_states, vocabulary_size);
        b.row_mut(0).copy_from_slice(&background.probabilities);
        for (i, theme) in themes.iter().enumerate() {
            b.row_mut(i + 1).copy_from_slice(&theme.word_distribution);
        }

        let mut a = Matrix::zeros(num_states, num_states);
        for j in 0..num_states {
            a.set(0, j, 1.0 / num_states as f64);
        }
        for i in 1..num_states {
            a.set(i, i, 0.9);
            a.set(i, 0, 0.1);
        }

        let pi = vec![1.0 / num_states as f64; num_states];

        Ok(Self {
            num_states,
            vocabulary_size,
            pi,
            a,
            b: Some(b),
        })
    }

    /// Builds an HMM from explicit, already-validated parameters
    /// (used by tests and by a driver restoring a previously trained
    /// model).
    pub fn from_parameters(pi: Vec<f64>, a: Matrix, b: Matrix) -> ThemeResult<Self> {
        let num_states = pi.len();
        if a.rows() != num_states || a.cols() != num_states {
            return Err(ThemeError::InvalidConfiguration(format!(
                "A must be {num_states} x {num_states}, got {} x {}",
                a.rows(),
                a.cols()
            )));
        }
        if b.rows() != num_states {
            return Err(ThemeError::InvalidConfiguration(format!(
                "B must have {num_states} rows, got {}",
                b.rows()
            )));
        }
        Ok(Self {
            num_states,
            vocabulary_size: b.cols(),
            pi,
            a,
            b: Some(b),
        })
    }

    pub fn emissions(&self) -> &Matrix {
        self.b.as_ref().expect("Hmm always constructed with B set")
    }

    pub fn emission(&self, state: usize, word: u32) -> f64 {
        self.emissions().get(state, word as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn themes(k: usize, vocab: usize) -> Vec<Theme> {
        (0..k)
            .map(|_| Theme {
                word_distribution: vec![1.0 / vocab as f64; vocab],
                top_documents: vec![],
                average_pi: 0.5,
            })
            .collect()
    }

    #[test]
    fn default_initial_conditions_are_row_stochastic() {
        let background = BackgroundModel {
            probabilities: vec![0.5, 0.5],
        };
        let hmm = Hmm::with_default_initial_conditions(&background, &themes(2, 2)).unwrap();
        assert_eq!(hmm.num_states, 3);
        for i in 0..hmm.num_states {
            let sum: f64 = hmm.a.row(i).iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
        let pi_sum: f64 = hmm.pi.iter().sum();
        assert!((pi_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn self_loop_structure_matches_background_plus_themes_design() {
        let background = BackgroundModel {
            probabilities: vec![1.0],
        };
        let hmm = Hmm::with_default_initial_conditions(&background, &themes(1, 1)).unwrap();
        assert!((hmm.a.get(1, 1) - 0.9).abs() < 1e-12);
        assert!((hmm.a.get(1, 0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn empty_theme_list_is_rejected() {
        let background = BackgroundModel {
            probabilities: vec![1.0],
        };
        assert!(Hmm::with_default_initial_conditions(&background, &[]).is_err());
    }
}
