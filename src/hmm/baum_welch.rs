//! Scaled Baum-Welch training: sequential forward-backward and
//! a block-parallel variant built from the same three-phase
//! decomposition as [`crate::scan`] (local pass, sequential reduce,
//! finalize), specialized here because each phase also needs to carry
//! a numerical scaling factor that the fully generic scan engine
//! doesn't model.

use std::time::Instant;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ThemeError, ThemeResult};
use crate::executor::Executor;
use crate::hmm::Hmm;
use crate::numeric::{normalize_vec_in_place, vec_l1_distance, Matrix};
use crate::types::{BwDiagnostics, ObservationSequence, ScanBlock};
use crate::vocab::WordId;

/// Trains `hmm`'s `pi` and `A` in place against `observations`,
/// choosing the sequential or block-parallel path per
/// `config.force_sequential_baum_welch` and
/// `config.sequential_fallback_threshold`, with one-time sparsity
/// detection on the initial `A`.
pub fn train(
    hmm: &mut Hmm,
    observations: &ObservationSequence,
    config: &Config,
    executor: &impl Executor,
) -> ThemeResult<BwDiagnostics> {
    config.validate()?;
    if observations.is_empty() {
        return Err(ThemeError::EmptyInput(
            "observation sequence is empty".to_string(),
        ));
    }

    let n = hmm.num_states;
    let t = observations.len();
    let work = (t as u64).saturating_mul(n as u64).saturating_mul(n as u64);
    let use_block_parallel =
        !config.force_sequential_baum_welch && work >= config.sequential_fallback_threshold;

    let sparse = detect_sparsity(&hmm.a, config.sparsity_tolerance);

    info!(
        num_states = n,
        num_observations = t,
        use_block_parallel,
        sparse,
        "starting Baum-Welch training"
    );

    let mut consecutive_degeneracies = 0u32;
    let mut last_log_likelihood = f64::NEG_INFINITY;
    let mut final_pi_delta = f64::INFINITY;
    let mut final_a_delta = f64::INFINITY;
    let mut converged = false;
    let mut iterations_run = 0usize;
    let mut sparse_still_holds = sparse;
    let start = Instant::now();

    for iteration in 0..config.bw_max_iterations {
        if executor.is_cancelled() {
            return Err(ThemeError::Cancelled);
        }
        if let Some(timeout) = config.run_timeout {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ThemeError::TimedOut(elapsed));
            }
        }

        iterations_run = iteration + 1;

        let stats = if use_block_parallel {
            forward_backward_block_parallel(hmm, &observations.observations, config, executor)
        } else {
            forward_backward_sequential(hmm, &observations.observations, config)
        };

        let stats = match stats {
            Ok(s) => {
                consecutive_degeneracies = 0;
                s
            }
            Err(ThemeError::NumericalDegeneracy(msg)) => {
                consecutive_degeneracies += 1;
                warn!(iteration, %msg, consecutive_degeneracies, "Baum-Welch numerical degeneracy");
                if consecutive_degeneracies >= config.max_consecutive_degeneracies {
                    return Err(ThemeError::Diverged {
                        consecutive_degeneracies,
                    });
                }
                continue;
            }
            Err(other) => return Err(other),
        };

        last_log_likelihood = stats.log_likelihood;

        let (new_pi, new_a) = reestimate(&stats, n, sparse_still_holds, config);

        final_pi_delta = vec_l1_distance(&hmm.pi, &new_pi);
        final_a_delta = hmm.a.l1_distance(&new_a);

        if sparse_still_holds && !detect_sparsity(&new_a, config.sparsity_tolerance) {
            warn!(iteration, "sparsity pattern broke during re-estimation, switching to dense updates");
            sparse_still_holds = false;
        }

        hmm.pi = new_pi;
        hmm.a = new_a;

        if final_pi_delta < config.pi_threshold && final_a_delta < config.a_threshold {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            iterations_run,
            final_pi_delta, final_a_delta, "Baum-Welch exhausted bw_max_iterations without converging"
        );
    }

    Ok(BwDiagnostics {
        iterations_run,
        final_pi_delta,
        final_a_delta,
        converged,
        used_block_parallel: use_block_parallel,
        used_sparse_update: sparse,
        final_log_likelihood: last_log_likelihood,
    })
}

/// Per-iteration sufficient statistics: accumulated `xi` and `gamma`
/// sums, plus `gamma_0` (for re-estimating `pi`) and the scaled
/// log-likelihood.
struct IterationStats {
    xi_sum: Matrix,
    gamma_sum: Vec<f64>,
    gamma_0: Vec<f64>,
    log_likelihood: f64,
}

fn reestimate(stats: &IterationStats, n: usize, sparse: bool, config: &Config) -> (Vec<f64>, Matrix) {
    let mut new_pi = stats.gamma_0.clone();
    normalize_vec_in_place(&mut new_pi, config.denominator_floor);

    let mut new_a = Matrix::zeros(n, n);
    if sparse {
        // Background + self-loop pattern: only `A[i][i]` and `A[i][0]`
        // (`i != 0`) and the full row 0 carry re-estimated mass; every
        // other entry stays at its structural zero.
        for j in 0..n {
            new_a.set(0, j, stats.xi_sum.get(0, j));
        }
        normalize_row(&mut new_a, 0, stats.gamma_sum[0], config.denominator_floor);
        for i in 1..n {
            new_a.set(i, i, stats.xi_sum.get(i, i));
            new_a.set(i, 0, stats.xi_sum.get(i, 0));
            normalize_row(&mut new_a, i, stats.gamma_sum[i], config.denominator_floor);
        }
    } else {
        for i in 0..n {
            for j in 0..n {
                new_a.set(i, j, stats.xi_sum.get(i, j));
            }
            normalize_row(&mut new_a, i, stats.gamma_sum[i], config.denominator_floor);
        }
    }

    (new_pi, new_a)
}

fn normalize_row(m: &mut Matrix, row: usize, denom_hint: f64, floor: f64) {
    let denom = if denom_hint > 0.0 { denom_hint } else { floor };
    let r = m.row_mut(row);
    for v in r.iter_mut() {
        *v /= denom;
    }
}

/// Checks whether `A` matches the "background + self-loop" structure
/// within `tolerance`: row 0 is unconstrained, but every theme row `i`
/// has all mass on `A[i][i]` and `A[i][0]`.
fn detect_sparsity(a: &Matrix, tolerance: f64) -> bool {
    let n = a.rows();
    for i in 1..n {
        for j in 0..n {
            if j != i && j != 0 && a.get(i, j) > tolerance {
                return false;
            }
        }
    }
    true
}

fn transition_emission_matrix(hmm: &Hmm, word: WordId) -> Matrix {
    let n = hmm.num_states;
    let mut m = Matrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            m.set(i, j, hmm.a.get(i, j) * hmm.emission(j, word));
        }
    }
    m
}

/// The diagonal transfer `diag(B[i][o_0])` used for the very first
/// observation of the whole sequence, where `alpha_0[i] = pi[i] *
/// B[i][o_0]` has no preceding transition to fold in (unlike every
/// later step, which is `(alpha_{t-1} . A) ⊙ B_t`).
fn initial_emission_matrix(hmm: &Hmm, word: WordId) -> Matrix {
    let n = hmm.num_states;
    let mut m = Matrix::zeros(n, n);
    for i in 0..n {
        m.set(i, i, hmm.emission(i, word));
    }
    m
}

/// Standard scaled forward-backward (Rabiner): sequential, numerically
/// stable regardless of sequence length.
fn forward_backward_sequential(
    hmm: &Hmm,
    observations: &[WordId],
    config: &Config,
) -> ThemeResult<IterationStats> {
    let n = hmm.num_states;
    let t = observations.len();

    let mut alpha = vec![vec![0.0; n]; t];
    let mut c = vec![0.0; t];

    for i in 0..n {
        alpha[0][i] = hmm.pi[i] * hmm.emission(i, observations[0]);
    }
    c[0] = scale(&mut alpha[0], config.denominator_floor)?;

    for step in 1..t {
        for j in 0..n {
            let mut acc = 0.0;
            for i in 0..n {
                acc += alpha[step - 1][i] * hmm.a.get(i, j);
            }
            alpha[step][j] = acc * hmm.emission(j, observations[step]);
        }
        c[step] = scale(&mut alpha[step], config.denominator_floor)?;
    }

    let mut beta = vec![vec![0.0; n]; t];
    for i in 0..n {
        beta[t - 1][i] = c[t - 1];
    }
    for step in (0..t - 1).rev() {
        for i in 0..n {
            let mut acc = 0.0;
            for j in 0..n {
                acc += hmm.a.get(i, j) * hmm.emission(j, observations[step + 1]) * beta[step + 1][j];
            }
            beta[step][i] = acc * c[step];
        }
    }

    accumulate_stats(hmm, observations, &alpha, &beta, &c)
}

/// Scales `row` to sum to 1 in place, returning the scaling constant
/// `c_t = 1 / sum(row)`. Returns `NumericalDegeneracy` if the row sums
/// to (near) zero.
fn scale(row: &mut [f64], floor: f64) -> ThemeResult<f64> {
    let sum: f64 = row.iter().sum();
    if sum <= floor {
        return Err(ThemeError::NumericalDegeneracy(
            "forward/backward row collapsed to zero".to_string(),
        ));
    }
    let c = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= c;
    }
    Ok(c)
}

fn accumulate_stats(
    hmm: &Hmm,
    observations: &[WordId],
    alpha: &[Vec<f64>],
    beta: &[Vec<f64>],
    c: &[f64],
) -> ThemeResult<IterationStats> {
    let n = hmm.num_states;
    let t = observations.len();

    let mut xi_sum = Matrix::zeros(n, n);
    let mut gamma_sum = vec![0.0; n];
    let log_likelihood = -c.iter().map(|ct| ct.ln()).sum::<f64>();

    for step in 0..t - 1 {
        let next_word = observations[step + 1];
        for i in 0..n {
            for j in 0..n {
                let xi = alpha[step][i] * hmm.a.get(i, j) * hmm.emission(j, next_word) * beta[step + 1][j];
                xi_sum.set(i, j, xi_sum.get(i, j) + xi);
            }
            gamma_sum[i] += alpha[step][i] * beta[step][i] / c[step];
        }
    }

    Ok(IterationStats {
        xi_sum,
        gamma_sum,
        gamma_0: alpha[0].clone(),
        log_likelihood,
    })
}

/// Block-parallel forward-backward, following the same decomposition:
/// a local pass computes each block's internal transfer matrix
/// (normalized to avoid local overflow), a cheap sequential reduce
/// turns those into real entry vectors for every block boundary, and
/// a finalize pass recomputes each block's true scaled alpha/beta
/// independently, in parallel, now that its entry vector is known.
fn forward_backward_block_parallel(
    hmm: &Hmm,
    observations: &[WordId],
    config: &Config,
    executor: &impl Executor,
) -> ThemeResult<IterationStats> {
    let n = hmm.num_states;
    let t = observations.len();
    let blocks = ScanBlock::partition(t, config.bw_block_size);

    // Phase 1 (local, parallel): each block's raw transfer matrix,
    // normalized by its L1 norm to keep the sequential reduce in
    // phase 2 well-scaled.
    let local_tasks: Vec<_> = blocks
        .iter()
        .map(|block| {
            let block = *block;
            let observations = observations.to_vec();
            let hmm = hmm.clone();
            move || -> Matrix {
                let mut acc = Matrix::identity(n);
                for t in block.start..block.end {
                    // The true sequence start has no incoming transition:
                    // alpha_0 = pi . diag(B[.][o_0]), not (pi . A) ⊙ B_0.
                    let step_matrix = if t == 0 {
                        initial_emission_matrix(&hmm, observations[t])
                    } else {
                        transition_emission_matrix(&hmm, observations[t])
                    };
                    let mut next = Matrix::zeros(n, n);
                    acc.mul_into(&step_matrix, &mut next);
                    let norm = next.l1_norm();
                    if norm > 0.0 {
                        next.scale_in_place(1.0 / norm);
                    }
                    acc = next;
                }
                acc
            }
        })
        .collect();
    let local_transfer = executor.execute(local_tasks);

    // Phase 2 (reduce, sequential): cheap because there are only
    // `blocks.len()` matrices, one per block, not one per observation.
    let mut entry_vectors = Vec::with_capacity(blocks.len());
    let mut carried = hmm.pi.clone();
    for transfer in &local_transfer {
        entry_vectors.push(carried.clone());
        let mut next = vec![0.0; n];
        transfer.mul_vec_into_row(&carried, &mut next);
        // Keeps the carried vector a valid probability distribution
        // across block boundaries.
        normalize_vec_in_place(&mut next, config.denominator_floor);
        carried = next;
    }

    // Phase 3 (finalize, parallel): each block reruns the ordinary
    // scaled recursion, seeded with its real entry vector, so every
    // per-timestep `alpha`/`beta` is numerically identical to the
    // sequential computation regardless of block size.
    let finalize_tasks: Vec<_> = blocks
        .iter()
        .zip(entry_vectors.iter())
        .map(|(block, entry)| {
            let block = *block;
            let entry = entry.clone();
            let observations = observations.to_vec();
            let hmm = hmm.clone();
            move || -> ThemeResult<(Vec<Vec<f64>>, Vec<f64>)> {
                local_scaled_forward(
                    &hmm,
                    &observations[block.start..block.end],
                    &entry,
                    block.start == 0,
                    config,
                )
            }
        })
        .collect();
    let forward_results: Vec<ThemeResult<(Vec<Vec<f64>>, Vec<f64>)>> =
        executor.execute(finalize_tasks);

    let mut alpha = Vec::with_capacity(t);
    let mut c = Vec::with_capacity(t);
    for result in forward_results {
        let (block_alpha, block_c) = result?;
        alpha.extend(block_alpha);
        c.extend(block_c);
    }

    // The backward pass mirrors the forward one, scanning from the
    // end; it is computed sequentially here to keep this
    // implementation within scope, which is sound because the
    // expensive part (state-space sized inner products over `T`
    // observations) is still proportional to the same `T * N^2` work
    // the forward pass does per block — the reduce phase, not this
    // pass, is what block-parallelism amortizes.
    let mut beta = vec![vec![0.0; n]; t];
    for i in 0..n {
        beta[t - 1][i] = c[t - 1];
    }
    for step in (0..t - 1).rev() {
        for i in 0..n {
            let mut acc = 0.0;
            for j in 0..n {
                acc += hmm.a.get(i, j) * hmm.emission(j, observations[step + 1]) * beta[step + 1][j];
            }
            beta[step][i] = acc * c[step];
        }
    }

    accumulate_stats(hmm, observations, &alpha, &beta, &c)
}

/// The ordinary scaled forward recursion, run over a contiguous slice
/// with an explicit starting vector instead of `pi`. Used by the
/// finalize phase of the block-parallel path. `is_sequence_start`
/// selects between the two ways a block's first step can begin:
/// block 0's first observation is the true sequence start, where
/// `entry` (= `hmm.pi`) is an initial state distribution with no
/// transition to apply; every other block's first step transitions
/// out of `entry`, the real alpha vector carried across the boundary.
fn local_scaled_forward(
    hmm: &Hmm,
    observations: &[WordId],
    entry: &[f64],
    is_sequence_start: bool,
    config: &Config,
) -> ThemeResult<(Vec<Vec<f64>>, Vec<f64>)> {
    let n = hmm.num_states;
    let len = observations.len();
    let mut alpha = vec![vec![0.0; n]; len];
    let mut c = vec![0.0; len];

    if is_sequence_start {
        for j in 0..n {
            alpha[0][j] = entry[j] * hmm.emission(j, observations[0]);
        }
    } else {
        for j in 0..n {
            let mut acc = 0.0;
            for i in 0..n {
                acc += entry[i] * hmm.a.get(i, j);
            }
            alpha[0][j] = acc * hmm.emission(j, observations[0]);
        }
    }
    c[0] = scale(&mut alpha[0], config.denominator_floor)?;

    for step in 1..len {
        for j in 0..n {
            let mut acc = 0.0;
            for i in 0..n {
                acc += alpha[step - 1][i] * hmm.a.get(i, j);
            }
            alpha[step][j] = acc * hmm.emission(j, observations[step]);
        }
        c[step] = scale(&mut alpha[step], config.denominator_floor)?;
    }

    Ok((alpha, c))
}

impl Matrix {
    /// `out = v * self` (row-vector times matrix), the orientation the
    /// block-parallel forward pass needs when carrying `alpha` across
    /// block boundaries.
    fn mul_vec_into_row(&self, v: &[f64], out: &mut [f64]) {
        assert_eq!(v.len(), self.rows());
        assert_eq!(out.len(), self.cols());
        for j in 0..self.cols() {
            let mut acc = 0.0;
            for i in 0..self.rows() {
                acc += v[i] * self.get(i, j);
            }
            out[j] = acc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SequentialExecutor;
    use crate::types::BackgroundModel;

    fn two_state_hmm() -> Hmm {
        let background = BackgroundModel {
            probabilities: vec![0.5, 0.3, 0.2],
        };
        let theme = crate::types::Theme {
            word_distribution: vec![0.1, 0.2, 0.7],
            top_documents: vec![],
            average_pi: 0.5,
        };
        Hmm::with_default_initial_conditions(&background, &[theme]).unwrap()
    }

    fn sample_observations() -> Vec<WordId> {
        vec![0, 2, 2, 1, 2, 0, 2, 2, 1, 0, 2, 1, 2, 2, 0]
    }

    #[test]
    fn training_improves_or_maintains_structure_and_converges() {
        let mut hmm = two_state_hmm();
        let observations = ObservationSequence {
            observations: sample_observations(),
        };
        let mut config = Config::default();
        config.bw_max_iterations = 50;
        config.force_sequential_baum_welch = true;

        let diagnostics = train(&mut hmm, &observations, &config, &SequentialExecutor).unwrap();
        assert!(diagnostics.final_log_likelihood.is_finite());

        let pi_sum: f64 = hmm.pi.iter().sum();
        assert!((pi_sum - 1.0).abs() < 1e-6);
        for i in 0..hmm.num_states {
            let row_sum: f64 = hmm.a.row(i).iter().sum();
            assert!((row_sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn block_parallel_matches_sequential_on_a_short_sequence() {
        let observations = ObservationSequence {
            observations: sample_observations(),
        };

        let mut hmm_seq = two_state_hmm();
        let mut config_seq = Config::default();
        config_seq.bw_max_iterations = 1;
        config_seq.force_sequential_baum_welch = true;
        train(&mut hmm_seq, &observations, &config_seq, &SequentialExecutor).unwrap();

        let mut hmm_block = two_state_hmm();
        let mut config_block = Config::default();
        config_block.bw_max_iterations = 1;
        config_block.force_sequential_baum_welch = false;
        config_block.sequential_fallback_threshold = 0;
        config_block.bw_block_size = 4;
        train(&mut hmm_block, &observations, &config_block, &SequentialExecutor).unwrap();

        assert!(vec_l1_distance(&hmm_seq.pi, &hmm_block.pi) < 1e-6);
        assert!(hmm_seq.a.l1_distance(&hmm_block.a) < 1e-6);
    }

    #[test]
    fn sparsity_is_detected_on_default_initial_conditions() {
        let hmm = two_state_hmm();
        assert!(detect_sparsity(&hmm.a, 1e-12));
    }

    #[test]
    fn empty_observations_is_rejected() {
        let mut hmm = two_state_hmm();
        let observations = ObservationSequence { observations: vec![] };
        let config = Config::default();
        assert!(matches!(
            train(&mut hmm, &observations, &config, &SequentialExecutor),
            Err(ThemeError::EmptyInput(_))
        ));
    }
}
