//! Log-space Viterbi decoding: sequential, and a block-parallel
//! variant with a sequential "up-phase" that resolves the optimal
//! state at every block boundary (cheap: one tropical-semiring
//! vector-matrix combine per block, not per observation) followed by
//! a fully parallel "down-phase" that backtracks each block
//! independently once its entry and exit states are known.

use tracing::info;

use crate::config::Config;
use crate::error::{ThemeError, ThemeResult};
use crate::executor::Executor;
use crate::hmm::Hmm;
use crate::numeric::Matrix;
use crate::types::{ObservationSequence, ScanBlock};
use crate::vocab::WordId;

/// Decodes the most likely state sequence for `observations` under
/// `hmm`, choosing the sequential or block-parallel path by the same
/// `T * N^2` threshold as Baum-Welch training.
pub fn decode(
    hmm: &Hmm,
    observations: &ObservationSequence,
    config: &Config,
    executor: &impl Executor,
) -> ThemeResult<Vec<usize>> {
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

    info!(num_states = n, num_observations = t, use_block_parallel, "decoding");

    if use_block_parallel {
        decode_block_parallel(hmm, &observations.observations, config, executor)
    } else {
        decode_sequential(hmm, &observations.observations)
    }
}

fn log_emission(hmm: &Hmm, state: usize, word: WordId) -> f64 {
    hmm.emission(state, word).ln()
}

/// Standard log-space Viterbi: `O(T * N^2)` time, `O(T * N)` memory
/// for the backpointer table.
fn decode_sequential(hmm: &Hmm, observations: &[WordId]) -> ThemeResult<Vec<usize>> {
    let n = hmm.num_states;
    let t = observations.len();

    let mut delta = vec![vec![f64::NEG_INFINITY; n]; t];
    let mut backptr = vec![vec![0usize; n]; t];

    for j in 0..n {
        delta[0][j] = hmm.pi[j].ln() + log_emission(hmm, j, observations[0]);
    }

    for step in 1..t {
        for j in 0..n {
            let (best_i, best_score) = (0..n)
                .map(|i| (i, delta[step - 1][i] + hmm.a.get(i, j).ln()))
                .fold((0usize, f64::NEG_INFINITY), |acc, cur| {
                    if cur.1 > acc.1 {
                        cur
                    } else {
                        acc
                    }
                });
            delta[step][j] = best_score + log_emission(hmm, j, observations[step]);
            backptr[step][j] = best_i;
        }
    }

    let (best_final_state, best_score) = argmax(&delta[t - 1]);
    if !best_score.is_finite() {
        return Err(ThemeError::NumericalDegeneracy(
            "every state has probability zero at the final observation".to_string(),
        ));
    }

    let mut path = vec![0usize; t];
    path[t - 1] = best_final_state;
    for step in (0..t - 1).rev() {
        path[step] = backptr[step + 1][path[step + 1]];
    }
    Ok(path)
}

fn argmax(row: &[f64]) -> (usize, f64) {
    row.iter()
        .enumerate()
        .fold((0usize, f64::NEG_INFINITY), |acc, (i, &v)| {
            if v > acc.1 {
                (i, v)
            } else {
                acc
            }
        })
}

/// `(a ⊗ b)[i][j] = max_k (a[i][k] + b[k][j])`, the tropical-semiring
/// matrix "multiplication" that makes a block's best-path score
/// transfer associative across observations.
fn tropical_combine(a: &Matrix, b: &Matrix) -> Matrix {
    let n = a.rows();
    let mut out = Matrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let mut best = f64::NEG_INFINITY;
            for k in 0..n {
                let v = a.get(i, k) + b.get(k, j);
                if v > best {
                    best = v;
                }
            }
            out.set(i, j, best);
        }
    }
    out
}

fn tropical_identity(n: usize) -> Matrix {
    let mut m = Matrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            m.set(i, j, if i == j { 0.0 } else { f64::NEG_INFINITY });
        }
    }
    m
}

fn transition_emission_log_matrix(hmm: &Hmm, word: WordId) -> Matrix {
    let n = hmm.num_states;
    let mut m = Matrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            m.set(i, j, hmm.a.get(i, j).ln() + log_emission(hmm, j, word));
        }
    }
    m
}

/// The tropical-semiring analogue of [`initial_emission_log_matrix`]:
/// a diagonal matrix of `log B[i][o_0]` (off-diagonal `-inf`), so
/// combining it with `ln(pi)` yields `pi[j].ln() + log_emission(j,
/// o_0)` with no spurious `A` term, matching [`decode_sequential`]'s
/// true sequence start.
fn initial_emission_log_matrix(hmm: &Hmm, word: WordId) -> Matrix {
    let n = hmm.num_states;
    let mut m = tropical_identity(n);
    for i in 0..n {
        m.set(i, i, log_emission(hmm, i, word));
    }
    m
}

/// `next[j] = max_i (entry[i] + m[i][j])`, also returning the argmax
/// `i` per `j` (the boundary backpointer used by the up-phase).
fn vec_mat_combine_with_argmax(entry: &[f64], m: &Matrix) -> (Vec<f64>, Vec<usize>) {
    let n = entry.len();
    let mut next = vec![f64::NEG_INFINITY; n];
    let mut bp = vec![0usize; n];
    for j in 0..n {
        for i in 0..n {
            let v = entry[i] + m.get(i, j);
            if v > next[j] {
                next[j] = v;
                bp[j] = i;
            }
        }
    }
    (next, bp)
}

/// The local Viterbi recursion over one block, seeded with the
/// block's real incoming `delta` vector (known only after the
/// sequential up-phase below has run). `is_sequence_start` marks the
/// first block, whose `entry` is `ln(pi)` — an initial distribution,
/// not a predecessor `delta` row — so its first step takes no `A`
/// transition; `backptr[0]` is never read by backtracking in that
/// case (there is no predecessor), so it is set to the identity.
fn local_viterbi(
    hmm: &Hmm,
    observations: &[WordId],
    entry: &[f64],
    is_sequence_start: bool,
) -> (Vec<Vec<f64>>, Vec<Vec<usize>>) {
    let n = hmm.num_states;
    let len = observations.len();
    let mut delta = vec![vec![f64::NEG_INFINITY; n]; len];
    let mut backptr = vec![vec![0usize; n]; len];

    if is_sequence_start {
        for j in 0..n {
            delta[0][j] = entry[j] + log_emission(hmm, j, observations[0]);
            backptr[0][j] = j;
        }
    } else {
        for j in 0..n {
            let (best_i, best_score) = (0..n)
                .map(|i| (i, entry[i] + hmm.a.get(i, j).ln()))
                .fold((0usize, f64::NEG_INFINITY), |acc, cur| {
                    if cur.1 > acc.1 {
                        cur
                    } else {
                        acc
                    }
                });
            delta[0][j] = best_score + log_emission(hmm, j, observations[0]);
            backptr[0][j] = best_i;
        }
    }

    for step in 1..len {
        for j in 0..n {
            let (best_i, best_score) = (0..n)
                .map(|i| (i, delta[step - 1][i] + hmm.a.get(i, j).ln()))
                .fold((0usize, f64::NEG_INFINITY), |acc, cur| {
                    if cur.1 > acc.1 {
                        cur
                    } else {
                        acc
                    }
                });
            delta[step][j] = best_score + log_emission(hmm, j, observations[step]);
            backptr[step][j] = best_i;
        }
    }

    (delta, backptr)
}

fn decode_block_parallel(
    hmm: &Hmm,
    observations: &[WordId],
    config: &Config,
    executor: &impl Executor,
) -> ThemeResult<Vec<usize>> {
    let n = hmm.num_states;
    let t = observations.len();
    let blocks = ScanBlock::partition(t, config.viterbi_block_size);

    // Local pass (parallel): each block's tropical transfer matrix,
    // independent of how the rest of the sequence decodes.
    let transfer_tasks: Vec<_> = blocks
        .iter()
        .map(|block| {
            let block = *block;
            let observations = observations.to_vec();
            let hmm = hmm.clone();
            move || -> Matrix {
                let mut acc = tropical_identity(n);
                for t in block.start..block.end {
                    let step = if t == 0 {
                        initial_emission_log_matrix(&hmm, observations[t])
                    } else {
                        transition_emission_log_matrix(&hmm, observations[t])
                    };
                    acc = tropical_combine(&acc, &step);
                }
                acc
            }
        })
        .collect();
    let transfers = executor.execute(transfer_tasks);

    // Up-phase (sequential, over `blocks.len()` boundaries only):
    // resolve the globally optimal entry/exit state for every block.
    let mut entry_vectors = Vec::with_capacity(blocks.len() + 1);
    let mut boundary_bp = Vec::with_capacity(blocks.len());
    entry_vectors.push(hmm.pi.iter().map(|p| p.ln()).collect::<Vec<f64>>());
    for transfer in &transfers {
        let (next, bp) = vec_mat_combine_with_argmax(entry_vectors.last().unwrap(), transfer);
        entry_vectors.push(next);
        boundary_bp.push(bp);
    }

    let (best_final_state, best_score) = argmax(entry_vectors.last().unwrap());
    if !best_score.is_finite() {
        return Err(ThemeError::NumericalDegeneracy(
            "every state has probability zero at the final observation".to_string(),
        ));
    }

    let mut block_exit_state = vec![0usize; blocks.len()];
    let mut block_entry_state = vec![0usize; blocks.len()];
    let mut current = best_final_state;
    for k in (0..blocks.len()).rev() {
        block_exit_state[k] = current;
        block_entry_state[k] = boundary_bp[k][current];
        current = block_entry_state[k];
    }

    // Finalize (parallel): each block reruns the local recursion with
    // its real entry vector, now known from the up-phase.
    let finalize_tasks: Vec<_> = blocks
        .iter()
        .zip(entry_vectors.iter())
        .map(|(block, entry)| {
            let block = *block;
            let entry = entry.clone();
            let observations = observations.to_vec();
            let hmm = hmm.clone();
            move || -> (Vec<Vec<f64>>, Vec<Vec<usize>>) {
                local_viterbi(
                    &hmm,
                    &observations[block.start..block.end],
                    &entry,
                    block.start == 0,
                )
            }
        })
        .collect();
    let local_tables = executor.execute(finalize_tasks);

    // Down-phase (parallel): each block already knows its exit state
    // (from the up-phase) and its own local backpointer table, so it
    // backtracks independently of every other block.
    let backtrack_tasks: Vec<_> = blocks
        .iter()
        .zip(local_tables.iter())
        .zip(block_exit_state.iter())
        .map(|((block, (_, backptr)), &exit_state)| {
            let block = *block;
            let backptr = backptr.clone();
            move || -> Vec<(usize, usize)> {
                let len = block.len();
                let mut state = exit_state;
                let mut out = Vec::with_capacity(len);
                out.push((block.start + len - 1, state));
                for bt in (0..len - 1).rev() {
                    state = backptr[bt + 1][state];
                    out.push((block.start + bt, state));
                }
                out
            }
        })
        .collect();
    let block_paths = executor.execute(backtrack_tasks);

    let mut path = vec![0usize; t];
    for block_path in block_paths {
        for (global_index, state) in block_path {
            path[global_index] = state;
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SequentialExecutor;
    use crate::hmm::Hmm;
    use crate::types::{BackgroundModel, Theme};

    fn two_state_hmm() -> Hmm {
        let background = BackgroundModel {
            probabilities: vec![0.6, 0.3, 0.1],
        };
        let theme = Theme {
            word_distribution: vec![0.05, 0.15, 0.8],
            top_documents: vec![],
            average_pi: 0.5,
        };
        Hmm::with_default_initial_conditions(&background, &[theme]).unwrap()
    }

    #[test]
    fn decode_sequential_recovers_themed_run() {
        let hmm = two_state_hmm();
        // A long run of the theme's strongest word (index 2) should
        // decode mostly to state 1 (the theme), not state 0
        // (background), given the self-loop-heavy transition matrix.
        let observations: Vec<WordId> = vec![2; 20];
        let path = decode_sequential(&hmm, &observations).unwrap();
        let theme_count = path.iter().filter(|&&s| s == 1).count();
        assert!(theme_count > 10, "expected theme state to dominate, got path {:?}", path);
    }

    #[test]
    fn block_parallel_matches_sequential() {
        let hmm = two_state_hmm();
        let observations = ObservationSequence {
            observations: vec![0, 2, 2, 2, 1, 0, 2, 2, 2, 2, 2, 0, 1, 2, 2, 2, 0, 2, 2, 2],
        };

        let seq_path = decode_sequential(&hmm, &observations.observations).unwrap();

        let mut config = Config::default();
        config.force_sequential_baum_welch = false;
        config.sequential_fallback_threshold = 0;
        config.viterbi_block_size = 4;

        let block_path = decode(&hmm, &observations, &config, &SequentialExecutor).unwrap();
        assert_eq!(seq_path, block_path);
    }

    #[test]
    fn empty_observations_is_rejected() {
        let hmm = two_state_hmm();
        let observations = ObservationSequence { observations: vec![] };
        let config = Config::default();
        assert!(matches!(
            decode(&hmm, &observations, &config, &SequentialExecutor),
            Err(ThemeError::EmptyInput(_))
        ));
    }
}
