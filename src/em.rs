//! Expectation-Maximization theme fitter.
//!
//! Fits `K` theme word-distributions to one partition's documents
//! against a fixed background distribution: each observed word is
//! generated either by the background (with fixed weight
//! `lambda_background`) or by one of the partition's `K` themes
//! (weighted by a per-document mixture `pi[d]`). Runs several
//! restarts from independent random initializations and keeps the one
//! with the highest converged log-likelihood.

use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ThemeError, ThemeResult};
use crate::executor::Executor;
use crate::types::{Document, EmInput, Theme};

/// Number of documents kept in [`Theme::top_documents`], ranked by
/// per-document mixing weight descending.
const TOP_DOCUMENTS_LIMIT: usize = 10;

/// One restart's converged (or iteration-exhausted) state.
struct EmRun {
    theta: Vec<Vec<f64>>,
    pi: Vec<Vec<f64>>,
    log_likelihood: f64,
    iterations: usize,
    converged: bool,
}

/// The result of fitting EM to one partition: the filtered themes and
/// the per-document mixture weights over the *unfiltered* theme set
/// (a driver that wants document-level theme attribution needs the
/// index correspondence preserved before filtering, so both are
/// returned).
#[derive(Debug, Clone)]
pub struct EmFitResult {
    pub themes: Vec<Theme>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Runs EM with `config.em_restarts` independent random restarts and
/// returns the themes from the restart with the best converged
/// log-likelihood, filtered to those whose average mixing weight
/// exceeds `config.theme_filter_tau / K`.
pub fn fit_em(
    input: &EmInput<'_>,
    config: &Config,
    executor: &impl Executor,
) -> ThemeResult<EmFitResult> {
    config.validate()?;

    if input.documents.is_empty() || input.documents.iter().all(Document::is_empty) {
        return Err(ThemeError::EmptyInput(
            "partition has no documents with any words".to_string(),
        ));
    }
    if input.vocabulary_size == 0 {
        return Err(ThemeError::EmptyInput(
            "vocabulary is empty".to_string(),
        ));
    }

    let k = config.k;
    let tasks: Vec<_> = (0..config.em_restarts)
        .map(|run_index| {
            let config = config.clone();
            let background = input.background.clone();
            let documents = input.documents.to_vec();
            let vocabulary_size = input.vocabulary_size;
            move || -> ThemeResult<EmRun> {
                let seed = derive_seed(config.rng_seed, run_index as u64);
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                run_single_restart(
                    &documents,
                    &background.probabilities,
                    vocabulary_size,
                    k,
                    &config,
                    &mut rng,
                    executor,
                )
            }
        })
        .collect();

    let results = executor.execute(tasks);

    let mut best: Option<EmRun> = None;
    let mut failures = 0usize;
    for result in results {
        match result {
            Ok(run) => {
                let is_better = best
                    .as_ref()
                    .map(|b| run.log_likelihood > b.log_likelihood)
                    .unwrap_or(true);
                if is_better {
                    best = Some(run);
                }
            }
            // Cancellation/timeout abort the whole fit rather than
            // just this restart: both are deliberate external
            // requests, not a data-dependent failure another restart
            // might route around.
            Err(e @ ThemeError::Cancelled) | Err(e @ ThemeError::TimedOut(_)) => {
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "EM restart failed");
                failures += 1;
            }
        }
    }

    let best = best.ok_or_else(|| {
        ThemeError::NumericalDegeneracy(format!(
            "all {failures} EM restarts failed for this partition"
        ))
    })?;

    info!(
        log_likelihood = best.log_likelihood,
        iterations = best.iterations,
        converged = best.converged,
        failed_restarts = failures,
        "EM fit complete"
    );

    let threshold = config.theme_filter_tau / k as f64;
    let themes = filter_themes(&best.theta, &best.pi, threshold);

    Ok(EmFitResult {
        themes,
        log_likelihood: best.log_likelihood,
        iterations: best.iterations,
        converged: best.converged,
    })
}

/// Combines the run-level seed with the global seed so every restart
/// gets an independent, reproducible stream.
fn derive_seed(rng_seed: u64, run_index: u64) -> u64 {
    rng_seed
        .wrapping_mul(0x9E3779B97F4A7C15)
        .wrapping_add(run_index)
}

fn run_single_restart(
    documents: &[Document],
    background: &[f64],
    vocabulary_size: usize,
    k: usize,
    config: &Config,
    rng: &mut ChaCha8Rng,
    executor: &impl Executor,
) -> ThemeResult<EmRun> {
    let num_docs = documents.len();
    let mut theta = random_stochastic_rows(k, vocabulary_size, config.background_floor, rng);
    let mut pi = random_stochastic_rows(num_docs, k, config.background_floor, rng);

    let mut prev_log_likelihood = f64::NEG_INFINITY;
    let mut consecutive_degeneracies = 0u32;
    let mut converged = false;
    let mut iterations_run = 0usize;
    let start = Instant::now();

    for iteration in 0..config.em_max_iterations {
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
        let step_result = em_step(documents, background, &theta, &pi, config);
        match step_result {
            Ok((new_theta, new_pi, log_likelihood)) => {
                consecutive_degeneracies = 0;
                theta = new_theta;
                pi = new_pi;

                let delta = (log_likelihood - prev_log_likelihood).abs();
                debug!(iteration, log_likelihood, delta, "EM iteration");
                prev_log_likelihood = log_likelihood;

                if iteration > 0 && delta < config.em_convergence_eps {
                    converged = true;
                    break;
                }
            }
            Err(ThemeError::NumericalDegeneracy(msg)) => {
                consecutive_degeneracies += 1;
                warn!(iteration, %msg, consecutive_degeneracies, "EM numerical degeneracy");
                if consecutive_degeneracies >= config.max_consecutive_degeneracies {
                    return Err(ThemeError::Diverged {
                        consecutive_degeneracies,
                    });
                }
            }
            Err(other) => return Err(other),
        }
    }

    if !converged {
        warn!(
            iterations_run,
            log_likelihood = prev_log_likelihood,
            "EM restart exhausted em_max_iterations without converging"
        );
    }

    Ok(EmRun {
        theta,
        pi,
        log_likelihood: prev_log_likelihood,
        iterations: iterations_run,
        converged,
    })
}

/// One E-step + M-step pass, returning the re-estimated parameters
/// and the log-likelihood *under the parameters used for the E-step*
/// (i.e. the likelihood this iteration improved on):
/// `L = (1/|D|) * sum_d (1/|W_d|) * sum_w c(w,d) * log(...)`, so every
/// document counts equally toward `L` regardless of its length.
fn em_step(
    documents: &[Document],
    background: &[f64],
    theta: &[Vec<f64>],
    pi: &[Vec<f64>],
    config: &Config,
) -> ThemeResult<(Vec<Vec<f64>>, Vec<Vec<f64>>, f64)> {
    let k = theta.len();
    let vocabulary_size = theta.first().map(|t| t.len()).unwrap_or(0);

    let mut theta_numerator = vec![vec![0.0; vocabulary_size]; k];
    let mut theta_denominator = vec![0.0; k];
    let mut new_pi = vec![vec![0.0; k]; documents.len()];
    let mut log_likelihood = 0.0;

    for (d, doc) in documents.iter().enumerate() {
        let doc_pi = &pi[d];
        let mut pi_numerator = vec![0.0; k];
        let mut pi_denominator = 0.0;
        let mut doc_log_likelihood = 0.0;
        let distinct_words = doc.words.len();

        for &(word, count) in &doc.words {
            let w = word as usize;
            let count = count as f64;
            let p_background = config.lambda_background * background.get(w).copied().unwrap_or(0.0);

            let theme_mix: f64 = (0..k).map(|j| doc_pi[j] * theta[j][w]).sum();
            let p_themes = (1.0 - config.lambda_background) * theme_mix;
            let denom = p_background + p_themes;

            if denom <= 0.0 {
                return Err(ThemeError::NumericalDegeneracy(format!(
                    "zero mixture density for document {d}, word {w}"
                )));
            }
            doc_log_likelihood += count * denom.ln();

            for j in 0..k {
                let z_jk = (1.0 - config.lambda_background) * doc_pi[j] * theta[j][w] / denom;
                theta_numerator[j][w] += count * z_jk;
                theta_denominator[j] += count * z_jk;
                pi_numerator[j] += count * z_jk;
            }
            pi_denominator += count * (p_themes / denom);
        }

        if distinct_words > 0 {
            log_likelihood += doc_log_likelihood / distinct_words as f64;
        }

        let denom = if pi_denominator > 0.0 {
            pi_denominator
        } else {
            config.denominator_floor
        };
        for j in 0..k {
            new_pi[d][j] = pi_numerator[j] / denom;
        }
    }
    log_likelihood /= documents.len().max(1) as f64;

    let mut new_theta = vec![vec![0.0; vocabulary_size]; k];
    for j in 0..k {
        let denom = if theta_denominator[j] > 0.0 {
            theta_denominator[j]
        } else {
            config.denominator_floor
        };
        for w in 0..vocabulary_size {
            new_theta[j][w] = theta_numerator[j][w] / denom;
        }
    }

    Ok((new_theta, new_pi, log_likelihood))
}

/// Keeps only the themes whose average per-document mixing weight
/// exceeds `threshold`, reporting that average as [`Theme::average_pi`]
/// and its heaviest-mixing documents as [`Theme::top_documents`].
fn filter_themes(theta: &[Vec<f64>], pi: &[Vec<f64>], threshold: f64) -> Vec<Theme> {
    let num_docs = pi.len().max(1) as f64;
    let k = theta.len();
    let mut themes = Vec::new();
    for j in 0..k {
        let average_pi: f64 = pi.iter().map(|doc_pi| doc_pi[j]).sum::<f64>() / num_docs;
        if average_pi > threshold {
            themes.push(Theme {
                word_distribution: theta[j].clone(),
                top_documents: top_documents_for_theme(pi, j),
                average_pi,
            });
        }
    }
    themes
}

/// Document indices (positions in the partition's `documents`) with
/// the largest mixing weight for theme `theme_index`, descending,
/// capped at [`TOP_DOCUMENTS_LIMIT`] and excluding documents with no
/// weight on this theme at all.
fn top_documents_for_theme(pi: &[Vec<f64>], theme_index: usize) -> Vec<u64> {
    let mut ranked: Vec<(usize, f64)> = pi
        .iter()
        .enumerate()
        .map(|(d, doc_pi)| (d, doc_pi[theme_index]))
        .filter(|&(_, weight)| weight > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
        .into_iter()
        .take(TOP_DOCUMENTS_LIMIT)
        .map(|(d, _)| d as u64)
        .collect()
}

fn random_stochastic_rows(
    rows: usize,
    cols: usize,
    floor: f64,
    rng: &mut ChaCha8Rng,
) -> Vec<Vec<f64>> {
    (0..rows)
        .map(|_| {
            let mut row: Vec<f64> = (0..cols).map(|_| rng.gen_range(0.0..1.0) + 1e-6).collect();
            let sum: f64 = row.iter().sum();
            let denom = if sum > 0.0 { sum } else { floor };
            for v in row.iter_mut() {
                *v /= denom;
            }
            row
        })
        .collect()
}
