//! Orchestrator: runs EM theme extraction, builds the HMM, and
//! trains/decodes it for one or many time partitions, keeping
//! partition failures isolated from each other so one bad partition
//! does not abort a whole run.

use tracing::{error, info, warn};

use crate::config::Config;
use crate::em::{fit_em, EmFitResult};
use crate::error::ThemeResult;
use crate::executor::Executor;
use crate::hmm::baum_welch;
use crate::hmm::viterbi;
use crate::hmm::Hmm;
use crate::types::{
    BackgroundModel, BwDiagnostics, Diagnostics, Document, ObservationSequence, TimePartition,
};

/// Everything produced by running one partition end to end.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub partition_id: u64,
    pub em_fit: EmFitResult,
    pub hmm: Hmm,
    /// The external-facing diagnostic summary (EM + Baum-Welch
    /// iteration counts and convergence flags).
    pub diagnostics: Diagnostics,
    /// Extra Baum-Welch-only detail (deltas, sparsity/block-parallel
    /// flags) not part of the external diagnostic shape.
    pub bw_diagnostics: BwDiagnostics,
    pub decoded_states: Vec<usize>,
}

/// Expands a partition's documents into the single flat
/// [`ObservationSequence`] Baum-Welch/Viterbi operate on: every
/// `(WordId, count)` pair becomes `count` repeated occurrences, in
/// document order, in partition order.
pub fn build_observation_sequence(documents: &[Document]) -> ObservationSequence {
    let mut observations = Vec::new();
    for doc in documents {
        for &(word, count) in &doc.words {
            observations.extend(std::iter::repeat(word).take(count as usize));
        }
    }
    ObservationSequence { observations }
}

/// Runs EM, HMM construction, Baum-Welch training, and Viterbi
/// decoding for one partition.
pub fn run_partition(
    partition: &TimePartition,
    background: &BackgroundModel,
    vocabulary_size: usize,
    config: &Config,
    executor: &impl Executor,
) -> ThemeResult<PartitionResult> {
    config.validate()?;

    info!(
        partition_id = partition.id,
        num_documents = partition.documents.len(),
        "fitting themes"
    );
    let em_input = crate::types::EmInput {
        background,
        documents: &partition.documents,
        vocabulary_size,
    };
    let em_fit = fit_em(&em_input, config, executor)?;

    let hmm_initial = Hmm::with_default_initial_conditions(background, &em_fit.themes)?;
    let observations = build_observation_sequence(&partition.documents);

    let mut hmm = hmm_initial;
    let bw_diagnostics = baum_welch::train(&mut hmm, &observations, config, executor)?;

    info!(
        partition_id = partition.id,
        converged = bw_diagnostics.converged,
        iterations = bw_diagnostics.iterations_run,
        "Baum-Welch training complete"
    );
    if !em_fit.converged {
        warn!(partition_id = partition.id, "EM fit hit em_max_iterations without converging");
    }
    if !bw_diagnostics.converged {
        warn!(partition_id = partition.id, "Baum-Welch training hit bw_max_iterations without converging");
    }

    let decoded_states = viterbi::decode(&hmm, &observations, config, executor)?;

    let diagnostics = Diagnostics {
        log_likelihood: em_fit.log_likelihood,
        em_iterations: em_fit.iterations,
        bw_iterations: bw_diagnostics.iterations_run,
        em_converged: em_fit.converged,
        bw_converged: bw_diagnostics.converged,
    };

    Ok(PartitionResult {
        partition_id: partition.id,
        em_fit,
        hmm,
        diagnostics,
        bw_diagnostics,
        decoded_states,
    })
}

/// Runs every partition independently, isolating failures: a
/// partition that errors is logged and its slot carries the error,
/// but every other partition still runs to completion.
pub fn run_all(
    partitions: &[TimePartition],
    background: &BackgroundModel,
    vocabulary_size: usize,
    config: &Config,
    executor: &impl Executor,
) -> Vec<(u64, ThemeResult<PartitionResult>)> {
    partitions
        .iter()
        .map(|partition| {
            let result = run_partition(partition, background, vocabulary_size, config, executor);
            if let Err(ref e) = result {
                error!(partition_id = partition.id, error = %e, "partition failed");
            }
            (partition.id, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SequentialExecutor;

    fn background(vocab: usize) -> BackgroundModel {
        BackgroundModel {
            probabilities: vec![1.0 / vocab as f64; vocab],
        }
    }

    fn partition_with_two_documents() -> TimePartition {
        TimePartition {
            id: 7,
            interval: (0, 100),
            documents: vec![
                Document {
                    words: vec![(0, 30), (1, 30), (2, 1)],
                },
                Document {
                    words: vec![(0, 1), (1, 1), (2, 30)],
                },
            ],
        }
    }

    #[test]
    fn build_observation_sequence_expands_counts_in_order() {
        let docs = vec![Document {
            words: vec![(3, 2), (5, 1)],
        }];
        let seq = build_observation_sequence(&docs);
        assert_eq!(seq.observations, vec![3, 3, 5]);
    }

    #[test]
    fn run_partition_end_to_end_produces_a_decoded_path() {
        let background = background(3);
        let partition = partition_with_two_documents();
        let mut config = Config::default();
        config.k = 2;
        config.em_restarts = 2;
        config.em_max_iterations = 20;
        config.bw_max_iterations = 20;
        config.theme_filter_tau = 0.5;

        let result =
            run_partition(&partition, &background, 3, &config, &SequentialExecutor).unwrap();
        assert_eq!(result.partition_id, 7);
        // 30+30+1 in doc 1, 1+1+30 in doc 2.
        assert_eq!(result.decoded_states.len(), 93);
    }

    #[test]
    fn run_all_isolates_a_failing_partition() {
        let background = background(3);
        let good = partition_with_two_documents();
        let empty = TimePartition {
            id: 8,
            interval: (100, 200),
            documents: vec![],
        };
        let mut config = Config::default();
        config.k = 2;
        config.em_restarts = 1;

        let results = run_all(
            &[good, empty],
            &background,
            3,
            &config,
            &SequentialExecutor,
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
    }
}
