//! Core data model: documents, time partitions, background and
//! theme models, and the sequence representations Baum-Welch/Viterbi
//! operate on.

use serde::{Deserialize, Serialize};

use crate::vocab::WordId;

/// A fixed background word distribution the EM fitter holds constant
/// throughout fitting, and the HMM core reuses as state 0's emission
/// row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundModel {
    /// `p_B[w]`, one probability per `WordId`, summing to 1.
    pub probabilities: Vec<f64>,
}

impl BackgroundModel {
    /// The probability of `word`, or 0.0 if out of range.
    pub fn probability(&self, word: WordId) -> f64 {
        self.probabilities.get(word as usize).copied().unwrap_or(0.0)
    }

    pub fn vocabulary_size(&self) -> usize {
        self.probabilities.len()
    }
}

/// A single document: a bag of words given as `(WordId, count)` pairs,
/// already tokenized and indexed by an external vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub words: Vec<(WordId, u64)>,
}

impl Document {
    /// Total word count (`sum` of the counts), used as a document's
    /// weight in EM's M-step.
    pub fn total_count(&self) -> u64 {
        self.words.iter().map(|(_, c)| c).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty() || self.total_count() == 0
    }
}

/// A group of documents sharing a time bucket, the unit EM fits one
/// set of themes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimePartition {
    pub id: u64,
    /// `(start, end)`, caller-defined units (e.g. unix seconds); this
    /// crate never interprets them, only carries them through to
    /// output for the driver's benefit.
    pub interval: (i64, i64),
    pub documents: Vec<Document>,
}

/// A single extracted theme: a word distribution plus the average
/// mixing weight it was assigned across its partition's documents,
/// used both for the theme-filtering threshold and as the initial
/// guess for an HMM state's emission row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub word_distribution: Vec<f64>,
    /// Indices into the partition's `documents`, the documents this
    /// theme mixes into most heavily, ranked by per-document mixing
    /// weight descending.
    pub top_documents: Vec<u64>,
    pub average_pi: f64,
}

/// Everything [`crate::em::fit_em`] needs for one partition.
#[derive(Debug, Clone)]
pub struct EmInput<'a> {
    pub background: &'a BackgroundModel,
    pub documents: &'a [Document],
    pub vocabulary_size: usize,
}

/// The flattened observation sequence a full HMM run (Baum-Welch,
/// Viterbi) operates on: every document in every partition,
/// concatenated in partition order, expanded from `(WordId, count)`
/// pairs to one `WordId` per occurrence in the order the driver reads
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationSequence {
    pub observations: Vec<WordId>,
}

impl ObservationSequence {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// A contiguous half-open slice `[start, end)` of an
/// [`ObservationSequence`], the unit of work block-parallel
/// Baum-Welch/Viterbi divide a sequence into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanBlock {
    pub start: usize,
    pub end: usize,
}

impl ScanBlock {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Splits `[0, total_len)` into contiguous blocks of at most
    /// `block_size`, with the final block possibly shorter.
    pub fn partition(total_len: usize, block_size: usize) -> Vec<ScanBlock> {
        if total_len == 0 {
            return Vec::new();
        }
        let block_size = block_size.max(1);
        let mut blocks = Vec::with_capacity(total_len.div_ceil(block_size));
        let mut start = 0;
        while start < total_len {
            let end = (start + block_size).min(total_len);
            blocks.push(ScanBlock { start, end });
            start = end;
        }
        blocks
    }
}

/// Summary of one Baum-Welch training run, returned alongside the
/// trained [`crate::hmm::Hmm`] for a driver to log or persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BwDiagnostics {
    pub iterations_run: usize,
    pub final_pi_delta: f64,
    pub final_a_delta: f64,
    pub converged: bool,
    pub used_block_parallel: bool,
    pub used_sparse_update: bool,
    pub final_log_likelihood: f64,
}

/// Per-partition diagnostics a driver surfaces to an external caller,
/// combining the EM fit and the Baum-Welch training run that follows
/// it so a dashboard doesn't need to re-derive either from the raw
/// model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub log_likelihood: f64,
    pub em_iterations: usize,
    pub bw_iterations: usize,
    pub em_converged: bool,
    pub bw_converged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_total_count_sums_word_counts() {
        let doc = Document {
            words: vec![(0, 3), (1, 2), (2, 1)],
        };
        assert_eq!(doc.total_count(), 6);
        assert!(!doc.is_empty());
    }

    #[test]
    fn empty_document_is_detected() {
        let doc = Document { words: vec![] };
        assert!(doc.is_empty());
    }

    #[test]
    fn scan_block_partition_covers_every_index_exactly_once() {
        let blocks = ScanBlock::partition(10, 3);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0], ScanBlock { start: 0, end: 3 });
        assert_eq!(blocks[3], ScanBlock { start: 9, end: 10 });
        let total: usize = blocks.iter().map(|b| b.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn scan_block_partition_of_empty_sequence_is_empty() {
        assert!(ScanBlock::partition(0, 5).is_empty());
    }

    #[test]
    fn background_model_probability_out_of_range_is_zero() {
        let bg = BackgroundModel {
            probabilities: vec![0.5, 0.5],
        };
        assert_eq!(bg.probability(5), 0.0);
        assert_eq!(bg.vocabulary_size(), 2);
    }
}
