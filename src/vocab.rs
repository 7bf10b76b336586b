//! Vocabulary boundary.
//!
//! This crate never tokenizes text. Every document it consumes is
//! already a bag of `WordId`s; whatever upstream component owns
//! tokenization and stopword/stemming decisions implements
//! [`Vocabulary`] and hands this crate the result. `MapVocabulary` is
//! a minimal in-memory implementation kept around for this crate's
//! own unit and integration tests.

use std::collections::HashMap;

/// A word's index into the fixed vocabulary, `0..vocabulary_size()`.
pub type WordId = u32;

/// The bijection between surface tokens and the dense `WordId` space
/// every model and matrix in this crate is indexed by. An external
/// pipeline component owns the actual tokenizer; this crate only
/// needs the bijection it produces.
pub trait Vocabulary {
    /// The id for `token`, if it is in the vocabulary.
    fn index_of(&self, token: &str) -> Option<WordId>;

    /// The token for `id`, if `id` is within range.
    fn token(&self, id: WordId) -> Option<&str>;

    /// The number of distinct words, `M` in the emission matrix
    /// `B: N x M`.
    fn size(&self) -> usize;
}

/// A minimal `HashMap`-backed [`Vocabulary`], sufficient for tests and
/// small driver programs that do not need a streaming or
/// memory-mapped vocabulary.
#[derive(Debug, Clone, Default)]
pub struct MapVocabulary {
    token_to_id: HashMap<String, WordId>,
    id_to_token: Vec<String>,
}

impl MapVocabulary {
    /// Builds a vocabulary from an ordered list of distinct tokens;
    /// token `i` gets id `i`.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut token_to_id = HashMap::new();
        let mut id_to_token = Vec::new();
        for token in tokens {
            let token = token.into();
            if !token_to_id.contains_key(&token) {
                token_to_id.insert(token.clone(), id_to_token.len() as WordId);
                id_to_token.push(token);
            }
        }
        Self {
            token_to_id,
            id_to_token,
        }
    }

    /// Interns `token`, returning its existing id if already present.
    pub fn intern(&mut self, token: &str) -> WordId {
        if let Some(&id) = self.token_to_id.get(token) {
            return id;
        }
        let id = self.id_to_token.len() as WordId;
        self.token_to_id.insert(token.to_string(), id);
        self.id_to_token.push(token.to_string());
        id
    }
}

impl Vocabulary for MapVocabulary {
    fn index_of(&self, token: &str) -> Option<WordId> {
        self.token_to_id.get(token).copied()
    }

    fn token(&self, id: WordId) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    fn size(&self) -> usize {
        self.id_to_token.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_tokens_assigns_ids_in_order() {
        let vocab = MapVocabulary::from_tokens(["cat", "dog", "bird"]);
        assert_eq!(vocab.index_of("cat"), Some(0));
        assert_eq!(vocab.index_of("dog"), Some(1));
        assert_eq!(vocab.index_of("bird"), Some(2));
        assert_eq!(vocab.size(), 3);
    }

    #[test]
    fn duplicate_tokens_reuse_the_same_id() {
        let vocab = MapVocabulary::from_tokens(["cat", "dog", "cat"]);
        assert_eq!(vocab.size(), 2);
    }

    #[test]
    fn unknown_token_resolves_to_none() {
        let vocab = MapVocabulary::from_tokens(["cat"]);
        assert_eq!(vocab.index_of("elephant"), None);
    }

    #[test]
    fn intern_grows_the_vocabulary() {
        let mut vocab = MapVocabulary::from_tokens(["cat"]);
        let id = vocab.intern("dog");
        assert_eq!(id, 1);
        assert_eq!(vocab.intern("cat"), 0);
        assert_eq!(vocab.token(1), Some("dog"));
    }
}
