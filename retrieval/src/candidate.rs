//! Candidate sets and queries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// One searchable item: a movie and its plot, a page of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Unique within its set.
    pub label: String,

    /// Text that gets embedded.
    pub text: String,
}

/// Ordered collection of candidates with unique labels.
///
/// Texts may repeat across labels; repeated texts share one cache entry.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    candidates: Vec<Candidate>,
    by_label: HashMap<String, usize>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `(label, text)` pairs, rejecting duplicate labels.
    pub fn from_pairs<I, L, T>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        let mut set = Self::new();
        for (label, text) in pairs {
            set.push(label, text)?;
        }
        Ok(set)
    }

    /// Append a candidate.
    pub fn push(&mut self, label: impl Into<String>, text: impl Into<String>) -> Result<()> {
        let label = label.into();
        if self.by_label.contains_key(&label) {
            return Err(RetrievalError::InvalidInput(format!(
                "duplicate candidate label: {label}"
            )));
        }
        self.by_label.insert(label.clone(), self.candidates.len());
        self.candidates.push(Candidate {
            label,
            text: text.into(),
        });
        Ok(())
    }

    pub fn get(&self, label: &str) -> Option<&Candidate> {
        self.by_label.get(label).map(|&i| &self.candidates[i])
    }

    pub fn contains(&self, label: &str) -> bool {
        self.by_label.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }
}

impl<'a> IntoIterator for &'a CandidateSet {
    type Item = &'a Candidate;
    type IntoIter = std::slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}

/// What to search for: a label from the candidate set, raw text, or a label
/// with text to fall back on when the label is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    label: Option<String>,
    text: Option<String>,
}

impl Query {
    /// Query by the label of a candidate; that candidate is excluded from
    /// the results.
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            text: None,
        }
    }

    /// Query by free text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            label: None,
            text: Some(text.into()),
        }
    }

    /// Query by label, embedding `text` instead if the label is not in the
    /// candidate set.
    pub fn label_or_text(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            text: Some(text.into()),
        }
    }

    pub fn label_str(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn text_str(&self) -> Option<&str> {
        self.text.as_deref()
    }
}
