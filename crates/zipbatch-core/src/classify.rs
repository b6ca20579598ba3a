//! Explicit error-code → outcome tables.
//!
//! Actions that talk to a downstream service should map the service's
//! structured error codes through a table instead of matching on error text.
//! Codes the table does not know fall back to a designated outcome.

use std::collections::HashMap;

use crate::outcome::Outcome;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classified<O> {
    pub outcome: O,
    /// `false` when the code was unknown and the fallback was used.
    pub matched: bool,
}

#[derive(Clone, Debug)]
pub struct ClassificationTable<O: Outcome> {
    entries: HashMap<String, O>,
    fallback: O,
}

impl<O: Outcome> ClassificationTable<O> {
    /// Empty table that sends every code to `fallback`.
    pub fn new(fallback: O) -> Self {
        Self {
            entries: HashMap::new(),
            fallback,
        }
    }

    /// Add (or replace) a mapping. Codes are compared case-insensitively.
    pub fn with(mut self, code: &str, outcome: O) -> Self {
        self.entries.insert(normalize(code), outcome);
        self
    }

    pub fn classify(&self, code: &str) -> Classified<O> {
        match self.entries.get(&normalize(code)) {
            Some(outcome) => Classified {
                outcome: *outcome,
                matched: true,
            },
            None => {
                tracing::debug!(code, fallback = self.fallback.tag(), "unclassified code");
                Classified {
                    outcome: self.fallback,
                    matched: false,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<O: Outcome> FromIterator<(&'static str, O)> for ClassificationTable<O> {
    /// Collects into a table whose fallback is `O::failed()`.
    fn from_iter<I: IntoIterator<Item = (&'static str, O)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(O::failed()), |t, (code, o)| t.with(code, o))
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
