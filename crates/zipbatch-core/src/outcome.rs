use std::{fmt::Debug, hash::Hash};

/// Closed set of result tags for one pipeline.
///
/// Every item gets exactly one outcome per run. `failed()` is where items land
/// when their action errors out.
pub trait Outcome: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Stable, filesystem-safe tag (used for bucket dirs and archive names).
    fn tag(&self) -> &'static str;

    /// All outcomes in display order.
    fn all() -> &'static [Self];

    /// Outcome used when the per-item action fails.
    fn failed() -> Self;
}

/// Ordered per-outcome counts.
#[derive(Clone, Debug)]
pub struct Tally<O: Outcome> {
    counts: Vec<(O, usize)>,
}

impl<O: Outcome> Default for Tally<O> {
    fn default() -> Self {
        Self {
            counts: O::all().iter().map(|o| (*o, 0)).collect(),
        }
    }
}

impl<O: Outcome> Tally<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: O) {
        match self.counts.iter_mut().find(|(o, _)| *o == outcome) {
            Some((_, n)) => *n += 1,
            // `all()` should be exhaustive; keep the count anyway so nothing is dropped.
            None => self.counts.push((outcome, 1)),
        }
    }

    pub fn get(&self, outcome: O) -> usize {
        self.counts
            .iter()
            .find(|(o, _)| *o == outcome)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (O, usize)> + '_ {
        self.counts.iter().copied()
    }

    /// One-line summary, e.g. `complete: 3 | no_sidecar: 0 | failed: 1`.
    pub fn summary(&self) -> String {
        self.counts
            .iter()
            .map(|(o, n)| format!("{}: {n}", o.tag()))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Ab;
    use super::*;

    #[test]
    fn tally_counts_in_declared_order() {
        let mut t = Tally::<Ab>::new();
        t.record(Ab::B);
        t.record(Ab::Failed);
        t.record(Ab::B);
        assert_eq!(t.get(Ab::A), 0);
        assert_eq!(t.get(Ab::B), 2);
        assert_eq!(t.total(), 3);
        assert_eq!(t.summary(), "a: 0 | b: 2 | failed: 1");
    }
}
