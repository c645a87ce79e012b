//! Category Memory: the growing vocabulary of competition labels that is
//! fed back into every prompt so the model reuses names instead of
//! inventing near-duplicates.
//!
//! Lifecycle: `seed` -> `rehydrate` -> `learn`* -> `snapshot`. Labels are
//! never removed.

use std::collections::BTreeSet;

use itertools::Itertools;
use tracing::debug;

use crate::codec;

pub const SEED_CATEGORIES: &[&str] = &[
    "Web Development",
    "UI/UX Design",
    "Competitive Programming",
    "Data Science",
    "Cyber Security",
    "Mobile Development",
    "Game Development",
    "Poster Design",
    "Business Case",
    "Essay",
    "Photography",
    "Videography",
    "Science Olympiad",
    "Religious Competition",
    "Non-IT Competition",
];

#[derive(Debug, Clone, Default)]
pub struct CategoryMemory {
    labels: BTreeSet<String>,
}

impl CategoryMemory {
    pub fn seed() -> Self {
        let mut memory = CategoryMemory::default();
        memory.learn(SEED_CATEGORIES);
        memory
    }

    /// Add every new non-empty label. Returns how many were new.
    pub fn learn<I, S>(&mut self, labels: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for label in labels {
            let label = label.as_ref().trim();
            if label.is_empty() || codec::is_missing(label) {
                continue;
            }
            if self.labels.insert(label.to_string()) {
                added += 1;
            }
        }
        added
    }

    /// Relearn from stored category cells. Cells that do not decode as a
    /// list are skipped. Returns the number of skipped cells.
    pub fn rehydrate<'a, I>(&mut self, cells: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut skipped = 0;
        for cell in cells {
            match codec::decode_list(cell) {
                Ok(Some(labels)) => {
                    self.learn(labels);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(cell, error = %e, "skipping undecodable category cell");
                    skipped += 1;
                }
            }
        }
        skipped
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Sorted, comma-joined labels for prompt embedding.
    pub fn snapshot(&self) -> String {
        self.labels.iter().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_contains_defaults() {
        let m = CategoryMemory::seed();
        assert_eq!(m.len(), SEED_CATEGORIES.len());
        assert!(m.contains("Web Development"));
    }

    #[test]
    fn learn_skips_blanks_and_duplicates() {
        let mut m = CategoryMemory::seed();
        let before = m.len();
        let added = m.learn(["Essay", "  ", "", "nan", "Robotics", " Robotics "]);
        assert_eq!(added, 1);
        assert_eq!(m.len(), before + 1);
        assert!(m.contains("Robotics"));
    }

    #[test]
    fn rehydrate_tolerates_bad_cells() {
        let mut m = CategoryMemory::default();
        let skipped = m.rehydrate([
            r#"["Hackathon"]"#,
            "['Smart City', 'AI']",
            "not a list",
            "",
            "nan",
        ]);
        assert_eq!(skipped, 1);
        assert_eq!(m.snapshot(), "AI, Hackathon, Smart City");
    }

    #[test]
    fn snapshot_is_sorted_and_joined() {
        let mut m = CategoryMemory::default();
        m.learn(["b", "a", "c", "a"]);
        assert_eq!(m.snapshot(), "a, b, c");
    }

    #[test]
    fn size_never_decreases() {
        let mut m = CategoryMemory::seed();
        let mut last = m.len();
        for batch in [vec!["X"], vec![], vec!["X", "Y"], vec!["Essay"]] {
            m.learn(batch);
            assert!(m.len() >= last);
            last = m.len();
        }
        assert!(m.contains("X") && m.contains("Y"));
    }
}
