/// Suppresses values equal to the one immediately before them.
///
/// The remembered value is always the latest input, so a run of equal
/// values produces exactly one output.
#[derive(Debug)]
pub struct Dedup<T> {
    last: Option<T>,
}

impl<T: PartialEq + Clone> Dedup<T> {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Returns `Some(value)` when it differs from the previous input.
    pub fn admit(&mut self, value: T) -> Option<T> {
        if self.last.as_ref() == Some(&value) {
            return None;
        }
        self.last = Some(value.clone());
        Some(value)
    }
}

impl<T: PartialEq + Clone> Default for Dedup<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    fn run<T: PartialEq + Clone>(values: Vec<T>) -> Vec<T> {
        let mut dedup = Dedup::new();
        values.into_iter().filter_map(|v| dedup.admit(v)).collect()
    }

    #[test]
    fn test_first_value_always_emitted() {
        assert_eq!(run(vec![0]), vec![0]);
    }

    #[test]
    fn test_consecutive_duplicates_suppressed() {
        assert_eq!(run(vec![1, 1, 2, 2, 2, 1, 3, 3]), vec![1, 2, 1, 3]);
    }

    #[test]
    fn test_no_equal_neighbours_in_output() {
        let out = run(vec![5, 5, 4, 4, 5, 5, 5, 6, 6, 4]);
        assert!(out.windows(2).all(|w| w[0] != w[1]));
        assert_eq!(out.first(), Some(&5));
    }

    #[test]
    fn test_map_equality_is_order_independent() {
        let mut first = IndexMap::new();
        first.insert("a", 1);
        first.insert("b", 2);

        let mut reordered = IndexMap::new();
        reordered.insert("b", 2);
        reordered.insert("a", 1);

        let mut changed = reordered.clone();
        changed.insert("a", 3);

        let out = run(vec![first, reordered, changed.clone()]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], changed);
    }
}
