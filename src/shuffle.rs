use rand::Rng;
use rand::seq::SliceRandom;

/// Per-player, per-question ordering of answer options.
///
/// `order[presented]` is the canonical (authoring-time) index of the option
/// shown at position `presented`. A fresh order is generated when a question
/// is dispatched and kept only until that question is scored, so screens
/// can't be compared and scripted clients can't rely on a fixed layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerOrder {
    order: Vec<usize>,
}

impl AnswerOrder {
    /// The unshuffled ordering, used when shuffling is disabled.
    pub fn identity(option_count: usize) -> Self {
        Self {
            order: (0..option_count).collect(),
        }
    }

    /// Uniformly random permutation of `0..option_count`.
    pub fn random<R: Rng + ?Sized>(option_count: usize, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..option_count).collect();
        order.shuffle(rng);
        Self { order }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Options reordered the way this player sees them.
    pub fn presented(&self, options: &[String]) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|&canonical| options.get(canonical).cloned())
            .collect()
    }

    /// Map an index the player clicked back to the canonical index.
    /// Out-of-range input yields `None`.
    pub fn canonical(&self, presented: usize) -> Option<usize> {
        self.order.get(presented).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_order_is_a_bijection() {
        let mut rng = rand::rng();
        for n in 2..=4 {
            let order = AnswerOrder::random(n, &mut rng);
            let seen: HashSet<usize> = (0..n).map(|i| order.canonical(i).unwrap()).collect();
            assert_eq!(seen.len(), n);
            assert!(seen.iter().all(|&i| i < n));
        }
    }

    #[test]
    fn round_trip_recovers_canonical_index() {
        let mut rng = rand::rng();
        let options: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        for _ in 0..50 {
            let order = AnswerOrder::random(options.len(), &mut rng);
            let presented = order.presented(&options);
            for (pos, shown) in presented.iter().enumerate() {
                let canonical = order.canonical(pos).unwrap();
                assert_eq!(&options[canonical], shown);
            }
        }
    }

    #[test]
    fn identity_maps_straight_through() {
        let order = AnswerOrder::identity(4);
        for i in 0..4 {
            assert_eq!(order.canonical(i), Some(i));
        }
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let order = AnswerOrder::identity(3);
        assert_eq!(order.canonical(3), None);
        assert_eq!(order.canonical(usize::MAX), None);
    }
}
