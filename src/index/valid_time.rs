//! Valid-time index for point-in-time lookups

use crate::core::temporal::Timestamp;

/// The `valid_from` of every record in the owning history, by offset.
///
/// Offsets are positions in the owning history, so a larger offset means a
/// later insertion. Lookups walk the column newest first and stop at the
/// caller's first match, so a query for recent knowledge touches few records.
#[derive(Debug, Clone, Default)]
pub struct ValidTimeIndex {
    starts: Vec<Timestamp>,
}

impl ValidTimeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of the record at `offset`, which must be the next offset
    pub fn add(&mut self, valid_from: Timestamp, offset: usize) {
        debug_assert_eq!(offset, self.starts.len());
        self.starts.push(valid_from);
    }

    /// Forget the most recently added record
    pub fn pop(&mut self) -> Option<Timestamp> {
        self.starts.pop()
    }

    /// Offsets of records starting at or before `valid_time`, newest insertion first.
    ///
    /// Records that start after `valid_time` can never contain it, so they are
    /// skipped; the caller still checks `valid_to` and transaction time.
    pub fn candidates(&self, valid_time: Timestamp) -> impl Iterator<Item = usize> + '_ {
        self.starts
            .iter()
            .enumerate()
            .rev()
            .filter(move |(_, start)| **start <= valid_time)
            .map(|(offset, _)| offset)
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_newest_first() {
        let mut index = ValidTimeIndex::new();
        index.add(Timestamp::from_secs(10), 0);
        index.add(Timestamp::from_secs(30), 1);
        index.add(Timestamp::from_secs(10), 2);
        index.add(Timestamp::from_secs(5), 3);

        assert_eq!(index.candidates(Timestamp::from_secs(20)).collect::<Vec<_>>(), vec![3, 2, 0]);
        assert_eq!(index.candidates(Timestamp::from_secs(30)).collect::<Vec<_>>(), vec![3, 2, 1, 0]);
        assert_eq!(index.candidates(Timestamp::from_secs(1)).count(), 0);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_candidates_are_lazy() {
        let mut index = ValidTimeIndex::new();
        for offset in 0..10_000 {
            index.add(Timestamp::from_secs(offset as i64), offset);
        }
        // the newest record matches, so nothing older is visited
        assert_eq!(index.candidates(Timestamp::from_secs(20_000)).next(), Some(9_999));
        assert_eq!(index.candidates(Timestamp::from_secs(0)).collect::<Vec<_>>(), vec![0]);

        assert_eq!(index.pop(), Some(Timestamp::from_secs(9_999)));
        assert_eq!(index.candidates(Timestamp::from_secs(20_000)).next(), Some(9_998));
    }
}
