//! Splits the pending units into fixed-size batches.

use std::collections::HashSet;

use crate::checkpoint::Checkpoint;
use crate::unit::TransferUnit;

/// A group of units processed between two checkpoint flushes.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based position in the run.
    pub index: usize,
    pub units: Vec<TransferUnit>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Lazily yields [`Batch`]es of units that are not yet completed.
///
/// The pending set is computed once at construction, so the caller is free to
/// advance the checkpoint while iterating. Duplicate ids keep their first
/// occurrence; input order is preserved.
pub struct Batcher<'a> {
    units: &'a [TransferUnit],
    pending: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    next_index: usize,
    skipped: usize,
    duplicates: usize,
}

impl<'a> Batcher<'a> {
    pub fn new(units: &'a [TransferUnit], checkpoint: &Checkpoint, batch_size: usize) -> Self {
        let mut seen = HashSet::with_capacity(units.len());
        let mut pending = Vec::with_capacity(units.len());
        let mut skipped = 0;
        let mut duplicates = 0;

        for (i, unit) in units.iter().enumerate() {
            if !seen.insert(unit.id().as_str()) {
                duplicates += 1;
                continue;
            }
            if checkpoint.is_completed(unit.id().as_str()) {
                skipped += 1;
            } else {
                pending.push(i);
            }
        }

        Self {
            units,
            pending,
            cursor: 0,
            batch_size: batch_size.max(1),
            next_index: 0,
            skipped,
            duplicates,
        }
    }

    /// Units already completed in the checkpoint.
    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    /// Units that will be yielded in batches.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Repeated ids dropped from the input.
    pub fn duplicate_count(&self) -> usize {
        self.duplicates
    }

    /// Distinct ids in the input.
    pub fn distinct_count(&self) -> usize {
        self.skipped + self.pending.len()
    }

    pub fn batch_count(&self) -> usize {
        self.pending.len().div_ceil(self.batch_size)
    }
}

impl Iterator for Batcher<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.pending.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.pending.len());
        let units = self.pending[self.cursor..end]
            .iter()
            .map(|&i| self.units[i].clone())
            .collect();
        self.cursor = end;

        let batch = Batch {
            index: self.next_index,
            units,
        };
        self.next_index += 1;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::attempt::AttemptResult;
    use crate::unit::UnitId;

    fn units(n: usize) -> Vec<TransferUnit> {
        (0..n)
            .map(|i| TransferUnit::with_id(format!("unit_{i}"), format!("/s/{i}"), format!("d/{i}")))
            .collect()
    }

    fn ids(batch: &Batch) -> Vec<&str> {
        batch.units.iter().map(|u| u.id().as_str()).collect()
    }

    #[test]
    fn splits_in_order() {
        let units = units(10);
        let batches: Vec<_> = Batcher::new(&units, &Checkpoint::new(), 4).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].index, 0);
        assert_eq!(ids(&batches[0]), ["unit_0", "unit_1", "unit_2", "unit_3"]);
        assert_eq!(ids(&batches[2]), ["unit_8", "unit_9"]);
    }

    #[test]
    fn filters_completed_units() {
        let units = units(6);
        let mut checkpoint = Checkpoint::new();
        checkpoint.merge(&[
            AttemptResult::success(UnitId::from("unit_1"), 1, Duration::ZERO),
            AttemptResult::success(UnitId::from("unit_4"), 1, Duration::ZERO),
        ]);

        let batcher = Batcher::new(&units, &checkpoint, 3);
        assert_eq!(batcher.skipped_count(), 2);
        assert_eq!(batcher.pending_count(), 4);
        let all: Vec<_> = batcher.flat_map(|b| b.units).map(|u| u.id().clone()).collect();
        assert_eq!(
            all,
            ["unit_0", "unit_2", "unit_3", "unit_5"].map(UnitId::from)
        );
    }

    #[test]
    fn failed_units_are_retried() {
        let units = units(2);
        let mut checkpoint = Checkpoint::new();
        checkpoint.mark_failed(UnitId::from("unit_0"), "boom");
        assert_eq!(Batcher::new(&units, &checkpoint, 10).pending_count(), 2);
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let mut units = units(3);
        units.push(TransferUnit::with_id("unit_1", "/other", "other"));
        let batcher = Batcher::new(&units, &Checkpoint::new(), 10);
        assert_eq!(batcher.duplicate_count(), 1);
        assert_eq!(batcher.distinct_count(), 3);
        let batch: Vec<_> = batcher.collect();
        assert_eq!(batch[0].units[1].source(), "/s/1");
    }

    #[test]
    fn zero_batch_size_means_one() {
        let units = units(3);
        let mut batcher = Batcher::new(&units, &Checkpoint::new(), 0);
        assert_eq!(batcher.batch_count(), 3);
        assert!(batcher.all(|b| b.len() == 1));
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut batcher = Batcher::new(&[], &Checkpoint::new(), 4);
        assert_eq!(batcher.batch_count(), 0);
        assert!(batcher.next().is_none());
    }
}
