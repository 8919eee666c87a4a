//! Compaction selection.
//!
//! Leveled strategy: level 0 compacts by file count (its files overlap, so
//! all of them go together), deeper levels by total byte size. The picked
//! upper-level files are joined by the overlapping files at the output
//! level so the output level stays disjoint.

use crate::compaction::version::Version;
use crate::compaction::{Compaction, CompactionInputLevel};
use crate::config::Options;
use crate::memtable::InternalKeyComparator;

/// Picks the next compaction, if any is warranted.
pub struct CompactionPicker {
    level0_threshold: usize,
    base_level_size: u64,
    level_size_multiplier: u64,
    max_levels: usize,
}

impl CompactionPicker {
    /// Builds a picker from the engine options.
    pub fn new(options: &Options) -> Self {
        Self {
            level0_threshold: options.level0_compaction_threshold,
            base_level_size: options.base_level_size,
            level_size_multiplier: options.level_size_multiplier,
            max_levels: options.max_levels,
        }
    }

    /// Byte budget for a level before it triggers compaction.
    pub fn target_size_for_level(&self, level: usize) -> u64 {
        if level == 0 {
            // Level 0 is governed by file count
            return u64::MAX;
        }
        let mut size = self.base_level_size;
        for _ in 1..level {
            size = size.saturating_mul(self.level_size_multiplier);
        }
        size
    }

    /// Selects input files, or `None` when no level needs work.
    pub fn pick(&self, current: &Version, icmp: &InternalKeyComparator) -> Option<Compaction> {
        if current.levels[0].len() >= self.level0_threshold {
            return self.pick_level(current, 0, icmp);
        }

        for level in 1..self.max_levels - 1 {
            if current.level_size(level) > self.target_size_for_level(level) {
                return self.pick_level(current, level, icmp);
            }
        }
        None
    }

    /// Builds a compaction taking `level`'s candidates plus the output
    /// level's overlap.
    fn pick_level(
        &self,
        current: &Version,
        level: usize,
        icmp: &InternalKeyComparator,
    ) -> Option<Compaction> {
        let upper_files = if level == 0 {
            // Level 0 files overlap each other; compact all of them
            current.levels[0].clone()
        } else {
            // Prefer files flagged by readers, otherwise take the first
            let files = &current.levels[level];
            let candidate = files
                .iter()
                .find(|f| f.marked_for_compaction)
                .or_else(|| files.first())?;
            vec![candidate.clone()]
        };
        if upper_files.is_empty() {
            return None;
        }

        let output_level = level + 1;
        let ucmp = icmp.user_comparator();
        let mut smallest = upper_files[0].smallest_user_key().to_vec();
        let mut largest = upper_files[0].largest_user_key().to_vec();
        for file in &upper_files[1..] {
            if ucmp.compare(file.smallest_user_key(), &smallest) == std::cmp::Ordering::Less {
                smallest = file.smallest_user_key().to_vec();
            }
            if ucmp.compare(file.largest_user_key(), &largest) == std::cmp::Ordering::Greater {
                largest = file.largest_user_key().to_vec();
            }
        }

        let overlap = current.overlapping_files(output_level, &smallest, &largest, icmp);

        log::info!(
            "picked compaction: level {} ({} files) + level {} ({} files)",
            level,
            upper_files.len(),
            output_level,
            overlap.len()
        );

        let mut inputs = vec![CompactionInputLevel { level, files: upper_files }];
        if !overlap.is_empty() {
            inputs.push(CompactionInputLevel { level: output_level, files: overlap });
        }
        Some(Compaction::new(inputs, output_level, current, icmp))
    }
}
