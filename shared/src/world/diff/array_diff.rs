use std::{collections::HashMap, hash::Hash};

use serde::{Deserialize, Serialize};

/// Replace `delete_count` items at `start` with `items`. `start` indexes the
/// array as left by the previous instruction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpliceInstruction<T> {
    pub start: usize,
    pub delete_count: usize,
    pub items: Vec<T>,
}

impl<T> SpliceInstruction<T> {
    pub fn new(start: usize, delete_count: usize, items: Vec<T>) -> Self {
        Self {
            start,
            delete_count,
            items,
        }
    }

    pub fn map_items<U>(self, f: impl FnMut(T) -> U) -> SpliceInstruction<U> {
        SpliceInstruction {
            start: self.start,
            delete_count: self.delete_count,
            items: self.items.into_iter().map(f).collect(),
        }
    }

    pub fn try_map_items<U, E>(
        self,
        f: impl FnMut(T) -> Result<U, E>,
    ) -> Result<SpliceInstruction<U>, E> {
        Ok(SpliceInstruction {
            start: self.start,
            delete_count: self.delete_count,
            items: self.items.into_iter().map(f).collect::<Result<Vec<U>, E>>()?,
        })
    }
}

/// Splice instructions turning `before` into `after`.
///
/// Matching pairs the first remaining occurrence of a value in `before` with
/// its first remaining occurrence in `after`, then extends the run while both
/// sides keep agreeing. The result is correct but not a minimal edit script.
pub fn compute_splices<T: Clone + Eq + Hash>(before: &[T], after: &[T]) -> Vec<SpliceInstruction<T>> {
    if before.is_empty() {
        if after.is_empty() {
            return Vec::new();
        }
        return vec![SpliceInstruction::new(0, 0, after.to_vec())];
    }
    if after.is_empty() {
        return vec![SpliceInstruction::new(0, before.len(), Vec::new())];
    }
    if before.len() == after.len() && before == after {
        return Vec::new();
    }

    let mut after_positions: HashMap<&T, Vec<usize>> = HashMap::new();
    for (index, value) in after.iter().enumerate() {
        after_positions.entry(value).or_default().push(index);
    }

    let mut output = Vec::new();
    let mut before_cursor = 0;
    let mut after_cursor = 0;

    while before_cursor < before.len() || after_cursor < after.len() {
        let found = (before_cursor..before.len()).find_map(|before_index| {
            let positions = after_positions.get(&before[before_index])?;
            let slot = positions.partition_point(|position| *position < after_cursor);
            positions
                .get(slot)
                .map(|after_index| (before_index, *after_index))
        });

        let Some((before_index, after_index)) = found else {
            output.push(SpliceInstruction::new(
                after_cursor,
                before.len() - before_cursor,
                after[after_cursor..].to_vec(),
            ));
            break;
        };

        let mut run = 1;
        while before_index + run < before.len()
            && after_index + run < after.len()
            && before[before_index + run] == after[after_index + run]
        {
            run += 1;
        }

        if before_index != before_cursor || after_index != after_cursor {
            output.push(SpliceInstruction::new(
                after_cursor,
                before_index - before_cursor,
                after[after_cursor..after_index].to_vec(),
            ));
        }

        before_cursor = before_index + run;
        after_cursor = after_index + run;
    }

    output
}

/// Applies instructions in order. Out of range bounds are clamped.
pub fn apply_splices<T: Clone>(array: &mut Vec<T>, instructions: &[SpliceInstruction<T>]) {
    for instruction in instructions {
        let start = instruction.start.min(array.len());
        let end = start.saturating_add(instruction.delete_count).min(array.len());
        array.splice(start..end, instruction.items.iter().cloned());
    }
}
