//! Merge reducers for replicated lists.
//!
//! Both reducers are pure: they take the local list by value, read the
//! remote records, and hand back the canonical list together with a
//! `changed` flag. Callers skip the durable write and the notification
//! when nothing changed.
//!
//! - Players: whole-record last-write-wins. A remote record replaces the
//!   local one with the same id whenever the two differ.
//! - Rolls: append-only, deduplicated by id, re-sorted by `created_at`
//!   descending after any insertion. Stored rolls are never rewritten.

use std::collections::{HashMap, HashSet};

use crate::model::{Player, Roll};

/// Result of one merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome<T> {
    pub list: Vec<T>,
    pub changed: bool,
}

impl<T> MergeOutcome<T> {
    fn unchanged(list: Vec<T>) -> Self {
        Self { list, changed: false }
    }
}

/// Merge remote players into the local list.
///
/// Existing records keep their position when overwritten; unseen ids are
/// appended in remote order.
pub fn merge_players(local: Vec<Player>, remote: &[Player]) -> MergeOutcome<Player> {
    let mut list = local;
    let mut index: HashMap<String, usize> = list
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.clone(), i))
        .collect();

    let mut changed = false;
    for incoming in remote {
        match index.get(&incoming.id) {
            Some(&i) => {
                if list[i] != *incoming {
                    list[i] = incoming.clone();
                    changed = true;
                }
            }
            None => {
                index.insert(incoming.id.clone(), list.len());
                list.push(incoming.clone());
                changed = true;
            }
        }
    }

    if changed {
        MergeOutcome { list, changed }
    } else {
        MergeOutcome::unchanged(list)
    }
}

/// Merge remote rolls into the local list.
pub fn merge_rolls(local: Vec<Roll>, remote: &[Roll]) -> MergeOutcome<Roll> {
    let mut list = local;
    let mut seen: HashSet<String> = list.iter().map(|r| r.id.clone()).collect();

    let mut changed = false;
    for incoming in remote {
        if seen.insert(incoming.id.clone()) {
            list.push(incoming.clone());
            changed = true;
        }
    }

    if !changed {
        return MergeOutcome::unchanged(list);
    }

    sort_newest_first(&mut list);
    MergeOutcome { list, changed }
}

/// Stable sort by `created_at` descending.
pub fn sort_newest_first(rolls: &mut [Roll]) {
    rolls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
