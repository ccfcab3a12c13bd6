//! Aligning the destination's auxiliary-directory containers with the
//! numbering used by the source backup.
//!
//! The work is driven by a [`ReorderIntent`] that is persisted before the
//! first container is touched and again after every stage, so an interrupted
//! reconciliation picks up where it stopped instead of planning from a
//! half-renamed layout.

use crate::catalog::{extra_dir_path, ExtraDirs};
use crate::fs::remove_dir_with_files;
use crate::utils::{MergeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How destination container numbers map onto the source numbering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renumbering {
    /// Old number to new number, for containers that change position
    pub moved: BTreeMap<usize, usize>,
    /// Numbers whose directory has no counterpart in the source
    pub removed: Vec<usize>,
}

impl Renumbering {
    /// Compute the plan from the two fixed lists.
    pub fn plan(to_list: &ExtraDirs, from_list: &ExtraDirs) -> Self {
        let mut plan = Self::default();
        for (num, path) in to_list.iter() {
            match from_list.number_of(path) {
                None => plan.removed.push(num),
                Some(new) if new != num => {
                    plan.moved.insert(num, new);
                }
                Some(_) => {}
            }
        }
        plan
    }

    /// New number for an entry stored under container `num`; `None` when
    /// the container was removed. 0 (the primary root) is never remapped.
    pub fn apply(&self, num: usize) -> Option<usize> {
        if num == 0 {
            return Some(0);
        }
        if self.removed.contains(&num) {
            return None;
        }
        Some(self.moved.get(&num).copied().unwrap_or(num))
    }

    pub fn is_identity(&self) -> bool {
        self.moved.is_empty() && self.removed.is_empty()
    }
}

/// Progress of a reconciliation, in the order the stages complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderStage {
    /// Nothing confirmed on disk yet
    Planned,
    /// Removals done, every moving container parked under its staging name
    Staged,
    /// Containers in place and the destination manifest renumbered
    Renumbered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderIntent {
    pub renumbering: Renumbering,
    pub stage: ReorderStage,
}

impl ReorderIntent {
    pub fn new(to_list: &ExtraDirs, from_list: &ExtraDirs) -> Self {
        Self {
            renumbering: Renumbering::plan(to_list, from_list),
            stage: ReorderStage::Planned,
        }
    }
}

/// Rename and prune the containers under `prefix` so that every directory
/// present in both lists sits at its source-side number.
///
/// Removals happen first. Moves go through a staging name so that two
/// containers can trade places. A container missing on disk is skipped.
/// `persist` is called whenever `intent` advances a stage; repeating the
/// call with the last persisted intent completes the same layout.
pub fn reconcile<F>(prefix: &Path, intent: &mut ReorderIntent, mut persist: F) -> Result<()>
where
    F: FnMut(&ReorderIntent) -> Result<()>,
{
    if intent.stage == ReorderStage::Planned {
        for &num in &intent.renumbering.removed {
            let path = extra_dir_path(prefix, num);
            if path.exists() {
                info!("Remove auxiliary directory container \"{}\"", path.display());
                remove_dir_with_files(&path)?;
            }
        }

        // Until the stage is recorded no container has reached its new
        // number, so `externaldir{old}` still holds the original content
        for &old in intent.renumbering.moved.keys() {
            let path = extra_dir_path(prefix, old);
            let staging = staging_path(prefix, old);
            if staging.exists() {
                debug!("Container \"{}\" is already staged", path.display());
                continue;
            }
            if !path.exists() {
                debug!("Container \"{}\" does not exist, skipping", path.display());
                continue;
            }
            rename_dir(&path, &staging)?;
        }

        intent.stage = ReorderStage::Staged;
        persist(intent)?;
    }

    for (&old, &new) in &intent.renumbering.moved {
        let staging = staging_path(prefix, old);
        if !staging.exists() {
            continue;
        }
        let target = extra_dir_path(prefix, new);
        debug!("Rename {} to {}", staging.display(), target.display());
        rename_dir(&staging, &target)?;
    }

    Ok(())
}

fn staging_path(prefix: &Path, num: usize) -> PathBuf {
    prefix.join(format!("externaldir{num}.reorder"))
}

fn rename_dir(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|source| MergeError::RenameFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}
