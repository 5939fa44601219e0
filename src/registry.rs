//! The part registry: the authoritative in-memory view of a table's parts.
//!
//! Two sets live here, each under its own mutex:
//! - `active` — the parts queries see. An antichain under containment.
//! - `all_known` — `active` plus obsolete parts waiting out their grace
//!   period.
//!
//! Lock order is `active` before `all_known`, always; `column_sizes` only
//! ever nests inside `active`. The garbage-collection and temp-reaper
//! scans serialize themselves with `try_lock` guards — a second concurrent
//! scan is a no-op, not a wait.
//!
//! The registry also owns the commit primitive ([`PartRegistry::commit_new`]):
//! block-number allocation, duplicate detection, the rename into place,
//! and the two neighbor scans that retire covered parts must happen under
//! one hold of the `active` lock, or a concurrent merge selection could
//! skip over a part it has never seen.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use log::{debug, info, warn};

use crate::checksums::VerifyMode;
use crate::error::{MergeTreeError, Result};
use crate::part::{BrokenPartAction, DataPart, classify_broken};
use crate::part_name::PartInfo;
use crate::settings::MergeTreeSettings;
use crate::types::ColumnDescription;
use crate::writer::FinishedPart;

/// Directory holding quarantined parts, inside the table directory.
pub const DETACHED_DIR_NAME: &str = "detached";

/// Prefix of in-flight temporary part directories.
pub const TMP_PREFIX: &str = "tmp_";

/// Outcome of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub part: Arc<DataPart>,
    /// Active parts the new part superseded.
    pub replaced: Vec<Arc<DataPart>>,
    /// The new part arrived already covered by an active part: it was
    /// recorded in `all_known` only and marked obsolete immediately.
    pub covered: bool,
}

/// Pending commit that reverts the in-memory sets unless committed.
///
/// The rename into place has already happened by the time a transaction
/// exists; rollback restores the previous *visibility* (the replaced
/// parts become active again, the new part is withdrawn) and leaves the
/// new directory for the next load or reaper to deal with.
#[must_use = "an uncommitted transaction rolls back on drop"]
pub struct PartTransaction<'a> {
    registry: &'a PartRegistry,
    result: Option<CommitResult>,
}

impl PartTransaction<'_> {
    pub fn commit(mut self) -> CommitResult {
        self.result.take().expect("transaction consumed twice")
    }

    pub fn result(&self) -> &CommitResult {
        self.result.as_ref().expect("transaction consumed")
    }
}

impl Drop for PartTransaction<'_> {
    fn drop(&mut self) {
        if let Some(result) = self.result.take() {
            warn!("rolling back commit of part {}", result.part.name());
            self.registry.rollback(result);
        }
    }
}

/// The registry proper.
pub struct PartRegistry {
    table_dir: PathBuf,
    /// Width of the primary key; parts need it to load their index.
    key_size: usize,
    settings: Arc<MergeTreeSettings>,
    active: Mutex<BTreeMap<PartInfo, Arc<DataPart>>>,
    all_known: Mutex<BTreeMap<PartInfo, Arc<DataPart>>>,
    /// Total bytes per column, summed over active parts.
    column_sizes: Mutex<HashMap<String, u64>>,
    grab_old_parts_lock: Mutex<()>,
    clear_temp_dirs_lock: Mutex<()>,
}

impl PartRegistry {
    pub fn new(table_dir: &Path, key_size: usize, settings: Arc<MergeTreeSettings>) -> PartRegistry {
        PartRegistry {
            table_dir: table_dir.to_path_buf(),
            key_size,
            settings,
            active: Mutex::new(BTreeMap::new()),
            all_known: Mutex::new(BTreeMap::new()),
            column_sizes: Mutex::new(HashMap::new()),
            grab_old_parts_lock: Mutex::new(()),
            clear_temp_dirs_lock: Mutex::new(()),
        }
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    // ── Loading ──────────────────────────────────────────────────────────

    /// Scan the table directory, load every well-named part, quarantine or
    /// drop broken ones, and collapse contained parts into obsolescence.
    pub fn load_from_disk(&self, skip_sanity_checks: bool) -> Result<()> {
        let entries = fs::read_dir(&self.table_dir)
            .map_err(|e| MergeTreeError::io(self.table_dir.clone(), e))?;

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MergeTreeError::io(self.table_dir.clone(), e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| MergeTreeError::io(entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TMP_PREFIX) || name == DETACHED_DIR_NAME {
                continue;
            }
            if PartInfo::parse(&name).is_none() {
                debug!("ignoring non-part directory {name}");
                continue;
            }
            names.push(name);
        }
        let infos: Vec<PartInfo> = names
            .iter()
            .filter_map(|name| PartInfo::parse(name))
            .collect();

        let mut loaded: Vec<Arc<DataPart>> = Vec::new();
        let mut suspicious_broken = 0usize;
        for name in &names {
            let broken_error = match self.load_one(name) {
                Ok(part) => {
                    loaded.push(part);
                    continue;
                }
                Err(e) if e.marks_part_broken() => e,
                // Environmental failures must not condemn the part.
                Err(e) => return Err(e),
            };

            suspicious_broken += 1;
            if !skip_sanity_checks && suspicious_broken > self.settings.max_suspicious_broken_parts
            {
                return Err(MergeTreeError::TooManyBrokenParts {
                    count: suspicious_broken,
                    limit: self.settings.max_suspicious_broken_parts,
                });
            }

            let info = PartInfo::parse(name).expect("name pre-filtered as well-formed");
            let covering = infos
                .iter()
                .filter(|other| **other != info && other.contains(&info))
                .count();
            match classify_broken(&info, covering) {
                BrokenPartAction::Remove => {
                    warn!("removing broken part {name}: {broken_error}");
                    let path = self.table_dir.join(name);
                    fs::remove_dir_all(&path).map_err(|e| MergeTreeError::io(path, e))?;
                }
                BrokenPartAction::Detach => {
                    warn!("detaching broken part {name} for manual resolution: {broken_error}");
                    self.move_to_detached(name, "broken_")?;
                }
            }
        }

        loaded.sort_by(|a, b| a.info().cmp(b.info()));

        // Collapse containment chains: only maximal parts stay active.
        let mut kept: Vec<Arc<DataPart>> = Vec::new();
        let mut obsolete: Vec<Arc<DataPart>> = Vec::new();
        for part in loaded {
            while let Some(last) = kept.last() {
                if part.info().contains(last.info()) {
                    obsolete.push(kept.pop().expect("checked non-empty"));
                } else {
                    break;
                }
            }
            match kept.last() {
                Some(last) if last.info().contains(part.info()) => obsolete.push(part),
                _ => kept.push(part),
            }
        }

        let mut active = self.active.lock().expect("active mutex poisoned");
        let mut all_known = self.all_known.lock().expect("all_known mutex poisoned");
        active.clear();
        all_known.clear();
        for part in &kept {
            active.insert(*part.info(), part.clone());
            all_known.insert(*part.info(), part.clone());
        }
        for part in &obsolete {
            info!("part {} is covered on load; scheduling removal", part.name());
            part.set_remove_time_now();
            all_known.insert(*part.info(), part.clone());
        }
        drop(all_known);
        self.recompute_column_sizes(&active);
        info!(
            "loaded {} active parts, {} obsolete, {} broken",
            kept.len(),
            obsolete.len(),
            suspicious_broken
        );
        Ok(())
    }

    fn load_one(&self, name: &str) -> Result<Arc<DataPart>> {
        clean_alter_debris(&self.table_dir.join(name))?;
        let part = DataPart::load(&self.table_dir, name, self.key_size)?;
        part.check_not_broken(false, VerifyMode::SizesOnly)?;
        Ok(Arc::new(part))
    }

    // ── Commit ───────────────────────────────────────────────────────────

    /// Rename a finished temp part into place and reconcile the sets.
    ///
    /// `block_range` is `Some((min, max, level))` for merge outputs; for
    /// inserts it is `None` and one fresh number is taken from
    /// `increment`. Allocation, duplicate detection, rename, and the
    /// neighbor scans all happen under the `active` lock.
    pub fn commit_new(
        &self,
        temp_dir: &Path,
        left_date: NaiveDate,
        right_date: NaiveDate,
        block_range: Option<(u64, u64, u32)>,
        increment: &AtomicU64,
        columns: Vec<ColumnDescription>,
        finished: FinishedPart,
    ) -> Result<PartTransaction<'_>> {
        let mut active = self.active.lock().expect("active mutex poisoned");

        let info = match block_range {
            Some((min_block, max_block, level)) => PartInfo {
                left_date,
                right_date,
                min_block,
                max_block,
                level,
            },
            None => {
                let block = increment.fetch_add(1, Ordering::SeqCst) + 1;
                PartInfo::new_insert(left_date, right_date, block)
            }
        };
        let name = info.name();

        {
            let all_known = self.all_known.lock().expect("all_known mutex poisoned");
            if all_known.contains_key(&info) {
                return Err(MergeTreeError::DuplicatePartName(name));
            }
        }

        let final_path = self.table_dir.join(&name);
        fs::rename(temp_dir, &final_path).map_err(|e| MergeTreeError::io(final_path, e))?;
        // The rename is the commit point; it must be durable before the
        // part becomes visible.
        fsync_dir(&self.table_dir)?;

        let part = Arc::new(DataPart::from_finished(&self.table_dir, info, columns, finished));
        let (replaced, covered) = Self::integrate_locked(&mut active, &part);

        {
            let mut all_known = self.all_known.lock().expect("all_known mutex poisoned");
            all_known.insert(info, part.clone());
        }

        let mut sizes = self.column_sizes.lock().expect("column_sizes poisoned");
        for old in &replaced {
            subtract_part_sizes(&mut sizes, old);
        }
        if !covered {
            add_part_sizes(&mut sizes, &part);
        }
        drop(sizes);
        drop(active);

        if covered {
            info!("part {name} is covered on arrival; kept out of the active set");
        } else {
            info!("committed part {name}, replacing {} parts", replaced.len());
        }
        Ok(PartTransaction {
            registry: self,
            result: Some(CommitResult {
                part,
                replaced,
                covered,
            }),
        })
    }

    /// Add an externally placed, already-loaded part (ATTACH).
    pub fn attach(&self, part: Arc<DataPart>) -> Result<CommitResult> {
        let mut active = self.active.lock().expect("active mutex poisoned");
        {
            let all_known = self.all_known.lock().expect("all_known mutex poisoned");
            if all_known.contains_key(part.info()) {
                return Err(MergeTreeError::DuplicatePartName(part.name()));
            }
        }
        let (replaced, covered) = Self::integrate_locked(&mut active, &part);
        self.all_known
            .lock()
            .expect("all_known mutex poisoned")
            .insert(*part.info(), part.clone());
        let mut sizes = self.column_sizes.lock().expect("column_sizes poisoned");
        for old in &replaced {
            subtract_part_sizes(&mut sizes, old);
        }
        if !covered {
            add_part_sizes(&mut sizes, &part);
        }
        Ok(CommitResult {
            part,
            replaced,
            covered,
        })
    }

    /// The §4.5.1 neighbor scans, under an already-held `active` lock.
    /// Returns the replaced parts and whether the new part is covered.
    fn integrate_locked(
        active: &mut MutexGuard<'_, BTreeMap<PartInfo, Arc<DataPart>>>,
        part: &Arc<DataPart>,
    ) -> (Vec<Arc<DataPart>>, bool) {
        let info = *part.info();
        let mut replaced: Vec<Arc<DataPart>> = Vec::new();
        let mut covered = false;

        // Scan left from the insertion point.
        for (neighbor_info, neighbor) in active.range(..info).rev() {
            if info.contains(neighbor_info) {
                replaced.push(neighbor.clone());
            } else {
                // The first non-contained neighbor may itself cover us.
                covered = neighbor_info.contains(&info);
                break;
            }
        }
        // Symmetric scan to the right.
        if !covered {
            for (neighbor_info, neighbor) in active.range(info..) {
                if info.contains(neighbor_info) {
                    replaced.push(neighbor.clone());
                } else {
                    covered = neighbor_info.contains(&info);
                    break;
                }
            }
        }

        if covered {
            part.set_remove_time_now();
            (Vec::new(), true)
        } else {
            for old in &replaced {
                old.set_remove_time_now();
                active.remove(old.info());
            }
            active.insert(info, part.clone());
            (replaced, false)
        }
    }

    /// Revert an uncommitted transaction: withdraw the new part, restore
    /// the replaced ones.
    fn rollback(&self, result: CommitResult) {
        let mut active = self.active.lock().expect("active mutex poisoned");
        active.remove(result.part.info());
        {
            let mut all_known = self.all_known.lock().expect("all_known mutex poisoned");
            all_known.remove(result.part.info());
        }
        let mut sizes = self.column_sizes.lock().expect("column_sizes poisoned");
        if !result.covered {
            subtract_part_sizes(&mut sizes, &result.part);
        }
        for old in &result.replaced {
            old.clear_remove_time();
            active.insert(*old.info(), old.clone());
            add_part_sizes(&mut sizes, old);
        }
    }

    // ── Garbage collection ───────────────────────────────────────────────

    /// Take out of `all_known` every obsolete part that is uniquely held
    /// and past its grace period. At most one scan runs at a time; a
    /// concurrent call returns empty.
    pub fn grab_old_parts(&self) -> Vec<Arc<DataPart>> {
        let Ok(_guard) = self.grab_old_parts_lock.try_lock() else {
            return Vec::new();
        };
        let now = epoch_secs();
        let lifetime = self.settings.old_parts_lifetime_secs;

        let mut all_known = self.all_known.lock().expect("all_known mutex poisoned");
        let mut grabbed = Vec::new();
        all_known.retain(|_, part| {
            let expired = matches!(part.remove_time(), Some(t) if t.saturating_add(lifetime) <= now);
            // One strong reference means only this map holds the part; an
            // in-flight reader would show up as a second.
            if expired && Arc::strong_count(part) == 1 {
                grabbed.push(part.clone());
                false
            } else {
                true
            }
        });
        grabbed
    }

    /// Physically delete a grabbed part's directory.
    pub fn remove_part_directory(&self, part: &DataPart) -> Result<()> {
        let path = part.path();
        info!("removing old part {}", part.name());
        fs::remove_dir_all(&path).map_err(|e| MergeTreeError::io(path, e))
    }

    /// Delete `tmp_*` directories older than the configured lifetime.
    /// Returns how many were removed; a concurrent call is a no-op.
    pub fn drop_temp_directories(&self) -> Result<usize> {
        let Ok(_guard) = self.clear_temp_dirs_lock.try_lock() else {
            return Ok(0);
        };
        let deadline = SystemTime::now()
            - std::time::Duration::from_secs(self.settings.temporary_directories_lifetime_secs);
        let entries = fs::read_dir(&self.table_dir)
            .map_err(|e| MergeTreeError::io(self.table_dir.clone(), e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| MergeTreeError::io(self.table_dir.clone(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(TMP_PREFIX) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            if modified < deadline {
                warn!("removing stale temporary directory {name}");
                fs::remove_dir_all(entry.path())
                    .map_err(|e| MergeTreeError::io(entry.path(), e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Detach ───────────────────────────────────────────────────────────

    /// Remove a part from both sets and move its directory into
    /// `detached/` under `prefix`. With `restore_covered`, walk
    /// `all_known` for a covering sequence of smaller parts and bring
    /// them back into the active set, logging any block-range gap.
    pub fn rename_and_detach(
        &self,
        info: &PartInfo,
        prefix: &str,
        restore_covered: bool,
    ) -> Result<()> {
        // Withdraw from both sets first; the rename happens with no set
        // mutex held.
        let (part, was_active) = {
            let mut active = self.active.lock().expect("active mutex poisoned");
            let part = {
                let mut all_known = self.all_known.lock().expect("all_known mutex poisoned");
                all_known
                    .remove(info)
                    .ok_or_else(|| MergeTreeError::InvalidName(format!("no such part: {info}")))?
            };
            let was_active = active.remove(info).is_some();
            if was_active {
                let mut sizes = self.column_sizes.lock().expect("column_sizes poisoned");
                subtract_part_sizes(&mut sizes, &part);
            }
            (part, was_active)
        };

        self.move_to_detached(&part.name(), prefix)?;
        info!("detached part {} with prefix {prefix:?}", part.name());

        if restore_covered && was_active {
            let mut active = self.active.lock().expect("active mutex poisoned");
            self.restore_covering_sequence(&mut active, info);
        }
        Ok(())
    }

    /// Bring back the maximal `all_known` parts contained in `info`.
    fn restore_covering_sequence(
        &self,
        active: &mut MutexGuard<'_, BTreeMap<PartInfo, Arc<DataPart>>>,
        info: &PartInfo,
    ) {
        let candidates: Vec<Arc<DataPart>> = {
            let all_known = self.all_known.lock().expect("all_known mutex poisoned");
            all_known
                .values()
                .filter(|p| info.contains(p.info()) && *p.info() != *info)
                .cloned()
                .collect()
        };
        // Only maximal candidates: skip anything covered by another one.
        let mut restored: Vec<Arc<DataPart>> = candidates
            .iter()
            .filter(|part| {
                !candidates.iter().any(|other| {
                    *other.info() != *part.info() && other.info().contains(part.info())
                })
            })
            .cloned()
            .collect();
        restored.sort_by(|a, b| a.info().cmp(b.info()));

        let mut next_expected = info.min_block;
        for part in &restored {
            if part.info().min_block > next_expected {
                warn!(
                    "integrity gap while restoring cover of {}: blocks [{}, {}] have no part",
                    info,
                    next_expected,
                    part.info().min_block - 1
                );
            }
            part.clear_remove_time();
            active.insert(*part.info(), part.clone());
            {
                let mut all_known = self.all_known.lock().expect("all_known mutex poisoned");
                all_known.insert(*part.info(), part.clone());
            }
            let mut sizes = self.column_sizes.lock().expect("column_sizes poisoned");
            add_part_sizes(&mut sizes, part);
            next_expected = part.info().max_block + 1;
            info!("restored covered part {}", part.name());
        }
        if next_expected <= info.max_block {
            warn!(
                "integrity gap while restoring cover of {}: blocks [{}, {}] have no part",
                info, next_expected, info.max_block
            );
        }
    }

    fn move_to_detached(&self, dir_name: &str, prefix: &str) -> Result<()> {
        let detached = self.table_dir.join(DETACHED_DIR_NAME);
        fs::create_dir_all(&detached).map_err(|e| MergeTreeError::io(detached.clone(), e))?;
        let source = self.table_dir.join(dir_name);
        let target = detached.join(format!("{prefix}{dir_name}"));
        fs::rename(&source, &target).map_err(|e| MergeTreeError::io(target, e))
    }

    // ── Snapshots & accounting ───────────────────────────────────────────

    /// The active parts, in registry order. Clones keep the parts alive
    /// for the caller's lifetime regardless of concurrent merges.
    pub fn snapshot(&self) -> Vec<Arc<DataPart>> {
        self.active
            .lock()
            .expect("active mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Every known part, including obsolete ones.
    pub fn all_parts(&self) -> Vec<Arc<DataPart>> {
        self.all_known
            .lock()
            .expect("all_known mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// The partition with the most active parts, and its count — the
    /// backpressure input. Obsolete parts do not count.
    pub fn busiest_partition(&self) -> Option<(u32, usize)> {
        let active = self.active.lock().expect("active mutex poisoned");
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for info in active.keys() {
            *counts.entry(info.partition_id()).or_insert(0) += 1;
        }
        counts.into_iter().max_by_key(|(_, count)| *count)
    }

    /// The largest number of active parts in any single partition.
    pub fn max_parts_per_partition(&self) -> usize {
        self.busiest_partition().map_or(0, |(_, count)| count)
    }

    /// Per-column total bytes across active parts.
    pub fn column_sizes(&self) -> HashMap<String, u64> {
        self.column_sizes
            .lock()
            .expect("column_sizes poisoned")
            .clone()
    }

    fn recompute_column_sizes(&self, active: &MutexGuard<'_, BTreeMap<PartInfo, Arc<DataPart>>>) {
        let mut sizes = self.column_sizes.lock().expect("column_sizes poisoned");
        sizes.clear();
        for part in active.values() {
            add_part_sizes(&mut sizes, part);
        }
    }
}

/// Recover from debris an interrupted ALTER left in a part directory.
///
/// The alter commit backs every touched file up as `*.tmp2` before it
/// installs any staged `*.tmp` file, and deletes the staged names before
/// the backups. So:
/// - while any `.tmp` survives, the commit did not finish and the backup
///   set is complete: restore every `.tmp2` over its target (pre-alter);
/// - with no `.tmp` left, the install finished: leftover `.tmp2` backups
///   (including those of deleted files) are purged (post-alter).
fn clean_alter_debris(part_dir: &Path) -> Result<()> {
    let list = |dir: &Path| -> Result<Vec<String>> {
        let entries = fs::read_dir(dir).map_err(|e| MergeTreeError::io(dir.to_path_buf(), e))?;
        entries
            .map(|entry| {
                entry
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .map_err(|e| MergeTreeError::io(dir.to_path_buf(), e))
            })
            .collect()
    };

    let names = list(part_dir)?;
    let unfinished = names.iter().any(|name| name.ends_with(".tmp"));

    for name in &names {
        let Some(target) = name.strip_suffix(".tmp2") else {
            continue;
        };
        let debris_path = part_dir.join(name);
        if unfinished {
            warn!(
                "rolling back interrupted alter: restoring {target} in {}",
                part_dir.display()
            );
            let target_path = part_dir.join(target);
            fs::rename(&debris_path, &target_path)
                .map_err(|e| MergeTreeError::io(target_path, e))?;
        } else {
            warn!("removing alter debris {name} from {}", part_dir.display());
            fs::remove_file(&debris_path).map_err(|e| MergeTreeError::io(debris_path, e))?;
        }
    }
    for name in &names {
        if name.ends_with(".tmp") {
            warn!("removing alter debris {name} from {}", part_dir.display());
            let path = part_dir.join(name);
            fs::remove_file(&path).map_err(|e| MergeTreeError::io(path, e))?;
        }
    }
    Ok(())
}

fn add_part_sizes(sizes: &mut HashMap<String, u64>, part: &DataPart) {
    for column in part.columns() {
        *sizes.entry(column.name.clone()).or_insert(0) += part.column_size_in_bytes(&column.name);
    }
}

fn subtract_part_sizes(sizes: &mut HashMap<String, u64>, part: &DataPart) {
    for column in part.columns() {
        if let Some(total) = sizes.get_mut(&column.name) {
            *total = total.saturating_sub(part.column_size_in_bytes(&column.name));
        }
    }
}

/// Flush directory metadata so a completed rename survives power loss.
fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir).map_err(|e| MergeTreeError::io(dir.to_path_buf(), e))?;
    handle
        .sync_all()
        .map_err(|e| MergeTreeError::io(dir.to_path_buf(), e))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
