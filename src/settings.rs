//! Tuning knobs for the mergetree engine.
//!
//! Every operational constant of the engine lives here, with a documented
//! default and permitted range. Settings are plain data: construct them in
//! code, or deserialize them from a JSON document with
//! [`MergeTreeSettings::from_json_str`]. [`MergeTreeSettings::validate`]
//! rejects out-of-range values before an engine is built around them.

use serde::Deserialize;

use crate::error::{MergeTreeError, Result};

/// Engine settings.
///
/// `#[serde(default)]` on every field means a configuration document only
/// needs to name the knobs it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeTreeSettings {
    /// Rows per mark in the sparse primary-key index.
    ///
    /// Default 8192. Range [1, 1_048_576]. Smaller granules prune reads
    /// more precisely at the cost of a larger index and mark files.
    pub index_granularity: usize,

    /// Abort `load_from_disk` when more than this many broken parts are
    /// found and sanity checks are enabled.
    ///
    /// Default 10. Range [0, 1000]. A handful of broken parts is normal
    /// after a crash; dozens suggest the wrong directory or real damage.
    pub max_suspicious_broken_parts: usize,

    /// Seconds an obsolete part is retained before physical deletion.
    ///
    /// Default 480 (8 minutes). Range [0, 86_400]. The grace period lets
    /// in-flight readers that hold the part finish before the bytes go.
    #[serde(alias = "old_parts_lifetime")]
    pub old_parts_lifetime_secs: u64,

    /// Threshold on the largest active-part count in any single partition
    /// before inserts start to slow down.
    ///
    /// Default 150. Range [1, 10_000].
    pub parts_to_delay_insert: usize,

    /// Exponential base for the backpressure sleep:
    /// `insert_delay_step ^ excess` milliseconds.
    ///
    /// Default 2.0. Range [1.0, 100.0].
    pub insert_delay_step: f64,

    /// Hard ceiling on the insert delay, in seconds. A delay that would
    /// exceed it rejects the insert with a "too many parts" error.
    ///
    /// Default 1. Range [0, 600].
    #[serde(alias = "max_delay_of_insert")]
    pub max_delay_of_insert_secs: u64,

    /// Sanity cap on the number of files a single-part ALTER may modify.
    ///
    /// Default 50. Range [1, 10_000]. An ALTER above the cap aborts before
    /// touching disk; raise it deliberately for very wide tables.
    pub max_files_to_modify_in_alter_columns: usize,

    /// Seconds a `tmp_*` directory may exist before the reaper removes it.
    ///
    /// Default 86_400 (24 hours). Range [1, 604_800]. Long enough that no
    /// in-flight insert or merge can lose its output.
    #[serde(alias = "temporary_directories_lifetime")]
    pub temporary_directories_lifetime_secs: u64,

    /// Most parts a single merge may combine.
    ///
    /// Default 10. Range [2, 100].
    pub max_parts_to_merge_at_once: usize,

    /// Byte budget for the inputs of a single merge.
    ///
    /// Default 100 GiB. Range [1 MiB, 1 TiB].
    pub max_bytes_to_merge_at_once: u64,
}

impl Default for MergeTreeSettings {
    fn default() -> Self {
        Self {
            index_granularity: 8192,
            max_suspicious_broken_parts: 10,
            old_parts_lifetime_secs: 480,
            parts_to_delay_insert: 150,
            insert_delay_step: 2.0,
            max_delay_of_insert_secs: 1,
            max_files_to_modify_in_alter_columns: 50,
            temporary_directories_lifetime_secs: 86_400,
            max_parts_to_merge_at_once: 10,
            max_bytes_to_merge_at_once: 100 * 1024 * 1024 * 1024,
        }
    }
}

impl MergeTreeSettings {
    /// Parse settings from a JSON document, then validate.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let settings: MergeTreeSettings =
            serde_json::from_str(s).map_err(|e| MergeTreeError::InvalidSetting {
                name: "<document>".into(),
                reason: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every knob against its permitted range.
    pub fn validate(&self) -> Result<()> {
        fn check(name: &str, ok: bool, reason: String) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(MergeTreeError::InvalidSetting {
                    name: name.into(),
                    reason,
                })
            }
        }

        check(
            "index_granularity",
            (1..=1_048_576).contains(&self.index_granularity),
            format!("{} not in [1, 1048576]", self.index_granularity),
        )?;
        check(
            "max_suspicious_broken_parts",
            self.max_suspicious_broken_parts <= 1000,
            format!("{} not in [0, 1000]", self.max_suspicious_broken_parts),
        )?;
        check(
            "old_parts_lifetime_secs",
            self.old_parts_lifetime_secs <= 86_400,
            format!("{} not in [0, 86400]", self.old_parts_lifetime_secs),
        )?;
        check(
            "parts_to_delay_insert",
            (1..=10_000).contains(&self.parts_to_delay_insert),
            format!("{} not in [1, 10000]", self.parts_to_delay_insert),
        )?;
        check(
            "insert_delay_step",
            (1.0..=100.0).contains(&self.insert_delay_step),
            format!("{} not in [1.0, 100.0]", self.insert_delay_step),
        )?;
        check(
            "max_delay_of_insert_secs",
            self.max_delay_of_insert_secs <= 600,
            format!("{} not in [0, 600]", self.max_delay_of_insert_secs),
        )?;
        check(
            "max_files_to_modify_in_alter_columns",
            (1..=10_000).contains(&self.max_files_to_modify_in_alter_columns),
            format!(
                "{} not in [1, 10000]",
                self.max_files_to_modify_in_alter_columns
            ),
        )?;
        check(
            "temporary_directories_lifetime_secs",
            (1..=604_800).contains(&self.temporary_directories_lifetime_secs),
            format!(
                "{} not in [1, 604800]",
                self.temporary_directories_lifetime_secs
            ),
        )?;
        check(
            "max_parts_to_merge_at_once",
            (2..=100).contains(&self.max_parts_to_merge_at_once),
            format!("{} not in [2, 100]", self.max_parts_to_merge_at_once),
        )?;
        check(
            "max_bytes_to_merge_at_once",
            (1024 * 1024..=1024u64 * 1024 * 1024 * 1024).contains(&self.max_bytes_to_merge_at_once),
            format!("{} not in [1MiB, 1TiB]", self.max_bytes_to_merge_at_once),
        )?;
        Ok(())
    }
}
