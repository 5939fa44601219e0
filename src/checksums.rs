//! Per-part file checksums (`checksums.txt`).
//!
//! The checksum document maps every data-bearing file of a part to its
//! size and xxHash3 digest:
//!
//! ```text
//! checksums format version: 1
//! 3 files:
//! date.bin 58 9c3f1a0e22d47b61
//! date.mrk 16 0f27ce84ab119d05
//! primary.idx 34 77aa01c9e3b2d4f8
//! ```
//!
//! Verification has two strictness levels: size-only (cheap, every open)
//! and full re-hash (integrity checks). The document also drives the
//! missing/unexpected-file diff that classifies a part as broken.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

use crate::error::{MergeTreeError, Result};

/// Size and digest of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChecksum {
    pub size: u64,
    pub hash: u64,
}

/// How hard `verify` should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Existence and size only.
    SizesOnly,
    /// Existence, size, and a full content re-hash.
    FullHash,
}

/// The checksum map of one part. Keys are file names relative to the part
/// directory, ordered so the serialized form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checksums {
    files: BTreeMap<String, FileChecksum>,
}

const CHECKSUMS_FORMAT_HEADER: &str = "checksums format version: 1";

/// Name of the checksum document inside a part directory.
pub const CHECKSUMS_FILE_NAME: &str = "checksums.txt";

impl Checksums {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file: impl Into<String>, checksum: FileChecksum) {
        self.files.insert(file.into(), checksum);
    }

    pub fn remove(&mut self, file: &str) -> Option<FileChecksum> {
        self.files.remove(file)
    }

    pub fn get(&self, file: &str) -> Option<&FileChecksum> {
        self.files.get(file)
    }

    pub fn contains(&self, file: &str) -> bool {
        self.files.contains_key(file)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileChecksum)> {
        self.files.iter()
    }

    pub fn file_names(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    /// Sum of all recorded file sizes: the part's size in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|c| c.size).sum()
    }

    // ── Text form ────────────────────────────────────────────────────────

    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str(CHECKSUMS_FORMAT_HEADER);
        out.push('\n');
        out.push_str(&format!("{} files:\n", self.files.len()));
        for (file, checksum) in &self.files {
            out.push_str(&format!(
                "{} {} {:016x}\n",
                file, checksum.size, checksum.hash
            ));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Checksums> {
        let bad = |detail: String| MergeTreeError::CorruptedMetadata {
            part: String::new(),
            detail: format!("checksums.txt: {detail}"),
        };
        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some(CHECKSUMS_FORMAT_HEADER) {
            return Err(bad("missing format header".into()));
        }
        let count: usize = lines
            .next()
            .and_then(|l| l.trim().strip_suffix(" files:"))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| bad("malformed count line".into()))?;

        let mut checksums = Checksums::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.rsplitn(3, ' ');
            let hash_str = fields.next().ok_or_else(|| bad(format!("bad line: {line}")))?;
            let size_str = fields.next().ok_or_else(|| bad(format!("bad line: {line}")))?;
            let file = fields.next().ok_or_else(|| bad(format!("bad line: {line}")))?;
            let size: u64 = size_str
                .parse()
                .map_err(|_| bad(format!("bad size in: {line}")))?;
            let hash = u64::from_str_radix(hash_str, 16)
                .map_err(|_| bad(format!("bad hash in: {line}")))?;
            checksums.insert(file, FileChecksum { size, hash });
        }
        if checksums.len() != count {
            return Err(bad(format!(
                "count line says {count}, found {}",
                checksums.len()
            )));
        }
        Ok(checksums)
    }

    /// Read `checksums.txt` from a part directory. `Ok(None)` when the
    /// document is absent — it is optional, required only for integrity
    /// checks.
    pub fn read_from(part_dir: &Path) -> Result<Option<Checksums>> {
        let path = part_dir.join(CHECKSUMS_FILE_NAME);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(Checksums::parse(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MergeTreeError::io(path, e)),
        }
    }

    /// Write the document into a part directory under the given file name
    /// (callers pass `checksums.txt` or a `.tmp` staging name).
    pub fn write_to(&self, part_dir: &Path, file_name: &str) -> Result<()> {
        let path = part_dir.join(file_name);
        fs::write(&path, self.format()).map_err(|e| MergeTreeError::io(path, e))
    }

    // ── Verification ─────────────────────────────────────────────────────

    /// Verify every recorded file against the directory contents.
    pub fn verify(&self, part_dir: &Path, part_name: &str, mode: VerifyMode) -> Result<()> {
        for (file, expected) in &self.files {
            let path = part_dir.join(file);
            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(MergeTreeError::MissingFile {
                        part: part_name.into(),
                        file: file.clone(),
                    });
                }
                Err(e) => return Err(MergeTreeError::io(path, e)),
            };
            if metadata.len() != expected.size {
                return Err(MergeTreeError::ChecksumMismatch {
                    part: part_name.into(),
                    detail: format!(
                        "{file}: size {} on disk, {} expected",
                        metadata.len(),
                        expected.size
                    ),
                });
            }
            if mode == VerifyMode::FullHash {
                let actual = hash_file(&path)?;
                if actual != expected.hash {
                    return Err(MergeTreeError::ChecksumMismatch {
                        part: part_name.into(),
                        detail: format!(
                            "{file}: hash {actual:016x} on disk, {:016x} expected",
                            expected.hash
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Files present in the directory but absent from the document.
    ///
    /// The metadata documents themselves and staging/debris files are not
    /// reported; they are managed outside the checksum map.
    pub fn unexpected_files(&self, part_dir: &Path) -> Result<Vec<String>> {
        let mut unexpected = Vec::new();
        let entries =
            fs::read_dir(part_dir).map_err(|e| MergeTreeError::io(part_dir.to_path_buf(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| MergeTreeError::io(part_dir.to_path_buf(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == CHECKSUMS_FILE_NAME
                || name == crate::part::COLUMNS_FILE_NAME
                || name.ends_with(".tmp")
                || name.ends_with(".tmp2")
            {
                continue;
            }
            if !self.files.contains_key(&name) {
                unexpected.push(name);
            }
        }
        unexpected.sort();
        Ok(unexpected)
    }
}

/// xxHash3 of a file's contents, streamed in 1 MiB chunks.
pub fn hash_file(path: &Path) -> Result<u64> {
    let mut file = fs::File::open(path).map_err(|e| MergeTreeError::io(path.to_path_buf(), e))?;
    let mut hasher = Xxh3::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| MergeTreeError::io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}

/// xxHash3 of an in-memory buffer (used by writers as they emit files).
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_roundtrip() {
        let mut c = Checksums::new();
        c.insert("date.bin", FileChecksum { size: 58, hash: 0x9c3f_1a0e_22d4_7b61 });
        c.insert("date.mrk", FileChecksum { size: 16, hash: 5 });
        c.insert("primary.idx", FileChecksum { size: 34, hash: 0 });
        let parsed = Checksums::parse(&c.format()).unwrap();
        assert_eq!(parsed, c);
        assert_eq!(parsed.total_size(), 108);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Checksums::parse("").is_err());
        assert!(Checksums::parse("checksums format version: 2\n0 files:\n").is_err());
        assert!(Checksums::parse("checksums format version: 1\n1 files:\n").is_err());
        assert!(
            Checksums::parse("checksums format version: 1\n1 files:\na.bin ten 00ff\n").is_err()
        );
    }

    #[test]
    fn test_verify_detects_damage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"hello").unwrap();

        let mut c = Checksums::new();
        c.insert(
            "a.bin",
            FileChecksum {
                size: 5,
                hash: hash_bytes(b"hello"),
            },
        );
        c.verify(dir.path(), "p", VerifyMode::FullHash).unwrap();

        // Truncation is caught by the size pass.
        std::fs::write(dir.path().join("a.bin"), b"hell").unwrap();
        let err = c.verify(dir.path(), "p", VerifyMode::SizesOnly).unwrap_err();
        assert!(matches!(err, MergeTreeError::ChecksumMismatch { .. }));

        // Same-size corruption needs the hash pass.
        std::fs::write(dir.path().join("a.bin"), b"jello").unwrap();
        c.verify(dir.path(), "p", VerifyMode::SizesOnly).unwrap();
        let err = c.verify(dir.path(), "p", VerifyMode::FullHash).unwrap_err();
        assert!(matches!(err, MergeTreeError::ChecksumMismatch { .. }));

        // Deletion is a missing file.
        std::fs::remove_file(dir.path().join("a.bin")).unwrap();
        let err = c.verify(dir.path(), "p", VerifyMode::SizesOnly).unwrap_err();
        assert!(matches!(err, MergeTreeError::MissingFile { .. }));
    }

    #[test]
    fn test_unexpected_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("stray.bin"), b"y").unwrap();
        std::fs::write(dir.path().join("checksums.txt"), b"").unwrap();
        std::fs::write(dir.path().join("columns.txt"), b"").unwrap();
        std::fs::write(dir.path().join("a.bin.tmp2"), b"").unwrap();

        let mut c = Checksums::new();
        c.insert("a.bin", FileChecksum { size: 1, hash: 0 });
        assert_eq!(c.unexpected_files(dir.path()).unwrap(), vec!["stray.bin"]);
    }
}
