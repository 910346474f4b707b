use serde::Serialize;
use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Master artifacts that may coexist for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterVariant {
    Updated,
    Refreshed,
    Dedup,
    Raw,
}

impl MasterVariant {
    pub const ALL: [MasterVariant; 4] = [Self::Updated, Self::Refreshed, Self::Dedup, Self::Raw];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Refreshed => "refreshed",
            Self::Dedup => "dedup",
            Self::Raw => "raw",
        }
    }

    fn file_suffix(self) -> &'static str {
        match self {
            Self::Updated => ".updated.parquet",
            Self::Refreshed => ".refreshed.parquet",
            Self::Dedup => ".dedup.parquet",
            Self::Raw => ".parquet",
        }
    }

    /// Lower is more authoritative. Dedup and raw share a rank.
    fn rank(self) -> u8 {
        match self {
            Self::Updated => 0,
            Self::Refreshed => 1,
            Self::Dedup | Self::Raw => 2,
        }
    }

    fn tie_break(self) -> u8 {
        match self {
            Self::Dedup => 0,
            _ => 1,
        }
    }

    pub fn path(self, data_dir: &Path, slug: &str) -> PathBuf {
        data_dir.join(format!("{slug}{}", self.file_suffix()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantCandidate {
    pub variant: MasterVariant,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Priority order: rank, then newest mtime, then dedup over raw, then path.
pub fn priority(a: &VariantCandidate, b: &VariantCandidate) -> Ordering {
    a.variant
        .rank()
        .cmp(&b.variant.rank())
        .then_with(|| b.modified.cmp(&a.modified))
        .then_with(|| a.variant.tie_break().cmp(&b.variant.tie_break()))
        .then_with(|| a.path.cmp(&b.path))
}

pub fn select_master(candidates: &[VariantCandidate]) -> Option<&VariantCandidate> {
    candidates.iter().min_by(|a, b| priority(a, b))
}

/// Every variant file present for `slug`, most authoritative first.
pub fn discover(data_dir: &Path, slug: &str) -> io::Result<Vec<VariantCandidate>> {
    let mut found = Vec::new();
    for variant in MasterVariant::ALL {
        let path = variant.path(data_dir, slug);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        found.push(VariantCandidate {
            variant,
            path,
            modified: meta.modified()?,
        });
    }
    found.sort_by(priority);
    Ok(found)
}

pub fn locate_master(data_dir: &Path, slug: &str) -> io::Result<Option<VariantCandidate>> {
    let found = discover(data_dir, slug)?;
    Ok(select_master(&found).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn candidate(variant: MasterVariant, age_secs: u64) -> VariantCandidate {
        VariantCandidate {
            variant,
            path: variant.path(Path::new("/data"), "K-31-01"),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    #[test]
    fn updated_beats_everything_even_when_older() {
        let candidates = vec![
            candidate(MasterVariant::Raw, 10),
            candidate(MasterVariant::Dedup, 10),
            candidate(MasterVariant::Refreshed, 20),
            candidate(MasterVariant::Updated, 500),
        ];
        assert_eq!(select_master(&candidates).unwrap().variant, MasterVariant::Updated);
    }

    #[test]
    fn refreshed_beats_dedup_and_raw() {
        let candidates = vec![
            candidate(MasterVariant::Dedup, 1),
            candidate(MasterVariant::Refreshed, 900),
            candidate(MasterVariant::Raw, 1),
        ];
        assert_eq!(select_master(&candidates).unwrap().variant, MasterVariant::Refreshed);
    }

    #[test]
    fn newer_raw_beats_older_dedup() {
        let candidates = vec![
            candidate(MasterVariant::Dedup, 60),
            candidate(MasterVariant::Raw, 5),
        ];
        assert_eq!(select_master(&candidates).unwrap().variant, MasterVariant::Raw);
    }

    #[test]
    fn mtime_tie_prefers_dedup_regardless_of_input_order() {
        let forward = vec![candidate(MasterVariant::Raw, 30), candidate(MasterVariant::Dedup, 30)];
        let backward = vec![candidate(MasterVariant::Dedup, 30), candidate(MasterVariant::Raw, 30)];
        assert_eq!(select_master(&forward).unwrap().variant, MasterVariant::Dedup);
        assert_eq!(select_master(&backward).unwrap().variant, MasterVariant::Dedup);
    }

    #[test]
    fn discover_finds_files_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        for variant in [MasterVariant::Raw, MasterVariant::Refreshed] {
            std::fs::write(variant.path(dir.path(), "K-12-01"), b"x").unwrap();
        }
        std::fs::write(MasterVariant::Dedup.path(dir.path(), "K-99-01"), b"x").unwrap();

        let found = discover(dir.path(), "K-12-01").unwrap();
        let variants: Vec<MasterVariant> = found.iter().map(|c| c.variant).collect();
        assert_eq!(variants, vec![MasterVariant::Refreshed, MasterVariant::Raw]);
        assert!(locate_master(dir.path(), "K-00-01").unwrap().is_none());
    }
}
