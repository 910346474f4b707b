use crate::config::Config;
use crate::error::ConfigError;
use crate::types::{Tag, UnitSpec};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const LABEL_SEPARATORS: [&str; 3] = ["->", "→", "\t"];

/// Ordered, duplicate-free tag list for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCatalog {
    source: PathBuf,
    tags: Vec<Tag>,
}

impl TagCatalog {
    pub fn load(config: &Config, unit: &UnitSpec) -> Result<Self, ConfigError> {
        Self::load_from(&unit.unit, &config.tags_path(unit))
    }

    pub fn load_from(unit: &str, path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::MissingSource {
                unit: unit.to_string(),
                path: path.to_path_buf(),
            });
        }
        let raw_tags = if is_tabular(path) {
            read_tabular(path)?
        } else {
            let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
                path: path.to_path_buf(),
                detail: err.to_string(),
            })?;
            parse_lines(&raw)
        };

        let mut seen = HashSet::new();
        let tags: Vec<Tag> = raw_tags
            .into_iter()
            .filter(|tag| seen.insert(tag.clone()))
            .collect();
        if tags.is_empty() {
            return Err(ConfigError::NoTags {
                unit: unit.to_string(),
                path: path.to_path_buf(),
            });
        }
        tracing::debug!(unit, path = %path.display(), tags = tags.len(), "loaded tag catalog");
        Ok(Self {
            source: path.to_path_buf(),
            tags,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }
}

fn is_tabular(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

fn parse_lines(raw: &str) -> Vec<Tag> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| Tag::new(strip_label(line)))
        .collect()
}

/// `Flow -> PCFS.K-31-01.FI-31001.PV` keeps only the identifier.
fn strip_label(line: &str) -> &str {
    LABEL_SEPARATORS
        .iter()
        .filter_map(|sep| line.rfind(sep).map(|idx| idx + sep.len()))
        .max()
        .map(|start| &line[start..])
        .unwrap_or(line)
}

fn read_tabular(path: &Path) -> Result<Vec<Tag>, ConfigError> {
    let unreadable = |detail: String| ConfigError::Unreadable {
        path: path.to_path_buf(),
        detail,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .comment(Some(b'#'))
        .from_path(path)
        .map_err(|err| unreadable(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| unreadable(err.to_string()))?
        .clone();
    let column = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("tag"))
        .ok_or_else(|| unreadable("missing `tag` column".to_string()))?;

    let mut tags = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| unreadable(err.to_string()))?;
        if let Some(tag) = record.get(column).and_then(|cell| Tag::new(strip_label(cell))) {
            tags.push(tag);
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn text_source_skips_comments_and_collapses_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "tags_k-31-01.txt",
            "# compressor K-31-01\n\nPCFS.K-31-01.FI-31001.PV\n  \
             PCFS.K-31-01.TI-31002.PV  \nPCFS.K-31-01.FI-31001.PV\n",
        );
        let catalog = TagCatalog::load_from("K-31-01", &path).unwrap();
        let names: Vec<&str> = catalog.tags().iter().map(Tag::as_str).collect();
        assert_eq!(names, vec!["PCFS.K-31-01.FI-31001.PV", "PCFS.K-31-01.TI-31002.PV"]);
    }

    #[test]
    fn label_prefixes_are_stripped() {
        assert_eq!(strip_label("Suction flow -> A.B.PV"), " A.B.PV");
        assert_eq!(strip_label("Discharge → A.C.PV"), " A.C.PV");
        assert_eq!(strip_label("Temp\tA.D.PV"), "A.D.PV");
        assert_eq!(strip_label("A.E.PV"), "A.E.PV");

        let parsed = parse_lines("Suction flow -> A.B.PV\nTemp\tA.D.PV\n");
        assert_eq!(parsed, vec![Tag::new("A.B.PV").unwrap(), Tag::new("A.D.PV").unwrap()]);
    }

    #[test]
    fn csv_source_reads_tag_column() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "abf.csv",
            "label,tag\nFlow,ABF.07-MT01.FI-001.PV\n# retired\nPressure,ABF.07-MT01.PI-002.PV\n,\n",
        );
        let catalog = TagCatalog::load_from("07-MT01/K001", &path).unwrap();
        assert_eq!(catalog.tags().len(), 2);
        assert_eq!(catalog.source(), path.as_path());
        assert_eq!(catalog.tags()[1].as_str(), "ABF.07-MT01.PI-002.PV");
    }

    #[test]
    fn missing_source_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = TagCatalog::load_from("K-12-01", &dir.path().join("nope.txt")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSource { .. }));
    }

    #[test]
    fn source_with_only_comments_yields_no_tags_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "empty.txt", "# nothing here\n\n   \n");
        let err = TagCatalog::load_from("K-12-01", &path).unwrap_err();
        assert!(matches!(err, ConfigError::NoTags { .. }));
    }
}
