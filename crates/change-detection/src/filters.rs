use serde::{Deserialize, Serialize};

/// Include filter applied by every detector before an event or listing entry
/// is emitted: an optional path prefix and an optional set of file suffixes
/// (matched case-insensitively). Empty filters match everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathFilters {
    pub prefix: Option<String>,
    pub suffixes: Vec<String>,
}

impl PathFilters {
    pub fn matches(&self, path: &str) -> bool {
        if let Some(prefix) = self.prefix.as_deref() {
            if !path.starts_with(prefix) {
                return false;
            }
        }
        if self.suffixes.is_empty() {
            return true;
        }
        let lower = path.to_ascii_lowercase();
        self.suffixes.iter().any(|suffix| lower.ends_with(&suffix.to_ascii_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filters_match_everything() {
        let filters = PathFilters::default();
        assert!(filters.matches("/any/path.bin"));
    }

    #[test]
    fn suffixes_match_case_insensitively() {
        let filters =
            PathFilters { prefix: None, suffixes: vec![".pdf".into(), ".md".into()] };
        assert!(filters.matches("/docs/Report.PDF"));
        assert!(filters.matches("notes.md"));
        assert!(!filters.matches("/docs/report.txt"));
    }

    #[test]
    fn prefix_and_suffix_combine() {
        let filters =
            PathFilters { prefix: Some("inbox/".into()), suffixes: vec![".txt".into()] };
        assert!(filters.matches("inbox/a.txt"));
        assert!(!filters.matches("archive/a.txt"));
        assert!(!filters.matches("inbox/a.png"));
    }
}
