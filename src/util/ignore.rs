use std::path::Path;

/// One configured ignore pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreRule {
    /// Matches when any path component equals the name (`node_modules`, `.git`).
    Component(String),
    /// Matches when the file name ends with the suffix (`*.pyc` → `.pyc`).
    Suffix(String),
}

impl IgnoreRule {
    pub fn parse(pattern: &str) -> Option<Self> {
        match pattern.strip_prefix('*') {
            Some("") => None,
            Some(suffix) => Some(Self::Suffix(suffix.to_string())),
            None if pattern.is_empty() => None,
            None => Some(Self::Component(pattern.to_string())),
        }
    }

    fn matches(&self, path: &Path) -> bool {
        match self {
            Self::Suffix(suffix) => path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().ends_with(suffix.as_str())),
            Self::Component(name) => path
                .components()
                .any(|c| c.as_os_str().to_string_lossy() == name.as_str()),
        }
    }
}

/// Decides whether a path is excluded from syncing.
///
/// Callers pass paths relative to the sync root so the root's own
/// components never take part in matching.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<IgnoreRule>,
}

impl IgnoreMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            rules: patterns
                .iter()
                .filter_map(|p| IgnoreRule::parse(p.as_ref().trim()))
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.rules.iter().any(|rule| rule.matches(path))
    }

    pub fn rules(&self) -> &[IgnoreRule] {
        &self.rules
    }
}
