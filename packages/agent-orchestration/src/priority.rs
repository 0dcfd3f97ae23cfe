use crate::error::{OrchestratorError, Result};
use crate::job::Priority;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

/// Assigns a priority to a candidate path
pub trait PriorityPolicy: Send + Sync {
    fn priority_of(&self, path: &Path) -> Priority;
}

/// Every path gets the same priority
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformPriority(pub Priority);

impl PriorityPolicy for UniformPriority {
    fn priority_of(&self, _path: &Path) -> Priority {
        self.0
    }
}

/// Pattern and extension based priorities
///
/// Regex rules are checked in insertion order against the full path and the
/// first match wins; otherwise the extension table decides; otherwise the
/// default applies.
#[derive(Debug, Clone)]
pub struct FilePriorityManager {
    patterns: Vec<(Regex, Priority)>,
    extensions: HashMap<String, Priority>,
    default: Priority,
}

impl Default for FilePriorityManager {
    fn default() -> Self {
        Self::new(Priority::Normal)
    }
}

impl FilePriorityManager {
    pub fn new(default: Priority) -> Self {
        Self {
            patterns: Vec::new(),
            extensions: HashMap::new(),
            default,
        }
    }

    pub fn add_pattern(&mut self, pattern: &str, priority: Priority) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|e| {
            OrchestratorError::config(format!("bad priority pattern {:?}: {}", pattern, e))
        })?;
        self.patterns.push((regex, priority));
        Ok(())
    }

    /// `ext` may be given with or without the leading dot
    pub fn set_extension(&mut self, ext: &str, priority: Priority) {
        self.extensions
            .insert(ext.trim_start_matches('.').to_ascii_lowercase(), priority);
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Stable sort, highest priority first
    pub fn sort_by_priority(&self, paths: &mut [std::path::PathBuf]) {
        paths.sort_by_key(|p| std::cmp::Reverse(self.priority_of(p)));
    }
}

impl PriorityPolicy for FilePriorityManager {
    fn priority_of(&self, path: &Path) -> Priority {
        let text = path.to_string_lossy();
        if let Some((_, priority)) = self.patterns.iter().find(|(re, _)| re.is_match(&text)) {
            return *priority;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.extensions.get(&e.to_ascii_lowercase()))
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manager() -> FilePriorityManager {
        let mut m = FilePriorityManager::new(Priority::Normal);
        m.add_pattern(r"(^|/)tests?/", Priority::Low).unwrap();
        m.add_pattern(r"(^|/)core/", Priority::Critical).unwrap();
        m.set_extension(".md", Priority::Low);
        m.set_extension("rs", Priority::High);
        m
    }

    #[test]
    fn test_patterns_take_precedence() {
        let m = manager();
        assert_eq!(m.priority_of(Path::new("src/core/engine.rs")), Priority::Critical);
        assert_eq!(m.priority_of(Path::new("tests/engine.rs")), Priority::Low);
    }

    #[test]
    fn test_extension_then_default() {
        let m = manager();
        assert_eq!(m.priority_of(Path::new("src/lib.rs")), Priority::High);
        assert_eq!(m.priority_of(Path::new("README.MD")), Priority::Low);
        assert_eq!(m.priority_of(Path::new("setup.py")), Priority::Normal);
        assert_eq!(m.priority_of(Path::new("Makefile")), Priority::Normal);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let mut m = FilePriorityManager::default();
        let err = m.add_pattern("(unclosed", Priority::High).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert_eq!(m.pattern_count(), 0);
    }

    #[test]
    fn test_sort_by_priority_is_stable() {
        let m = manager();
        let mut paths: Vec<PathBuf> = ["b.py", "docs.md", "a.rs", "c.py", "core/x.py"]
            .iter()
            .map(PathBuf::from)
            .collect();
        m.sort_by_priority(&mut paths);
        let got: Vec<_> = paths.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(got, vec!["core/x.py", "a.rs", "b.py", "c.py", "docs.md"]);
    }
}
