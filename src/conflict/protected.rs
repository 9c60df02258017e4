use anyhow::Result;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::git::RepositoryReader;

/// Matches paths against branch protection file patterns.
///
/// Patterns and paths are compared lower-cased and `*` never crosses a `/`.
#[derive(Debug, Clone)]
pub struct ProtectedFileMatcher {
    set: GlobSet,
    empty: bool,
}

impl ProtectedFileMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        let mut empty = true;
        for pattern in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            builder.add(
                GlobBuilder::new(&pattern.to_lowercase())
                    .literal_separator(true)
                    .build()?,
            );
            empty = false;
        }
        Ok(Self {
            set: builder.build()?,
            empty,
        })
    }

    /// Parses a `;` separated pattern list.
    pub fn parse(patterns: &str) -> Result<Self, globset::Error> {
        let patterns: Vec<String> = patterns.split(';').map(str::to_string).collect();
        Self::new(&patterns)
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_protected(&self, path: &str) -> bool {
        !self.empty && self.set.is_match(path.to_lowercase())
    }

    /// Protected files changed between `from` and `to`, at most `limit`.
    pub fn changed_protected_files<R: RepositoryReader + ?Sized>(
        &self,
        reader: &R,
        from: &str,
        to: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        if self.empty {
            return Ok(Vec::new());
        }
        Ok(reader
            .changed_files(from, to)?
            .into_iter()
            .filter(|path| self.is_protected(path))
            .take(limit)
            .collect())
    }
}
