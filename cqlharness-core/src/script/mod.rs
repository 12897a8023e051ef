//! CQL script loading, tokenization and replay
//!
//! Scripts are trusted, line-oriented fixtures written alongside the tests.
//! They are located through a [`ResourceLocator`], cleaned and substituted
//! line by line ([`template`]), cut into executable statements
//! ([`tokenizer`]) and replayed over a session ([`executor`]).

pub mod executor;
pub mod template;
pub mod tokenizer;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ScriptError;

pub use executor::ScriptExecutor;
pub use template::{load_lines, prepare_lines, substitute_line, TemplateVariables};
pub use tokenizer::{tokenize, tokenize_raw, Segmenter};

/// Resolves script locations against an ordered list of search roots.
///
/// Absolute locations are used as given. Relative ones are looked up in each
/// root in turn and the first existing file wins.
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    roots: Vec<PathBuf>,
}

impl ResourceLocator {
    /// Search `roots` in order; an empty list searches the working directory.
    pub fn new(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        let mut roots: Vec<PathBuf> = roots.into_iter().map(Into::into).collect();
        if roots.is_empty() {
            roots.push(PathBuf::from("."));
        }
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn resolve(&self, location: &str) -> Result<PathBuf, ScriptError> {
        let requested = Path::new(location);
        if requested.is_absolute() {
            return if requested.is_file() {
                Ok(requested.to_path_buf())
            } else {
                Err(ScriptError::ResourceNotFound(location.to_string()))
            };
        }

        let relative = requested.strip_prefix("/").unwrap_or(requested);
        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.is_file())
            .inspect(|path| debug!(location, path = %path.display(), "Resolved script"))
            .ok_or_else(|| ScriptError::ResourceNotFound(location.to_string()))
    }

    /// Read the whole script at `location`.
    pub fn read_to_string(&self, location: &str) -> Result<String, ScriptError> {
        let path = self.resolve(location)?;
        std::fs::read_to_string(&path)
            .map_err(|source| ScriptError::ResourceUnreadable { path, source })
    }
}

impl Default for ResourceLocator {
    fn default() -> Self {
        Self::new(Vec::<PathBuf>::new())
    }
}
