//! Line preparation and `${variable}` substitution.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ResourceLocator;
use crate::error::ScriptError;

const PLACEHOLDER_PATTERN: &str = r"\$\{([a-z][a-zA-Z0-9_]*)\}";

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is valid"))
}

/// Values substituted into a script template, keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateVariables(BTreeMap<String, String>);

impl TemplateVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` in its string form.
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) -> &mut Self {
        self.0.insert(name.into(), value.to_string());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for TemplateVariables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        )
    }
}

/// Replace every `${name}` in `line` with its value.
///
/// Values are inserted as literal text in a single left-to-right pass; a
/// value that itself looks like a placeholder is left alone.
pub fn substitute_line(line: &str, vars: &TemplateVariables) -> Result<String, ScriptError> {
    let mut out = String::with_capacity(line.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        let name = &caps[1];
        let value = vars
            .get(name)
            .ok_or_else(|| ScriptError::MissingVariable(name.to_string()))?;
        out.push_str(&line[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&line[last..]);
    Ok(out)
}

fn is_comment(line: &str) -> bool {
    line.starts_with("--") || line.starts_with("//")
}

/// Trim lines, drop blank and comment lines, then substitute `vars` if given.
pub fn prepare_lines<I, S>(
    lines: I,
    vars: Option<&TemplateVariables>,
) -> Result<Vec<String>, ScriptError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut prepared = Vec::new();
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() || is_comment(line) {
            continue;
        }
        prepared.push(match vars {
            Some(vars) => substitute_line(line, vars)?,
            None => line.to_string(),
        });
    }
    Ok(prepared)
}

/// Read the script at `location` and prepare its lines.
pub fn load_lines(
    location: &str,
    vars: Option<&TemplateVariables>,
    locator: &ResourceLocator,
) -> Result<Vec<String>, ScriptError> {
    let text = locator.read_to_string(location)?;
    prepare_lines(text.lines(), vars)
}
