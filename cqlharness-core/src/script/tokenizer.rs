//! Statement Segmentation
//!
//! Cuts prepared script lines into complete, directly executable statements.
//! A [`Segmenter`] is a three-state machine that looks at one line at a time
//! and never backtracks:
//!
//! ```text
//!            starts with BEGIN                    ends with `$$`
//!   Batch <-------------------- Plain ---------------------------> CodeBlock
//!     |   starts with APPLY:     ^  ^     line is exactly `$$;`:      |
//!     +---- emit, back to ------+  +------ emit, back to Plain -------+
//! ```
//!
//! In `Plain` the batch check runs first, so a line that opens a batch and
//! also ends with `$$` is always a batch. Plain statements end at a line
//! whose last character is `;`.

use std::mem;
use std::sync::OnceLock;

use regex::Regex;

use super::template::{prepare_lines, TemplateVariables};
use crate::error::ScriptError;

const BATCH_BEGIN: &str = "BEGIN";
const BATCH_APPLY: &str = "APPLY";
const STATEMENT_END: char = ';';
/// A trailing `$$` token, alone or after other text such as `AS`.
const CODE_BLOCK_OPEN: &str = r"(?:^|\s)\$\$$";
const CODE_BLOCK_CLOSE: &str = r"^\s*\$\$\s*;\s*$";

fn code_block_open() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(CODE_BLOCK_OPEN).expect("code block pattern is valid"))
}

fn code_block_close() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(CODE_BLOCK_CLOSE).expect("code block pattern is valid"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Plain,
    Batch,
    CodeBlock,
}

impl Mode {
    fn describe(self) -> &'static str {
        match self {
            Mode::Plain => "statement",
            Mode::Batch => "batch",
            Mode::CodeBlock => "code block",
        }
    }
}

/// Line-at-a-time statement splitter.
#[derive(Debug, Default)]
pub struct Segmenter {
    mode: Mode,
    buffer: String,
    statements: Vec<String>,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the machine by one line.
    pub fn feed(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match self.mode {
            Mode::Batch => {
                self.append_spaced(line);
                if line.starts_with(BATCH_APPLY) {
                    self.emit();
                }
            }
            Mode::CodeBlock => {
                self.buffer.push_str(line);
                if code_block_close().is_match(line) {
                    self.emit();
                }
            }
            Mode::Plain => {
                if self.buffer.is_empty() && line.starts_with(BATCH_BEGIN) {
                    self.buffer.push_str(line);
                    self.mode = Mode::Batch;
                } else if code_block_open().is_match(line) {
                    self.append_spaced(line);
                    self.mode = Mode::CodeBlock;
                } else {
                    self.append_spaced(line);
                    if line.ends_with(STATEMENT_END) {
                        self.emit();
                    }
                }
            }
        }
    }

    /// Statements completed so far.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Finish the script. Anything still buffered is an unterminated statement.
    pub fn finish(self) -> Result<Vec<String>, ScriptError> {
        if !self.buffer.is_empty() {
            return Err(ScriptError::Unterminated {
                mode: self.mode.describe(),
                fragment: self.buffer,
            });
        }
        Ok(self.statements)
    }

    fn append_spaced(&mut self, line: &str) {
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(line);
    }

    fn emit(&mut self) {
        self.statements.push(mem::take(&mut self.buffer));
        self.mode = Mode::Plain;
    }
}

fn segment(lines: Vec<String>) -> Result<Vec<String>, ScriptError> {
    let mut segmenter = Segmenter::new();
    for line in &lines {
        segmenter.feed(line);
    }
    segmenter.finish()
}

/// Substitute `vars` into `lines` and split them into statements.
pub fn tokenize<I, S>(lines: I, vars: &TemplateVariables) -> Result<Vec<String>, ScriptError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segment(prepare_lines(lines, Some(vars))?)
}

/// Split `lines` into statements, leaving `${...}` text as is.
pub fn tokenize_raw<I, S>(lines: I) -> Result<Vec<String>, ScriptError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segment(prepare_lines(lines, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars() -> TemplateVariables {
        TemplateVariables::new()
    }

    #[test]
    fn test_single_statement_is_trimmed() {
        assert_eq!(
            tokenize(["  CREATE TABLE x (a int);  "], &no_vars()).unwrap(),
            vec!["CREATE TABLE x (a int);"]
        );
    }

    #[test]
    fn test_batch_is_one_statement() {
        let lines = ["BEGIN BATCH", "INSERT INTO t(a) VALUES (1);", "APPLY BATCH;"];
        assert_eq!(
            tokenize(lines, &no_vars()).unwrap(),
            vec!["BEGIN BATCH INSERT INTO t(a) VALUES (1); APPLY BATCH;"]
        );
    }

    #[test]
    fn test_code_block_inner_lines_verbatim() {
        let lines = ["CREATE FUNCTION f() $$", "return 1;", "$$;"];
        assert_eq!(
            tokenize(lines, &no_vars()).unwrap(),
            vec!["CREATE FUNCTION f() $$return 1;$$;"]
        );
    }

    #[test]
    fn test_code_block_opened_on_its_own_line() {
        let lines = [
            "CREATE OR REPLACE FUNCTION ks.plus(a int, b int)",
            "RETURNS NULL ON NULL INPUT RETURNS int LANGUAGE java",
            "AS $$",
            "return a + b;",
            "$$;",
            "SELECT * FROM t;",
        ];
        assert_eq!(
            tokenize_raw(lines).unwrap(),
            vec![
                "CREATE OR REPLACE FUNCTION ks.plus(a int, b int) \
                 RETURNS NULL ON NULL INPUT RETURNS int LANGUAGE java AS $$return a + b;$$;",
                "SELECT * FROM t;",
            ]
        );
    }

    #[test]
    fn test_multi_line_plain_statement() {
        let lines = [
            "CREATE TABLE users (",
            "id int PRIMARY KEY,",
            "name text",
            ");",
            "INSERT INTO users(id, name) VALUES (1, 'a');",
        ];
        assert_eq!(
            tokenize_raw(lines).unwrap(),
            vec![
                "CREATE TABLE users ( id int PRIMARY KEY, name text );",
                "INSERT INTO users(id, name) VALUES (1, 'a');",
            ]
        );
    }

    #[test]
    fn test_batch_checked_before_code_block() {
        let lines = ["BEGIN UNLOGGED BATCH $$", "INSERT INTO t(a) VALUES (1);", "APPLY BATCH;"];
        assert_eq!(
            tokenize_raw(lines).unwrap(),
            vec!["BEGIN UNLOGGED BATCH $$ INSERT INTO t(a) VALUES (1); APPLY BATCH;"]
        );
    }

    #[test]
    fn test_begin_line_continues_pending_statement() {
        let lines = [
            "CREATE TABLE events (id int PRIMARY KEY,",
            "BEGIN_at timestamp);",
            "BEGIN BATCH",
            "INSERT INTO events(id) VALUES (1);",
            "APPLY BATCH;",
        ];
        assert_eq!(
            tokenize_raw(lines).unwrap(),
            vec![
                "CREATE TABLE events (id int PRIMARY KEY, BEGIN_at timestamp);",
                "BEGIN BATCH INSERT INTO events(id) VALUES (1); APPLY BATCH;",
            ]
        );
    }

    #[test]
    fn test_mixed_script() {
        let lines = [
            "-- schema",
            "CREATE TABLE t (a int PRIMARY KEY);",
            "",
            "BEGIN BATCH",
            "INSERT INTO t(a) VALUES (${a});",
            "INSERT INTO t(a) VALUES (${b});",
            "APPLY BATCH;",
            "CREATE FUNCTION f() AS $$",
            "return 1;",
            "$$;",
        ];
        let vars = TemplateVariables::from_iter([("a", 1), ("b", 2)]);
        let statements = tokenize(lines, &vars).unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[1],
            "BEGIN BATCH INSERT INTO t(a) VALUES (1); INSERT INTO t(a) VALUES (2); APPLY BATCH;"
        );
        assert_eq!(statements[2], "CREATE FUNCTION f() AS $$return 1;$$;");
    }

    #[test]
    fn test_missing_variable_fails_tokenize() {
        let err = tokenize(["INSERT INTO t(id) VALUES (${id});"], &no_vars()).unwrap_err();
        assert!(matches!(err, ScriptError::MissingVariable(ref n) if n == "id"));
    }

    #[test]
    fn test_raw_leaves_placeholders() {
        assert_eq!(
            tokenize_raw(["INSERT INTO t(id) VALUES (${id});"]).unwrap(),
            vec!["INSERT INTO t(id) VALUES (${id});"]
        );
    }

    #[test]
    fn test_unterminated_plain_statement() {
        let err = tokenize_raw(["SELECT * FROM t;", "SELECT * FROM u"]).unwrap_err();
        match err {
            ScriptError::Unterminated { mode, fragment } => {
                assert_eq!(mode, "statement");
                assert_eq!(fragment, "SELECT * FROM u");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unterminated_batch_and_code_block() {
        let err = tokenize_raw(["BEGIN BATCH", "INSERT INTO t(a) VALUES (1);"]).unwrap_err();
        assert!(matches!(err, ScriptError::Unterminated { mode: "batch", .. }));

        let err = tokenize_raw(["CREATE FUNCTION f() AS $$", "return 1;"]).unwrap_err();
        assert!(matches!(err, ScriptError::Unterminated { mode: "code block", .. }));
    }

    #[test]
    fn test_empty_script() {
        assert!(tokenize_raw(Vec::<String>::new()).unwrap().is_empty());
        assert!(tokenize_raw(["", "-- only comments", "   "]).unwrap().is_empty());
    }

    #[test]
    fn test_segmenter_feeds_incrementally() {
        let mut segmenter = Segmenter::new();
        segmenter.feed("SELECT *");
        assert!(segmenter.statements().is_empty());
        segmenter.feed("FROM t;");
        assert_eq!(segmenter.statements(), ["SELECT * FROM t;"]);
        assert_eq!(segmenter.finish().unwrap().len(), 1);
    }
}
