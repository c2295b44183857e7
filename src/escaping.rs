//! Shell escaping and template interpolation (spec.md §4.1).
//!
//! Grounded on the `shell-words` crate, which the teacher already reaches
//! for whenever it needs to turn a user-supplied string into safe argv
//! (`parser/` uses it for startup-command tokenizing); here it's used in the
//! opposite direction, to quote values back into a shell string.
//!
//! Two template modes share the same value normalization
//! ([`Interp::stringify`]) and differ only in whether the stringified form
//! gets shell-quoted (spec.md §4.1 "Escaped"/"Raw").

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Result, XecError};

/// A normalized interpolated value, before mode-dependent rendering.
#[derive(Debug, Clone)]
pub enum Interp {
    Str(String),
    /// Already-stringified number/boolean — never quoted, even in escaped
    /// mode, since digits and `true`/`false` carry no shell metacharacters
    /// (spec.md §4.1).
    Literal(String),
    Null,
    List(Vec<Interp>),
    Json(serde_json::Value),
    DateTime(DateTime<Utc>),
}

impl Interp {
    fn render(&self, mode: TemplateMode) -> String {
        match self {
            Interp::Str(s) => mode.quote(s),
            Interp::Literal(s) => s.clone(),
            Interp::Null => String::new(),
            Interp::List(items) => items
                .iter()
                .map(|i| i.render(mode))
                .collect::<Vec<_>>()
                .join(" "),
            Interp::Json(v) => mode.quote(&v.to_string()),
            Interp::DateTime(dt) => mode.quote(&dt.to_rfc3339()),
        }
    }
}

/// A value that can be interpolated into a shell template.
///
/// `Raw` bypasses escaping entirely regardless of the template's mode and
/// is inserted verbatim — callers reach for it only when they already
/// trust the fragment (e.g. a previously-built sub-template), never for
/// untrusted input.
#[derive(Debug, Clone)]
pub enum Value {
    Auto(Interp),
    Raw(String),
}

impl Value {
    fn render(&self, mode: TemplateMode) -> String {
        match self {
            Value::Auto(interp) => interp.render(mode),
            Value::Raw(s) => s.clone(),
        }
    }
}

impl From<Interp> for Value {
    fn from(interp: Interp) -> Self {
        Value::Auto(interp)
    }
}

macro_rules! impl_from_str_like {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(s: $t) -> Self {
                Value::Auto(Interp::Str(s.to_string()))
            }
        })*
    };
}
impl_from_str_like!(&str, String, &String);

macro_rules! impl_from_numeric {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Auto(Interp::Literal(n.to_string()))
            }
        })*
    };
}
impl_from_numeric!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Auto(Interp::Literal(b.to_string()))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Auto(Interp::Null),
        }
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Auto(Interp::List(items.into_iter().map(Into::into).collect()))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::Auto(Interp::DateTime(dt))
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Auto(Interp::Json(v))
    }
}

/// Serializes any `Serialize` type to JSON for interpolation (spec.md §4.1
/// "objects are JSON-serialized then quoted"). Returns `InvalidArgument`
/// for values that can't be represented as JSON (e.g. a cyclic graph
/// smuggled in behind a custom `Serialize` impl).
pub fn json_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map(Value::from)
        .map_err(|e| XecError::InvalidArgument(format!("cannot interpolate value as JSON: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateMode {
    /// Default: every `Interp::Str`/`Json`/`DateTime` is quoted safely for
    /// a POSIX shell.
    Escaped,
    /// Same value normalization, no quoting — the caller accepts
    /// responsibility for the resulting string (spec.md §4.1 "Raw").
    Raw,
}

impl TemplateMode {
    fn quote(self, s: &str) -> String {
        match self {
            TemplateMode::Escaped => shell_words::quote(s).into_owned(),
            TemplateMode::Raw => s.to_string(),
        }
    }
}

/// A tagged-template-literal style builder: interleaves literal fragments
/// with [`Value`]s, normalizing and (in [`TemplateMode::Escaped`]) quoting
/// each one (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct Template {
    rendered: String,
    mode: TemplateMode,
}

impl Default for Template {
    fn default() -> Self {
        Self::new()
    }
}

impl Template {
    pub fn new() -> Self {
        Self { rendered: String::new(), mode: TemplateMode::Escaped }
    }

    pub fn raw() -> Self {
        Self { rendered: String::new(), mode: TemplateMode::Raw }
    }

    /// Appends a literal fragment, unescaped — used for the static parts of
    /// the template between interpolated values.
    pub fn literal(mut self, fragment: &str) -> Self {
        self.rendered.push_str(fragment);
        self
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        let rendered = value.into().render(self.mode);
        self.rendered.push_str(&rendered);
        self
    }

    /// Awaits a [`crate::handle::ProcessHandle`] and interpolates its
    /// stdout, trimmed of a single trailing newline (spec.md §4.1
    /// "promises/process-handles are awaited and their stdout (trimmed of
    /// a single trailing newline) substituted"). Propagates the handle's
    /// own error (e.g. `CommandError` on a non-zero exit) rather than
    /// interpolating a partial result.
    pub async fn value_handle(self, handle: &crate::handle::ProcessHandle) -> Result<Self> {
        let result = handle.run().await?;
        let trimmed = result.stdout.strip_suffix('\n').unwrap_or(&result.stdout).to_string();
        Ok(self.value(Interp::Str(trimmed)))
    }

    pub fn build(self) -> String {
        self.rendered
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rendered)
    }
}

/// Quotes a single value for safe inclusion in a POSIX shell command line.
pub fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

/// Splits a shell command line into argv the same way a POSIX shell would,
/// used when a caller hands the engine a single string and `raw` mode
/// requires local tokenizing rather than delegating to `sh -c` (spec.md
/// §4.1 "raw mode").
pub fn split(command: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(command)
}

/// Joins argv into a single shell-safe string, the inverse of [`split`].
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    shell_words::join(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_values_with_spaces_and_special_chars() {
        assert_eq!(quote("hello world"), "'hello world'");
        assert_eq!(quote("safe"), "safe");
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn template_escapes_interpolated_values_but_not_raw() {
        let rendered = Template::new()
            .literal("echo ")
            .value("hello world")
            .literal(" > ")
            .value(Value::Raw("/tmp/out".to_string()))
            .build();
        assert_eq!(rendered, "echo 'hello world' > /tmp/out");
    }

    #[test]
    fn numbers_and_booleans_are_never_quoted() {
        let rendered = Template::new()
            .literal("exit ")
            .value(3i32)
            .literal(" # ")
            .value(true)
            .build();
        assert_eq!(rendered, "exit 3 # true");
    }

    #[test]
    fn null_interpolates_as_empty() {
        let none: Option<String> = None;
        let rendered = Template::new().literal("echo[").value(none).literal("]").build();
        assert_eq!(rendered, "echo[]");
    }

    #[test]
    fn lists_join_with_one_space_of_quoted_elements() {
        let items = vec!["a b".to_string(), "c".to_string()];
        let rendered = Template::new().literal("echo ").value(items).build();
        assert_eq!(rendered, "echo 'a b' c");
    }

    #[test]
    fn objects_are_json_serialized_then_quoted() {
        #[derive(serde::Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }
        let value = json_value(&Point { x: 1, y: 2 }).unwrap();
        let rendered = Template::new().literal("echo ").value(value).build();
        assert_eq!(rendered, "echo '{\"x\":1,\"y\":2}'");
    }

    #[test]
    fn raw_mode_never_quotes_but_still_normalizes_types() {
        let rendered = Template::raw().literal("echo ").value(3i32).literal(" ").value("a b").build();
        assert_eq!(rendered, "echo 3 a b");
    }

    #[test]
    fn raw_mode_persists_through_chained_values() {
        let rendered = Template::raw().value("a b").literal(" ").value("c d").build();
        assert_eq!(rendered, "a b c d");
    }

    #[tokio::test]
    async fn handle_output_is_awaited_and_trimmed_of_one_trailing_newline() {
        let engine = crate::engine::Engine::new().unwrap();
        let inner = engine.sh("echo inner").unwrap();
        let rendered = Template::new()
            .literal("echo [")
            .value_handle(&inner)
            .await
            .unwrap()
            .literal("]")
            .build();
        assert_eq!(rendered, "echo ['inner']");
    }

    #[test]
    fn split_and_join_round_trip() {
        let argv = split("echo 'hello world' foo").unwrap();
        assert_eq!(argv, vec!["echo", "hello world", "foo"]);
        assert_eq!(join(&argv), "echo 'hello world' foo");
    }
}
