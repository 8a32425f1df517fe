//! Translation from the engine's canonical `:name` parameter references to
//! a driver's placeholder style.
//!
//! A reference is replaced only when it names a known parameter, is not
//! preceded by `:` (a SQL cast such as `::INT`) or a backslash escape, and
//! ends at a word boundary.

use std::collections::HashMap;

use regex::{Captures, Regex};

use super::driver::Value;

/// Placeholder styles across the supported drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `:name` passed through untouched, with a name/value map.
    Named,
    /// `?` (SQLite, MySQL)
    Qmark,
    /// `:1`, `:2`, ...
    Numeric,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
    /// `%s`
    Format,
    /// `%(name)s`
    Pyformat,
}

impl ParamStyle {
    fn is_positional(self) -> bool {
        matches!(
            self,
            ParamStyle::Qmark | ParamStyle::Numeric | ParamStyle::Dollar | ParamStyle::Format
        )
    }
}

/// Bind values in the shape the target style expects.
#[derive(Debug, PartialEq)]
pub enum TranslatedParams {
    /// Values ordered by placeholder occurrence; a name referenced twice
    /// contributes its value twice.
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl TranslatedParams {
    pub fn into_positional(self) -> Vec<Value> {
        match self {
            TranslatedParams::Positional(values) => values,
            TranslatedParams::Named(pairs) => pairs.into_iter().map(|(_, v)| v).collect(),
        }
    }
}

/// Rewrite `sql` for `style`, returning the rewritten statement and the
/// bind values it now expects.
pub fn change_param_style(
    style: ParamStyle,
    sql: &str,
    params: &[(&str, Value)],
) -> (String, TranslatedParams) {
    if style == ParamStyle::Named {
        let named = params
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        return (sql.to_string(), TranslatedParams::Named(named));
    }
    if params.is_empty() {
        let empty = if style.is_positional() {
            TranslatedParams::Positional(Vec::new())
        } else {
            TranslatedParams::Named(Vec::new())
        };
        return (sql.to_string(), empty);
    }

    let by_name: HashMap<&str, &Value> = params.iter().map(|(name, v)| (*name, v)).collect();
    let alternation = params
        .iter()
        .map(|(name, _)| regex::escape(name))
        .collect::<Vec<_>>()
        .join("|");
    // The optional guard character stands in for a lookbehind: when a cast
    // (`::`) or an escape (`\:`) precedes the reference, the whole match is
    // emitted back unchanged.
    let pattern = Regex::new(&format!(r"(?P<guard>[:\\])?:(?P<name>{alternation})\b"))
        .expect("parameter names escape to a valid pattern");

    let mut ordered: Vec<Value> = Vec::new();
    let mut counter = 0usize;
    let rewritten = pattern.replace_all(sql, |caps: &Captures<'_>| {
        if caps.name("guard").is_some() {
            return caps[0].to_string();
        }
        let name = &caps["name"];
        if style.is_positional() {
            ordered.push((*by_name[name]).clone());
        }
        counter += 1;
        match style {
            ParamStyle::Qmark => "?".to_string(),
            ParamStyle::Numeric => format!(":{counter}"),
            ParamStyle::Dollar => format!("${counter}"),
            ParamStyle::Format => "%s".to_string(),
            ParamStyle::Pyformat => format!("%({name})s"),
            ParamStyle::Named => unreachable!(),
        }
    });

    let translated = if style.is_positional() {
        TranslatedParams::Positional(ordered)
    } else {
        TranslatedParams::Named(
            params
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    };
    (rewritten.into_owned(), translated)
}
