//! Migration source parsing.
//!
//! Migration files are plain SQL annotated with `-- strata:` directive
//! comments:
//!
//! ```sql
//! -- strata:depends 0001_initial
//! -- strata:transactional true
//!
//! -- strata:step ignore-errors="apply"
//! CREATE TABLE users (id INT PRIMARY KEY);
//! -- strata:rollback
//! DROP TABLE users;
//! ```
//!
//! `-- strata:group` / `-- strata:endgroup` bracket steps that execute as a
//! unit. A file with no step directive at all is a single step whose apply
//! SQL is the whole file.

use crate::constants::DIRECTIVE_PREFIX;
use crate::error::{Error, Result};
use crate::migration::step::{AtomicStep, IgnoreErrors, Step, StepDirective};

/// One parsed step definition: apply SQL, optional rollback SQL and the
/// error-tolerance policy of its wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub apply: String,
    pub rollback: Option<String>,
    pub ignore_errors: Option<IgnoreErrors>,
}

/// A top-level item: a single step or a group of steps.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSpec {
    Step(StepSpec),
    Group {
        steps: Vec<StepSpec>,
        ignore_errors: Option<IgnoreErrors>,
    },
}

/// The parsed source of one migration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSource {
    pub depends: Vec<String>,
    pub transactional: bool,
    pub items: Vec<ItemSpec>,
}

impl ParsedSource {
    /// Materialize wrapped steps, choosing transactional or
    /// non-transactional wrappers uniformly for the whole migration.
    pub fn create_steps(&self, use_transactions: bool) -> Vec<Step> {
        let mut next_id = 0u64;
        let mut atomic = |spec: &StepSpec| {
            let step = Step::Atomic(AtomicStep {
                id: next_id,
                apply: StepDirective::Sql(spec.apply.clone()),
                rollback: spec.rollback.clone().map(StepDirective::Sql),
            });
            next_id += 1;
            step
        };
        let wrap = |step: Step, ignore_errors: Option<IgnoreErrors>| {
            if use_transactions {
                Step::Transaction {
                    step: Box::new(step),
                    ignore_errors,
                }
            } else {
                Step::Transactionless {
                    step: Box::new(step),
                    ignore_errors,
                }
            }
        };

        self.items
            .iter()
            .map(|item| match item {
                ItemSpec::Step(spec) => wrap(atomic(spec), spec.ignore_errors),
                ItemSpec::Group {
                    steps,
                    ignore_errors,
                } => {
                    let children = steps
                        .iter()
                        .map(|spec| wrap(atomic(spec), spec.ignore_errors))
                        .collect();
                    wrap(Step::Group { steps: children }, *ignore_errors)
                }
            })
            .collect()
    }
}

#[derive(Default)]
struct StepBuilder {
    apply: String,
    rollback: Option<String>,
    ignore_errors: Option<IgnoreErrors>,
}

impl StepBuilder {
    fn finish(self) -> StepSpec {
        StepSpec {
            apply: self.apply.trim().to_string(),
            rollback: self
                .rollback
                .map(|sql| sql.trim().to_string())
                .filter(|sql| !sql.is_empty()),
            ignore_errors: self.ignore_errors,
        }
    }
}

/// Parse migration source text. `name` is used in error messages only.
pub fn parse_source(name: &str, source: &str) -> Result<ParsedSource> {
    let bad = |line_no: usize, message: String| {
        Error::BadMigration(format!("{name}:{line_no}: {message}"))
    };

    let mut parsed = ParsedSource {
        transactional: true,
        ..ParsedSource::default()
    };
    let mut group: Option<(Vec<StepSpec>, Option<IgnoreErrors>)> = None;
    let mut current: Option<StepBuilder> = None;
    let mut in_rollback = false;
    // Leading SQL before the first step directive flows into that step.
    let mut buffer = String::new();

    let finish_current =
        |current: &mut Option<StepBuilder>,
         group: &mut Option<(Vec<StepSpec>, Option<IgnoreErrors>)>,
         items: &mut Vec<ItemSpec>| {
            if let Some(builder) = current.take() {
                let spec = builder.finish();
                match group {
                    Some((steps, _)) => steps.push(spec),
                    None => items.push(ItemSpec::Step(spec)),
                }
            }
        };

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim_start();
        if !trimmed.starts_with(DIRECTIVE_PREFIX) {
            match &mut current {
                Some(builder) if in_rollback => {
                    let sql = builder.rollback.get_or_insert_with(String::new);
                    sql.push_str(line);
                    sql.push('\n');
                }
                Some(builder) => {
                    builder.apply.push_str(line);
                    builder.apply.push('\n');
                }
                None => {
                    buffer.push_str(line);
                    buffer.push('\n');
                }
            }
            continue;
        }

        let directive = trimmed[DIRECTIVE_PREFIX.len()..].trim();
        let (keyword, rest) = match directive.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (directive, ""),
        };

        match keyword {
            "depends" => {
                parsed.depends.extend(rest.split_whitespace().map(str::to_string));
            }
            "transactional" => {
                parsed.transactional = match rest {
                    "true" | "True" => true,
                    "false" | "False" => false,
                    other => {
                        return Err(bad(
                            line_no,
                            format!("invalid transactional value {other:?}"),
                        ));
                    }
                };
            }
            "step" => {
                finish_current(&mut current, &mut group, &mut parsed.items);
                let mut builder = StepBuilder {
                    apply: std::mem::take(&mut buffer),
                    ..StepBuilder::default()
                };
                builder.ignore_errors = parse_ignore_errors(rest).map_err(|e| bad(line_no, e))?;
                current = Some(builder);
                in_rollback = false;
            }
            "rollback" => {
                match &mut current {
                    Some(builder) => {
                        builder.rollback.get_or_insert_with(String::new);
                        in_rollback = true;
                    }
                    None => return Err(bad(line_no, "rollback directive outside a step".into())),
                }
            }
            // "transaction" is a historical alias for "group"
            "group" | "transaction" => {
                if group.is_some() {
                    return Err(bad(line_no, "groups cannot be nested".into()));
                }
                finish_current(&mut current, &mut group, &mut parsed.items);
                let ignore_errors = parse_ignore_errors(rest).map_err(|e| bad(line_no, e))?;
                group = Some((Vec::new(), ignore_errors));
                in_rollback = false;
            }
            "endgroup" => {
                finish_current(&mut current, &mut group, &mut parsed.items);
                match group.take() {
                    Some((steps, ignore_errors)) => parsed.items.push(ItemSpec::Group {
                        steps,
                        ignore_errors,
                    }),
                    None => return Err(bad(line_no, "endgroup without a group".into())),
                }
                in_rollback = false;
            }
            other => return Err(bad(line_no, format!("unknown directive {other:?}"))),
        }
    }

    finish_current(&mut current, &mut group, &mut parsed.items);
    if group.is_some() {
        return Err(Error::BadMigration(format!("{name}: unterminated group")));
    }

    // No step directives at all: the whole file is one step.
    if parsed.items.is_empty() && !buffer.trim().is_empty() {
        parsed.items.push(ItemSpec::Step(StepSpec {
            apply: buffer.trim().to_string(),
            rollback: None,
            ignore_errors: None,
        }));
    }

    Ok(parsed)
}

/// Parse the optional `ignore-errors="..."` attribute on a step or group
/// directive.
fn parse_ignore_errors(rest: &str) -> std::result::Result<Option<IgnoreErrors>, String> {
    if rest.is_empty() {
        return Ok(None);
    }
    let mut result = None;
    for (key, value) in parse_key_value_pairs(rest)? {
        match key.as_str() {
            "ignore-errors" => {
                result = Some(IgnoreErrors::parse(&value).map_err(|e| e.to_string())?);
            }
            other => return Err(format!("unknown attribute {other:?}")),
        }
    }
    Ok(result)
}

/// Parse `key="value"` pairs from a directive line.
fn parse_key_value_pairs(input: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&ch) = chars.peek() {
            if ch == '=' {
                chars.next();
                break;
            }
            if ch.is_whitespace() {
                return Err(format!("expected '=' after {key:?}"));
            }
            key.push(ch);
            chars.next();
        }
        if key.is_empty() {
            break;
        }

        if chars.next() != Some('"') {
            return Err(format!("expected '\"' after {key}="));
        }
        let mut value = String::new();
        let mut closed = false;
        for ch in chars.by_ref() {
            if ch == '"' {
                closed = true;
                break;
            }
            value.push(ch);
        }
        if !closed {
            return Err(format!("missing closing quote for {key:?}"));
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}
