// Variable References
// Scans templates for $(...) markers and parses them into typed references

use crate::substitution::SubstitutionError;

use std::fmt;

/// Part of a value a reference selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// The value as declared: `$(params.x)`
    Whole,
    /// Every element: `$(params.x[*])`
    Star,
    /// One array element: `$(params.x[1])`
    Index(usize),
    /// One object key: `$(params.x.key)`
    Key(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextVar {
    RunName,
    RunNamespace,
    RunUid,
    PipelineName,
    TaskRetries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceField {
    Bound,
    Path,
}

/// A parsed `$(...)` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarRef {
    Param {
        name: String,
        selector: Selector,
    },
    Result {
        task: String,
        result: String,
        selector: Selector,
    },
    /// `$(tasks.<name>.status)`
    TaskStatus { task: String },
    /// `$(tasks.<name>.reason)`
    TaskReason { task: String },
    /// `$(tasks.status)`
    AggregateStatus,
    Context(ContextVar),
    Workspace {
        name: String,
        field: WorkspaceField,
    },
}

impl VarRef {
    /// Task whose result or status this reference reads
    pub fn task(&self) -> Option<&str> {
        match self {
            VarRef::Result { task, .. }
            | VarRef::TaskStatus { task }
            | VarRef::TaskReason { task } => Some(task),
            _ => None,
        }
    }

    pub fn reads_status(&self) -> bool {
        matches!(
            self,
            VarRef::TaskStatus { .. } | VarRef::TaskReason { .. } | VarRef::AggregateStatus
        )
    }
}

/// A template split into literal text and references
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Reference { raw: String, var: VarRef },
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Text(text) => write!(f, "{}", text),
            Segment::Reference { raw, .. } => write!(f, "{}", raw),
        }
    }
}

/// Split a template into text and references.
///
/// Markers outside the `params`, `tasks`, `context` and `workspaces`
/// namespaces are kept as literal text so shell snippets such as `$(date)`
/// pass through untouched. A marker inside a known namespace that does not
/// parse is an error.
pub fn scan(template: &str) -> Result<Vec<Segment>, SubstitutionError> {
    let chars: Vec<char> = template.chars().collect();
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut pos = 0;

    while pos < chars.len() {
        if chars[pos] == '$' && chars.get(pos + 1) == Some(&'(') {
            if let Some(end) = find_closing(&chars, pos + 2) {
                let body: String = chars[pos + 2..end].iter().collect();
                if let Some(parsed) = parse_reference(&body) {
                    let raw = format!("$({})", body);
                    let var = parsed.map_err(|message| SubstitutionError::Malformed {
                        reference: raw.clone(),
                        message,
                    })?;
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Reference { raw, var });
                    pos = end + 1;
                    continue;
                }
            }
        }
        text.push(chars[pos]);
        pos += 1;
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

/// Every reference in a template
pub fn references(template: &str) -> Result<Vec<VarRef>, SubstitutionError> {
    Ok(scan(template)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Reference { var, .. } => Some(var),
            Segment::Text(_) => None,
        })
        .collect())
}

/// Index of the `)` closing a marker body starting at `start`
fn find_closing(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 1;
    let mut quote: Option<char> = None;

    for (i, &ch) in chars.iter().enumerate().skip(start) {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
    }

    None
}

/// Parse a marker body; `None` when it is outside the known namespaces
fn parse_reference(body: &str) -> Option<Result<VarRef, String>> {
    let body = body.trim();
    let (head, rest) = take_name(body);
    let parsed = match head {
        "params" => parse_param(rest),
        "tasks" => parse_task(rest),
        "context" => parse_context(rest),
        "workspaces" => parse_workspace(rest),
        _ => return None,
    };
    Some(parsed)
}

fn parse_param(rest: &str) -> Result<VarRef, String> {
    let (name, rest) = if let Some(after) = rest.strip_prefix('.') {
        take_name(after)
    } else if let Some(after) = rest.strip_prefix('[') {
        take_quoted(after)?
    } else {
        return Err("expected '.<name>' or '[\"<name>\"]' after 'params'".to_string());
    };
    if name.is_empty() {
        return Err("empty parameter name".to_string());
    }

    Ok(VarRef::Param {
        name: name.to_string(),
        selector: parse_selector(rest)?,
    })
}

fn parse_task(rest: &str) -> Result<VarRef, String> {
    let Some(after) = rest.strip_prefix('.') else {
        return Err("expected '.<task>' after 'tasks'".to_string());
    };
    let (task, rest) = take_name(after);
    if task.is_empty() {
        return Err("empty task name".to_string());
    }

    match rest {
        "" if task == "status" => return Ok(VarRef::AggregateStatus),
        ".status" => {
            return Ok(VarRef::TaskStatus {
                task: task.to_string(),
            })
        }
        ".reason" => {
            return Ok(VarRef::TaskReason {
                task: task.to_string(),
            })
        }
        _ => {}
    }

    let Some(after) = rest.strip_prefix(".results.") else {
        return Err(format!(
            "expected '.results.<name>', '.status' or '.reason' after 'tasks.{}'",
            task
        ));
    };
    let (result, rest) = take_name(after);
    if result.is_empty() {
        return Err("empty result name".to_string());
    }

    Ok(VarRef::Result {
        task: task.to_string(),
        result: result.to_string(),
        selector: parse_selector(rest)?,
    })
}

fn parse_context(rest: &str) -> Result<VarRef, String> {
    let var = match rest {
        ".pipelineRun.name" => ContextVar::RunName,
        ".pipelineRun.namespace" => ContextVar::RunNamespace,
        ".pipelineRun.uid" => ContextVar::RunUid,
        ".pipeline.name" => ContextVar::PipelineName,
        ".pipelineTask.retries" => ContextVar::TaskRetries,
        other => return Err(format!("unknown context variable 'context{}'", other)),
    };
    Ok(VarRef::Context(var))
}

fn parse_workspace(rest: &str) -> Result<VarRef, String> {
    let Some(after) = rest.strip_prefix('.') else {
        return Err("expected '.<workspace>' after 'workspaces'".to_string());
    };
    let (name, rest) = take_name(after);
    let field = match rest {
        ".bound" => WorkspaceField::Bound,
        ".path" => WorkspaceField::Path,
        _ => return Err(format!("expected '.bound' or '.path' after 'workspaces.{}'", name)),
    };
    if name.is_empty() {
        return Err("empty workspace name".to_string());
    }

    Ok(VarRef::Workspace {
        name: name.to_string(),
        field,
    })
}

fn parse_selector(rest: &str) -> Result<Selector, String> {
    if rest.is_empty() {
        return Ok(Selector::Whole);
    }
    if rest == "[*]" {
        return Ok(Selector::Star);
    }
    if let Some(inner) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return inner
            .trim()
            .parse::<usize>()
            .map(Selector::Index)
            .map_err(|_| format!("invalid index '[{}]'", inner));
    }
    if let Some(key) = rest.strip_prefix('.') {
        let (name, tail) = take_name(key);
        if !name.is_empty() && tail.is_empty() {
            return Ok(Selector::Key(name.to_string()));
        }
    }
    Err(format!("unexpected '{}'", rest))
}

/// Split off a leading name made of alphanumerics, '_' and '-'
fn take_name(input: &str) -> (&str, &str) {
    let end = input
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(input.len());
    input.split_at(end)
}

/// Parse `"name"]` or `'name']` following an opening bracket
fn take_quoted(input: &str) -> Result<(&str, &str), String> {
    let mut chars = input.chars();
    let quote = match chars.next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return Err("expected a quoted name inside '[...]'".to_string()),
    };
    let body = &input[1..];
    let close = body
        .find(quote)
        .ok_or_else(|| "unterminated quoted name".to_string())?;
    let name = &body[..close];
    let rest = body[close + 1..]
        .strip_prefix(']')
        .ok_or_else(|| "expected ']' after quoted name".to_string())?;
    Ok((name, rest))
}
