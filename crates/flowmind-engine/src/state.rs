use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use flowmind_core::error::{FlowError, Result};

/// Read access to named values, shared by interpolation and condition evaluation.
pub trait VarLookup: Sync {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

/// The run's blackboard: named values shared between nodes.
///
/// Keys are only ever added or overwritten; nothing is removed while a run
/// is alive.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    data: HashMap<String, Value>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with caller parameters.
    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Merge a delta into the store (last writer wins per key).
    pub fn merge<I>(&mut self, delta: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (k, v) in delta {
            self.data.insert(k, v);
        }
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn into_inner(self) -> HashMap<String, Value> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl VarLookup for StateStore {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Private locals layered over a shared, read-only store.
pub struct Scope<'a> {
    base: &'a StateStore,
    locals: HashMap<String, Value>,
}

impl<'a> Scope<'a> {
    pub fn new(base: &'a StateStore) -> Self {
        Self {
            base,
            locals: HashMap::new(),
        }
    }

    pub fn with_local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(name.into(), value);
        self
    }
}

impl VarLookup for Scope<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.base.lookup(name))
    }
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?:\[(-?\d+)\])?\}")
            .unwrap_or_else(|e| panic!("invalid reference pattern: {e}"))
    })
}

/// Resolve `name` or `name[index]` (negative index counts from the end).
pub fn resolve(vars: &dyn VarLookup, name: &str, index: Option<i64>) -> Result<Value> {
    let value = vars
        .lookup(name)
        .ok_or_else(|| FlowError::UnknownVariable(name.to_string()))?;
    let Some(index) = index else {
        return Ok(value.clone());
    };
    let display = format!("{name}[{index}]");
    let items = value
        .as_array()
        .ok_or_else(|| FlowError::UnknownVariable(display.clone()))?;
    let len = items.len() as i64;
    let position = if index < 0 { len + index } else { index };
    if position < 0 || position >= len {
        return Err(FlowError::UnknownVariable(display));
    }
    Ok(items[position as usize].clone())
}

fn resolve_capture(vars: &dyn VarLookup, caps: &Captures<'_>) -> Result<Value> {
    let name = &caps[1];
    let index = match caps.get(2) {
        Some(m) => Some(
            m.as_str()
                .parse::<i64>()
                .map_err(|_| FlowError::UnknownVariable(caps[0].to_string()))?,
        ),
        None => None,
    };
    resolve(vars, name, index)
}

/// Substitute every `{name}` / `{name[i]}` reference with its text rendering.
pub fn interpolate(template: &str, vars: &dyn VarLookup) -> Result<String> {
    let pattern = reference_pattern();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in pattern.captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        out.push_str(&template[last..whole.start]);
        out.push_str(&render(&resolve_capture(vars, &caps)?));
        last = whole.end;
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Interpolate every string inside a JSON value.
///
/// A string consisting of exactly one reference is replaced by the referenced
/// value itself, keeping its type.
pub fn interpolate_value(value: &Value, vars: &dyn VarLookup) -> Result<Value> {
    match value {
        Value::String(s) => {
            if let Some(caps) = reference_pattern().captures(s) {
                if caps.get(0).is_some_and(|m| m.as_str().len() == s.len()) {
                    return resolve_capture(vars, &caps);
                }
            }
            Ok(Value::String(interpolate(s, vars)?))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| interpolate_value(v, vars))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Text rendering that stays legible to the model.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| format!("- {}", render_inline(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}

fn render_inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Short JSON type name used in diagnostics.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
