//! The two tier variable space the game engine works on.
//!
//! Keys starting with a single `@` live in the global map of a game, keys
//! starting with `@@` live in the local map of the player whose script step
//! is currently executing. Everything else is a malformed key. On top of the
//! routing this module implements the recursive expansion of variable
//! references inside script arguments. Expansion is pure and never fails.

use indexmap::IndexMap;
use protocol::Value;

/// The sentinel character that marks a variable reference.
pub const SENTINEL: char = '@';

/// Recursion cap for chained references, so a self referential variable can
/// not hang the engine. Beyond the cap the value is returned unexpanded.
const MAX_EXPANSION_DEPTH: usize = 16;

/// One tier of the variable space.
pub type VarMap = IndexMap<String, Value>;

/// Where a key routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// Single sentinel, the per game map.
    Global,
    /// Double sentinel, the per player map.
    Local,
}

/// Classifies a key by its prefix. Returns `None` for malformed keys.
pub fn classify(key: &str) -> Option<KeyScope> {
    if let Some(rest) = key.strip_prefix("@@") {
        (!rest.is_empty()).then_some(KeyScope::Local)
    } else if let Some(rest) = key.strip_prefix('@') {
        (!rest.is_empty()).then_some(KeyScope::Global)
    } else {
        None
    }
}

/// A mutable view on the two variable tiers an op executes against.
/// A step running in the global cursor has no local tier.
pub struct Scope<'a> {
    pub globals: &'a mut VarMap,
    pub locals: Option<&'a mut VarMap>,
}

impl Scope<'_> {
    /// Writes a value, routed by prefix. A malformed key or a local write
    /// without a player scope is logged and has no effect; the return value
    /// tells the caller whether the write happened.
    pub fn write(&mut self, key: &str, value: Value) -> bool {
        match classify(key) {
            Some(KeyScope::Global) => {
                self.globals.insert(key.to_string(), value);
                true
            }
            Some(KeyScope::Local) => {
                let Some(locals) = self.locals.as_deref_mut() else {
                    tracing::error!(key, "Local variable written outside a per-player step.");
                    return false;
                };
                locals.insert(key.to_string(), value);
                true
            }
            None => {
                tracing::error!(key, "Malformed variable key on write.");
                false
            }
        }
    }

    /// Reads a value, routed by prefix.
    pub fn read(&self, key: &str) -> Option<&Value> {
        match classify(key) {
            Some(KeyScope::Global) => self.globals.get(key),
            Some(KeyScope::Local) => self.locals.as_deref().and_then(|locals| locals.get(key)),
            None => None,
        }
    }

    /// Removes a key. Deleting a missing key succeeds silently.
    pub fn delete(&mut self, key: &str) {
        match classify(key) {
            Some(KeyScope::Global) => {
                self.globals.shift_remove(key);
            }
            Some(KeyScope::Local) => {
                if let Some(locals) = self.locals.as_deref_mut() {
                    locals.shift_remove(key);
                }
            }
            None => {
                tracing::error!(key, "Malformed variable key on delete.");
            }
        }
    }

    /// True only if the key is present in the map it routes to.
    pub fn exists(&self, key: &str) -> bool {
        self.read(key).is_some()
    }

    /// Expands a value tree against this scope (see [`expand`]).
    pub fn expand(&self, value: &Value) -> Value {
        expand(value, self.globals, self.locals.as_deref())
    }
}

/// Recursively expands variable references inside a value tree.
///
/// A string that consists of exactly one variable name is substituted in
/// full, preserving the type of the referenced value. Otherwise variable
/// tokens inside the string (`{@name}`, `{@@name}` or bare `@name`) are
/// replaced by the printable form of their value. Unresolved references stay
/// literal, so a downstream op can detect the absence.
pub fn expand(value: &Value, globals: &VarMap, locals: Option<&VarMap>) -> Value {
    expand_depth(value, globals, locals, 0)
}

fn expand_depth(value: &Value, globals: &VarMap, locals: Option<&VarMap>, depth: usize) -> Value {
    if depth >= MAX_EXPANSION_DEPTH {
        return value.clone();
    }
    match value {
        Value::String(text) => expand_string(text, globals, locals, depth),
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| expand_depth(item, globals, locals, depth))
                .collect(),
        ),
        Value::Set(items) => Value::set_from(
            items
                .iter()
                .map(|item| expand_depth(item, globals, locals, depth)),
        ),
        Value::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(key, entry)| (key.clone(), expand_depth(entry, globals, locals, depth)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Looks a reference like `@x` or `@@x` up in the tier its prefix selects.
fn lookup<'a>(name: &str, globals: &'a VarMap, locals: Option<&'a VarMap>) -> Option<&'a Value> {
    match classify(name)? {
        KeyScope::Global => globals.get(name),
        KeyScope::Local => locals.and_then(|map| map.get(name)),
    }
}

fn expand_string(text: &str, globals: &VarMap, locals: Option<&VarMap>, depth: usize) -> Value {
    // Whole-string substitution keeps the type of the referenced value.
    if text.starts_with(SENTINEL)
        && let Some(found) = lookup(text, globals, locals)
    {
        return expand_depth(found, globals, locals, depth + 1);
    }

    // Otherwise splice printable forms into the text.
    let expanded = splice_references(text, globals, locals, depth);
    Value::String(expanded)
}

/// Replaces `{@name}` segments and bare `@name` tokens inside a string by
/// the printable form of the referenced value. Nesting of braces is not
/// supported; unresolved references are left in place.
fn splice_references(
    text: &str,
    globals: &VarMap,
    locals: Option<&VarMap>,
    depth: usize,
) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;

    while pos < chars.len() {
        // A braced segment: `{` directly followed by the sentinel, up to the
        // next `}`.
        if chars[pos] == '{'
            && pos + 1 < chars.len()
            && chars[pos + 1] == SENTINEL
            && let Some(close) = chars[pos + 1..].iter().position(|&c| c == '}')
        {
            let name: String = chars[pos + 1..pos + 1 + close].iter().collect();
            if let Some(found) = lookup(&name, globals, locals) {
                out.push_str(&expand_depth(found, globals, locals, depth + 1).printable());
            } else {
                // Leave the whole `{...}` text in place.
                out.extend(&chars[pos..pos + close + 2]);
            }
            pos += close + 2;
            continue;
        }

        // A bare token: one or two sentinels followed by name characters.
        if chars[pos] == SENTINEL {
            let mut cursor = pos + 1;
            if cursor < chars.len() && chars[cursor] == SENTINEL {
                cursor += 1;
            }
            let name_start = cursor;
            while cursor < chars.len() && is_name_char(chars[cursor]) {
                cursor += 1;
            }
            if cursor > name_start {
                let token: String = chars[pos..cursor].iter().collect();
                if let Some(found) = lookup(&token, globals, locals) {
                    out.push_str(&expand_depth(found, globals, locals, depth + 1).printable());
                    pos = cursor;
                    continue;
                }
            }
            // No name or unresolved: keep the sentinel literal.
            out.push(chars[pos]);
            pos += 1;
            continue;
        }

        out.push(chars[pos]);
        pos += 1;
    }

    out
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
