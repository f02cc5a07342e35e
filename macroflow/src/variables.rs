//! `${name}` placeholder resolution against a run's binding table.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"));

static LEGACY_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([a-zA-Z0-9_.-]+)\s*\}\}").expect("legacy placeholder pattern is valid")
});

/// Name -> value table owned by one run. Seeded from the macro's declared
/// defaults and updated by sensing steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared defaults, overridden by caller-supplied values.
    pub fn seeded(
        defaults: &BTreeMap<String, String>,
        overrides: &BTreeMap<String, String>,
    ) -> Self {
        let mut values = defaults.clone();
        for (name, value) in overrides {
            values.insert(name.clone(), value.clone());
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }
}

/// Result of resolving one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    /// Names that had no binding and were replaced by the empty string.
    pub unresolved: Vec<String>,
}

/// Replaces every `${name}` in `template`. Unbound names become empty strings and
/// are reported back; an unterminated `${` is left as literal text.
pub fn resolve(template: &str, bindings: &Bindings) -> Resolved {
    let mut unresolved = Vec::new();
    let value = PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = caps[1].trim();
            match bindings.get(name) {
                Some(value) => value.to_string(),
                None => {
                    if !unresolved.iter().any(|n: &String| n == name) {
                        unresolved.push(name.to_string());
                    }
                    String::new()
                }
            }
        })
        .into_owned();
    Resolved { value, unresolved }
}

/// Names referenced by `template`, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = caps[1].trim();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

pub fn has_placeholder(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}

/// Rewrites legacy `{{name}}` placeholders into `${name}`.
pub fn upgrade_legacy_placeholders(text: &str) -> String {
    LEGACY_PLACEHOLDER.replace_all(text, "$${$1}").into_owned()
}
