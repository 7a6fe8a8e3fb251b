use convo_core::{ConvoError, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::env;

// ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex pattern")
});

/// Expand `${VAR}` references in every string of a config tree.
pub fn expand_tree(value: &mut Value) -> Result<()> {
    let mut missing = Vec::new();
    walk(value, &mut missing);

    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    missing.dedup();
    Err(ConvoError::Config(format!(
        "Missing required environment variables: {}",
        missing.join(", ")
    )))
}

fn walk(value: &mut Value, missing: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(expanded) = expand_str(s, missing) {
                *s = expanded;
            }
        }
        Value::Object(map) => map.values_mut().for_each(|v| walk(v, missing)),
        Value::Array(items) => items.iter_mut().for_each(|v| walk(v, missing)),
        _ => {}
    }
}

fn expand_str(input: &str, missing: &mut Vec<String>) -> Option<String> {
    if !ENV_VAR_REGEX.is_match(input) {
        return None;
    }

    let expanded = ENV_VAR_REGEX.replace_all(input, |cap: &Captures| {
        let name = &cap[1];
        match lookup(name) {
            Some(value) => value,
            None => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            },
        }
    });
    Some(expanded.into_owned())
}

fn lookup(name: &str) -> Option<String> {
    env::var(name).ok().or_else(|| {
        // Windows has no HOME
        if name == "HOME" {
            env::var("USERPROFILE").ok()
        } else {
            None
        }
    })
}
