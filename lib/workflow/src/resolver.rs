//! Variable token resolution.
//!
//! Tokens are written as `{{path}}`, where `path` is a dot-separated sequence
//! of identifiers, optionally indexed with `[N]`, e.g. `{{items.0}}` or
//! `{{runtime.loop_index}}`. Resolution order: reserved names (`loopIndex`,
//! `runId`, ...), then `runtime.*` tokens, then `faker.*` tokens, then static
//! variables, then dynamic variables (whose value is itself resolved
//! recursively), falling back to the literal token text with a warning if
//! nothing matches.

use crate::model::VariableContext;
use chrono::{Duration as ChronoDuration, Utc};
use fake::Fake;
use fake::faker::address::en::{CityName, StreetName};
use fake::faker::company::en::CompanyName;
use fake::faker::internet::en::{FreeEmail, Password, Username};
use fake::faker::name::en::{FirstName, LastName, Name};
use fake::faker::phone_number::en::PhoneNumber;
use rand::Rng;
use serde_json::Value;
use std::fmt;

/// Names resolved from [`VariableContext::reserved`] before any other rule
/// is considered, per the variable resolution order.
const RESERVED_NAMES: &[&str] = &[
    "loopIndex",
    "localLoopIndex",
    "timestamp",
    "runId",
    "userId",
    "projectId",
    "automationId",
];

/// Errors encountered while resolving variable tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    /// A dynamic variable referenced itself, directly or transitively.
    CircularReference { key: String },
    /// Recursion depth exceeded the configured maximum.
    MaxDepthExceeded { depth: usize },
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircularReference { key } => {
                write!(f, "circular variable reference: {key}")
            }
            Self::MaxDepthExceeded { depth } => {
                write!(f, "variable resolution exceeded max depth of {depth}")
            }
        }
    }
}

impl std::error::Error for ResolverError {}

const MAX_RESOLUTION_DEPTH: usize = 16;

/// Resolves `{{...}}` tokens within strings and JSON values against a
/// [`VariableContext`].
pub struct VariableResolver<'a> {
    context: &'a VariableContext,
}

impl<'a> VariableResolver<'a> {
    #[must_use]
    pub fn new(context: &'a VariableContext) -> Self {
        Self { context }
    }

    /// Resolves all tokens within a JSON value, recursing into objects and
    /// arrays. Non-string scalars pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if a dynamic variable is circular or resolution
    /// recurses past the maximum depth.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, ResolverError> {
        match value {
            Value::String(s) => Ok(Value::String(self.resolve_string(s)?)),
            Value::Array(items) => {
                let resolved: Result<Vec<Value>, ResolverError> =
                    items.iter().map(|v| self.resolve_value(v)).collect();
                Ok(Value::Array(resolved?))
            }
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    resolved.insert(k.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolves all tokens within a single string.
    ///
    /// # Errors
    ///
    /// Returns an error if a dynamic variable is circular or resolution
    /// recurses past the maximum depth.
    pub fn resolve_string(&self, input: &str) -> Result<String, ResolverError> {
        self.resolve_string_at_depth(input, 0)
    }

    fn resolve_string_at_depth(&self, input: &str, depth: usize) -> Result<String, ResolverError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(ResolverError::MaxDepthExceeded {
                depth: MAX_RESOLUTION_DEPTH,
            });
        }

        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                // Unterminated token: emit the rest literally.
                output.push_str(&rest[start..]);
                rest = "";
                break;
            };

            let path = after_open[..end].trim();
            let resolved = self.resolve_token(path, depth)?;
            output.push_str(&resolved);
            rest = &after_open[end + 2..];
        }
        output.push_str(rest);

        Ok(output)
    }

    fn resolve_token(&self, path: &str, depth: usize) -> Result<String, ResolverError> {
        let segments: Vec<&str> = path.split('.').collect();

        if segments.len() == 1 && RESERVED_NAMES.contains(&segments[0]) {
            return Ok(self
                .context
                .reserved
                .get(segments[0])
                .map(value_to_text)
                .unwrap_or_default());
        }

        match segments.first().copied() {
            Some("runtime") => {
                let value = segments
                    .get(1)
                    .and_then(|key| self.context.runtime.get(*key));
                return Ok(match value {
                    Some(v) => value_to_text(v),
                    None => {
                        tracing::warn!(token = %path, "unresolved runtime variable token");
                        String::new()
                    }
                });
            }
            Some("faker") => {
                if let Some(kind) = segments.get(1) {
                    return Ok(faker_value(kind));
                }
            }
            _ => {}
        }

        let key = segments[0];

        if let Some(value) = self.context.static_vars.get(key) {
            return Ok(value_to_text(value));
        }

        if let Some(value) = self.context.dynamic_vars.get(key) {
            if let Value::String(template) = value {
                if template.contains(&format!("{{{{{key}}}}}")) {
                    return Err(ResolverError::CircularReference {
                        key: key.to_string(),
                    });
                }
                return self.resolve_string_at_depth(template, depth + 1);
            }
            return Ok(value_to_text(value));
        }

        // No match: pass the token through literally.
        tracing::warn!(token = %path, "unresolved variable token, passing through literally");
        Ok(format!("{{{{{path}}}}}"))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn faker_value(kind: &str) -> String {
    let mut rng = rand::thread_rng();
    match kind {
        "name" => Name().fake_with_rng(&mut rng),
        "firstName" => FirstName().fake_with_rng(&mut rng),
        "lastName" => LastName().fake_with_rng(&mut rng),
        "email" => FreeEmail().fake_with_rng(&mut rng),
        "phone" => PhoneNumber().fake_with_rng(&mut rng),
        "address" => {
            let street: String = StreetName().fake_with_rng(&mut rng);
            let city: String = CityName().fake_with_rng(&mut rng);
            format!("{street}, {city}")
        }
        "company" => CompanyName().fake_with_rng(&mut rng),
        "username" => Username().fake_with_rng(&mut rng),
        "password" => Password(12..20).fake_with_rng(&mut rng),
        "uuid" => uuid::Uuid::new_v4().to_string(),
        "number" => rng.gen_range(1..1000).to_string(),
        "date" => {
            let days_back = rng.gen_range(0..3650);
            (Utc::now() - ChronoDuration::days(days_back))
                .format("%Y-%m-%d")
                .to_string()
        }
        other => format!("{{{{faker.{other}}}}}"),
    }
}
