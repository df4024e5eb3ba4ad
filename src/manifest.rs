//! Widget package manifest (`manifest.json`) parsing and validation.
//!
//! Required fields are validated in one pass, collecting every error so a
//! broken manifest yields one actionable diagnostic instead of a fail-fast
//! drip. Malformed *optional* fields never abort parsing: the documented
//! default is substituted and a warning logged.

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{FieldError, ParseError};

/// Manifest file name inside every package directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Lowercase kebab-case package keys: `clock`, `cpu-meter`, `rss2-ticker`.
static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").expect("key regex"));

/// A width/height pair used for the widget size constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

pub const DEFAULT_SIZE: Size = Size::new(300, 200);
pub const DEFAULT_MIN_SIZE: Size = Size::new(100, 100);
pub const DEFAULT_MAX_SIZE: Size = Size::new(800, 600);

/// Parsed, validated package metadata.
///
/// `key` uniquely identifies the package and must match both the install
/// subdirectory name (checked by the catalog) and the identity reported by
/// the loaded instance (checked by the lifecycle controller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDescriptor {
    pub key: String,
    pub display_name: String,
    pub version: Version,
    /// File name of the loadable entry binary inside the package directory.
    pub entry: String,
    /// Explicit factory symbol; when absent the resolver consults the
    /// exported factory table.
    pub factory_symbol: Option<String>,
    pub category: String,
    pub has_own_surface: bool,
    pub has_settings: bool,
    pub default_size: Size,
    pub min_size: Size,
    pub max_size: Size,
    /// Inclusive lower host-version bound; open-ended when absent.
    pub min_host_version: Option<Version>,
    /// Inclusive upper host-version bound; open-ended when absent.
    pub max_host_version: Option<Version>,
    pub permissions: Vec<String>,
}

/// Parses and validates manifest bytes.
///
/// # Errors
/// Returns [`ParseError::Syntax`] for non-JSON input, [`ParseError::Invalid`]
/// with every field error found when required fields are missing or
/// malformed.
pub fn parse(bytes: &[u8]) -> Result<ManifestDescriptor, ParseError> {
    let root: Value = serde_json::from_slice(bytes)?;
    let obj = root.as_object().ok_or(ParseError::NotAnObject)?;

    let mut errors: Vec<FieldError> = Vec::new();

    let key = required_string(obj, "key", &mut errors).and_then(|key| {
        if KEY_RE.is_match(&key) {
            Some(key)
        } else {
            errors.push(FieldError {
                field: "key",
                reason: format!("`{key}` is not lowercase kebab-case"),
            });
            None
        }
    });

    let display_name = required_string(obj, "displayName", &mut errors).and_then(|name| {
        if name.trim().is_empty() {
            errors.push(FieldError {
                field: "displayName",
                reason: "must be non-empty".into(),
            });
            None
        } else {
            Some(name)
        }
    });

    let version = required_string(obj, "version", &mut errors).and_then(|raw| {
        match Version::parse(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                errors.push(FieldError {
                    field: "version",
                    reason: format!("`{raw}` is not a semantic version: {e}"),
                });
                None
            }
        }
    });

    let entry = required_string(obj, "entry", &mut errors).and_then(|entry| {
        if entry.trim().is_empty() {
            errors.push(FieldError {
                field: "entry",
                reason: "must be non-empty".into(),
            });
            None
        } else if entry.contains('/') || entry.contains('\\') || entry.contains("..") {
            // The entry is a file name inside the package directory, never a
            // path escaping it.
            errors.push(FieldError {
                field: "entry",
                reason: format!("`{entry}` must be a plain file name inside the package"),
            });
            None
        } else {
            Some(entry)
        }
    });

    if !errors.is_empty() {
        return Err(ParseError::Invalid(errors));
    }

    // Required fields are all present past this point.
    let key = key.unwrap_or_default();

    let descriptor = ManifestDescriptor {
        factory_symbol: optional_string(obj, "factorySymbol", &key),
        category: optional_string(obj, "category", &key)
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "general".to_string()),
        has_own_surface: optional_bool(obj, "hasOwnSurface", false, &key),
        has_settings: optional_bool(obj, "hasSettings", false, &key),
        default_size: optional_size(obj, "defaultSize", DEFAULT_SIZE, &key),
        min_size: optional_size(obj, "minSize", DEFAULT_MIN_SIZE, &key),
        max_size: optional_size(obj, "maxSize", DEFAULT_MAX_SIZE, &key),
        min_host_version: optional_version(obj, "minHostVersion", &key),
        max_host_version: optional_version(obj, "maxHostVersion", &key),
        permissions: optional_permissions(obj, &key),
        key,
        display_name: display_name.unwrap_or_default(),
        version: version.unwrap_or_else(|| Version::new(0, 0, 0)),
        entry: entry.unwrap_or_default(),
    };

    if let (Some(min), Some(max)) = (
        descriptor.min_host_version.as_ref(),
        descriptor.max_host_version.as_ref(),
    ) {
        if min > max {
            warn!(
                key = %descriptor.key,
                %min, %max,
                "minHostVersion exceeds maxHostVersion; no host version can satisfy this manifest"
            );
        }
    }

    Ok(descriptor)
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match obj.get(field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            errors.push(FieldError {
                field,
                reason: format!("expected a string, found {}", json_type(other)),
            });
            None
        }
        None => {
            errors.push(FieldError {
                field,
                reason: "missing".into(),
            });
            None
        }
    }
}

fn optional_string(obj: &serde_json::Map<String, Value>, field: &str, key: &str) -> Option<String> {
    match obj.get(field) {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            warn!(
                key,
                field,
                "expected a string, found {}; ignoring",
                json_type(other)
            );
            None
        }
    }
}

fn optional_bool(obj: &serde_json::Map<String, Value>, field: &str, default: bool, key: &str) -> bool {
    match obj.get(field) {
        None => default,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            warn!(
                key,
                field,
                default,
                "expected a boolean, found {}; using default",
                json_type(other)
            );
            default
        }
    }
}

fn optional_size(obj: &serde_json::Map<String, Value>, field: &str, default: Size, key: &str) -> Size {
    let Some(value) = obj.get(field) else {
        return default;
    };
    match serde_json::from_value::<Size>(value.clone()) {
        Ok(size) if size.width > 0 && size.height > 0 => size,
        Ok(_) => {
            warn!(key, field, "width and height must be positive; using default");
            default
        }
        Err(e) => {
            warn!(key, field, "malformed size ({e}); using default");
            default
        }
    }
}

fn optional_version(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    key: &str,
) -> Option<Version> {
    let raw = optional_string(obj, field, key)?;
    match Version::parse(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(
                key,
                field,
                "`{raw}` is not a semantic version ({e}); treating bound as open-ended"
            );
            None
        }
    }
}

fn optional_permissions(obj: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    match obj.get("permissions") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => {
                    warn!(
                        key,
                        "permissions entry must be a string, found {}; skipping",
                        json_type(other)
                    );
                    None
                }
            })
            .collect(),
        Some(other) => {
            warn!(
                key,
                "permissions must be an array, found {}; ignoring",
                json_type(other)
            );
            Vec::new()
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
