use semver::Version;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A single failed field inside a manifest, with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Manifest parse failure.
///
/// `Invalid` carries every field error found in one pass so the catalog can
/// surface actionable diagnostics instead of one-error-at-a-time churn.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("manifest is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("manifest root must be a JSON object")]
    NotAnObject,

    #[error("invalid manifest: {}", format_field_errors(.0))]
    Invalid(Vec<FieldError>),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Dynamic load failure, always tagged with the package key. Loading fails
/// closed: none of these ever propagate as a panic into the host.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("package `{key}` has no validated manifest")]
    Unvalidated { key: String },

    #[error("package `{key}` entry binary missing: {path}")]
    MissingEntry { key: String, path: String },

    #[error("package `{key}` failed to load: {source}")]
    Open {
        key: String,
        #[source]
        source: libloading::Error,
    },

    #[error("package `{key}` does not export an ABI version marker")]
    MissingAbiVersion { key: String },

    #[error("package `{key}` built against ABI v{actual}, host expects v{expected}")]
    AbiMismatch { key: String, expected: u32, actual: u32 },
}

impl LoadError {
    pub fn key(&self) -> &str {
        match self {
            Self::Unvalidated { key }
            | Self::MissingEntry { key, .. }
            | Self::Open { key, .. }
            | Self::MissingAbiVersion { key }
            | Self::AbiMismatch { key, .. } => key,
        }
    }
}

/// Factory entry-point resolution failure.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("package `{key}` declares factory symbol `{symbol}` but it cannot be resolved: {source}")]
    MissingSymbol {
        key: String,
        symbol: String,
        #[source]
        source: libloading::Error,
    },

    #[error("package `{key}` does not export a widget factory table")]
    MissingFactoryTable {
        key: String,
        #[source]
        source: libloading::Error,
    },

    #[error("package `{key}` exports no widget factories")]
    NoFactories { key: String },

    // Silent first-pick is a latent correctness bug; the manifest must
    // disambiguate via an explicit factory symbol.
    #[error("package `{key}` exports {} factories ({}) and declares none", .candidates.len(), .candidates.join(", "))]
    Ambiguous { key: String, candidates: Vec<String> },
}

/// The lifecycle stage at which an activation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    VersionGate,
    Load,
    Resolve,
    Instantiation,
    Initialization,
    SurfaceCreation,
    Disposal,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::VersionGate => "version gate",
            Self::Load => "load",
            Self::Resolve => "resolve",
            Self::Instantiation => "instantiation",
            Self::Initialization => "initialization",
            Self::SurfaceCreation => "surface creation",
            Self::Disposal => "disposal",
        };
        f.write_str(name)
    }
}

/// Cause of a failed activation stage.
#[derive(Debug, Error)]
pub enum ActivationErrorKind {
    #[error("{0}")]
    Validation(String),

    #[error("host {host} outside declared range [{}, {}]",
        .min.as_ref().map_or_else(|| "*".to_string(), ToString::to_string),
        .max.as_ref().map_or_else(|| "*".to_string(), ToString::to_string))]
    IncompatibleVersion {
        host: Version,
        min: Option<Version>,
        max: Option<Version>,
    },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("{0}")]
    Instantiation(String),

    #[error("{0}")]
    Initialization(String),

    #[error("{0}")]
    SurfaceCreation(String),

    #[error("{0}")]
    Disposal(String),

    #[error("instance {instance_id} is already active")]
    Busy { instance_id: Uuid },
}

/// Structured activation failure: which package, at which stage, and why.
///
/// `Failed` is terminal for the activation that produced it; the controller
/// never auto-retries. A fresh activation is a new caller-initiated attempt.
#[derive(Debug, Error)]
#[error("widget `{key}` failed at {stage}: {kind}")]
pub struct ActivationError {
    pub key: String,
    pub stage: Stage,
    #[source]
    pub kind: ActivationErrorKind,
}

impl ActivationError {
    pub fn new(key: impl Into<String>, stage: Stage, kind: ActivationErrorKind) -> Self {
        Self {
            key: key.into(),
            stage,
            kind,
        }
    }
}
