//! Alcove - widget host loader
//!
//! This library provides the plugin loading and lifecycle subsystem for a
//! desktop widget host: runtime discovery of independently compiled widget
//! packages from an install root, manifest validation, host-version gating,
//! isolated dynamic loading, factory resolution, and deterministic
//! create → initialize → activate → dispose sequencing with full error
//! containment.
//!
//! # Modules
//!
//! - [`manifest`]: Package manifest parsing and validation
//! - [`catalog`]: Install-root scanning and the package catalog
//! - [`loader`]: Dynamic loading, one isolated context per package
//! - [`resolver`]: Factory entry-point resolution
//! - [`contract`]: The host/widget contract and export macro
//! - [`lifecycle`]: Activation state machine and lifecycle controller
//! - [`gate`]: Host-version compatibility gate
//! - [`error`]: Stage-tagged error taxonomy

pub mod catalog;
pub mod contract;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod resolver;

pub use catalog::{Catalog, LoadState, PackageRecord, ValidationStatus};
pub use contract::{DisplayMode, DisplaySurface, Widget, WidgetContext};
pub use error::{ActivationError, ActivationErrorKind, ParseError, Stage};
pub use lifecycle::{Activation, LifecycleController, UnloadOutcome};
pub use manifest::ManifestDescriptor;
pub use resolver::FactoryHandle;
