//! Lifecycle orchestration: create → initialize → activate → dispose.
//!
//! The [`LifecycleController`] owns every live widget instance and drives
//! the activation state machine
//! `Discovered → Validated → Loaded → Instantiated → Initialized → Active
//! → Disposing → Disposed`, with terminal `Failed` reachable from any
//! non-terminal state. Every extension call (factory, initialize, dispose)
//! runs inside an error boundary: panics and hook errors are caught,
//! logged with the package key, and converted into a structured
//! [`ActivationError`]; nothing from extension code unwinds into host
//! control flow.
//!
//! All lifecycle transitions and surface creation happen on the host UI
//! thread by contract; the controller is deliberately not `Send`.

use semver::Version;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{PackageRecord, ValidationStatus};
use crate::contract::{
    DisplayMode, DisplaySurface, HostedViewContent, OwnWindowSurface, Widget, WidgetContext,
};
use crate::error::{ActivationError, ActivationErrorKind, Stage};
use crate::gate;
use crate::loader::{LoadedUnit, Loader};
use crate::manifest::{ManifestDescriptor, Size};
use crate::resolver::{self, FactoryHandle};

/// Hook and factory calls slower than this log a contract-violation warning.
const DEFAULT_SLOW_CALL: Duration = Duration::from_millis(250);

/// Activation state machine, mirrored in transition logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Discovered,
    Validated,
    Loaded,
    Instantiated,
    Initialized,
    Active,
    Disposing,
    Disposed,
    Failed,
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discovered => "discovered",
            Self::Validated => "validated",
            Self::Loaded => "loaded",
            Self::Instantiated => "instantiated",
            Self::Initialized => "initialized",
            Self::Active => "active",
            Self::Disposing => "disposing",
            Self::Disposed => "disposed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Host-managed container wrapping a hosted-view widget's content, carrying
/// the manifest's size constraints for the embedding layer.
pub struct HostContainer {
    pub title: String,
    pub default_size: Size,
    pub min_size: Size,
    pub max_size: Size,
    content: Box<dyn HostedViewContent>,
}

impl HostContainer {
    fn new(manifest: &ManifestDescriptor, content: Box<dyn HostedViewContent>) -> Self {
        Self {
            title: manifest.display_name.clone(),
            default_size: manifest.default_size,
            min_size: manifest.min_size,
            max_size: manifest.max_size,
            content,
        }
    }

    pub fn content(&self) -> &dyn HostedViewContent {
        &*self.content
    }
}

enum ActiveSurface {
    /// Display ownership was transferred to the widget's own window.
    OwnWindow(#[allow(dead_code)] Box<dyn OwnWindowSurface>),
    Hosted(HostContainer),
}

struct ActiveWidget {
    // Drop order matters: surface and widget code live inside the loaded
    // library, so both must drop before the unit handle.
    surface: ActiveSurface,
    widget: Box<dyn Widget>,
    #[allow(dead_code)] // Held to keep the library loaded
    unit: Option<Arc<LoadedUnit>>,
    disposed: bool,
}

/// Successful activation summary returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub instance_id: Uuid,
    pub mode: DisplayMode,
}

/// Outcome of an unload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The loading context was released immediately.
    Released,
    /// Live instances remain; the unload runs after the last one disposes.
    Queued,
    /// Nothing was loaded under that key.
    NotLoaded,
}

/// Orchestrates widget activations for one host.
///
/// Dependencies arrive via the constructor: the host version for the
/// compatibility gate and the root under which per-instance settings paths
/// are namespaced. There is no ambient registry.
pub struct LifecycleController {
    host_version: Version,
    settings_root: PathBuf,
    loader: Loader,
    active: HashMap<(String, Uuid), ActiveWidget>,
    live_counts: HashMap<String, usize>,
    pending_unload: HashSet<String>,
    slow_call: Duration,
}

impl LifecycleController {
    pub fn new(host_version: Version, settings_root: impl Into<PathBuf>) -> Self {
        Self {
            host_version,
            settings_root: settings_root.into(),
            loader: Loader::new(),
            active: HashMap::new(),
            live_counts: HashMap::new(),
            pending_unload: HashSet::new(),
            slow_call: DEFAULT_SLOW_CALL,
        }
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Adjusts the soft threshold for slow factory/hook warnings.
    pub fn set_slow_call_threshold(&mut self, threshold: Duration) {
        self.slow_call = threshold;
    }

    /// Runs a full activation for a discovered record: validation, version
    /// gate, dynamic load, factory resolution, then instantiation through
    /// to `Active`.
    ///
    /// # Errors
    /// A stage-tagged [`ActivationError`]. `Failed` is terminal for this
    /// attempt; the controller never retries on its own.
    pub fn activate(
        &mut self,
        record: &PackageRecord,
        instance_id: Uuid,
    ) -> Result<Activation, ActivationError> {
        let key = record.key.clone();
        debug!(%key, %instance_id, state = %ActivationState::Discovered, "activation requested");

        let manifest = match (&record.status, record.manifest.as_ref()) {
            (ValidationStatus::Valid, Some(manifest)) => manifest,
            (ValidationStatus::Invalid { reason }, _) => {
                return Err(self.fail(
                    &key,
                    Stage::Validation,
                    ActivationErrorKind::Validation(reason.clone()),
                ));
            }
            (ValidationStatus::Incompatible { min, max }, _) => {
                return Err(self.fail(
                    &key,
                    Stage::VersionGate,
                    ActivationErrorKind::IncompatibleVersion {
                        host: self.host_version.clone(),
                        min: min.clone(),
                        max: max.clone(),
                    },
                ));
            }
            (ValidationStatus::Valid, None) => {
                return Err(self.fail(
                    &key,
                    Stage::Validation,
                    ActivationErrorKind::Validation("record has no parsed manifest".into()),
                ));
            }
        };
        debug!(%key, state = %ActivationState::Validated, "manifest valid");

        // Gate before any load work; an incompatible package never pays
        // load cost.
        if let Err((stage, kind)) = gate::check(manifest, &self.host_version) {
            return Err(self.fail(&key, stage, kind));
        }

        if self.active.contains_key(&(key.clone(), instance_id)) {
            return Err(self.fail(
                &key,
                Stage::Instantiation,
                ActivationErrorKind::Busy { instance_id },
            ));
        }

        let unit = self
            .loader
            .load(record)
            .map_err(|e| self.fail(&key, Stage::Load, e.into()))?;
        debug!(%key, state = %ActivationState::Loaded, "unit loaded");

        let factory = resolver::resolve(&unit, manifest.factory_symbol.as_deref())
            .map_err(|e| self.fail(&key, Stage::Resolve, e.into()))?;

        self.run_instance_stages(manifest, &factory, instance_id)
    }

    /// Activates an already-resolved factory against a manifest, skipping
    /// discovery, gate, and load. Entry point for built-in widgets and for
    /// tests driving the instance stages with in-process factories.
    pub fn activate_with_factory(
        &mut self,
        manifest: &ManifestDescriptor,
        factory: &FactoryHandle,
        instance_id: Uuid,
    ) -> Result<Activation, ActivationError> {
        self.run_instance_stages(manifest, factory, instance_id)
    }

    fn run_instance_stages(
        &mut self,
        manifest: &ManifestDescriptor,
        factory: &FactoryHandle,
        instance_id: Uuid,
    ) -> Result<Activation, ActivationError> {
        let key = manifest.key.clone();

        if self.active.contains_key(&(key.clone(), instance_id)) {
            return Err(self.fail(
                &key,
                Stage::Instantiation,
                ActivationErrorKind::Busy { instance_id },
            ));
        }

        // Instantiation: zero-argument factory, expected fast and
        // side-effect-free beyond construction.
        let mut widget = match self.timed(&key, "factory", || {
            contain(|| factory.instantiate())
        }) {
            Ok(widget) => widget,
            Err(panic_msg) => {
                return Err(self.fail(
                    &key,
                    Stage::Instantiation,
                    ActivationErrorKind::Instantiation(format!("factory panicked: {panic_msg}")),
                ));
            }
        };

        if widget.key() != manifest.key {
            // Partial instance discarded; it never entered the active set.
            let reported = widget.key().to_string();
            drop(widget);
            return Err(self.fail(
                &key,
                Stage::Instantiation,
                ActivationErrorKind::Instantiation(format!(
                    "instance reports identity `{reported}`, manifest declares `{key}`"
                )),
            ));
        }
        debug!(%key, state = %ActivationState::Instantiated, "instance created");

        // Initialization: invoked exactly once, inside the error boundary.
        let ctx = WidgetContext {
            instance_id,
            settings_dir: self
                .settings_root
                .join(&key)
                .join(instance_id.to_string()),
        };
        let init_result = self.timed(&key, "initialize", || {
            contain(|| widget.initialize(&ctx))
        });
        match init_result {
            Ok(Ok(())) => {}
            Ok(Err(hook_err)) => {
                self.discard(&key, widget);
                return Err(self.fail(
                    &key,
                    Stage::Initialization,
                    ActivationErrorKind::Initialization(format!("{hook_err:#}")),
                ));
            }
            Err(panic_msg) => {
                self.discard(&key, widget);
                return Err(self.fail(
                    &key,
                    Stage::Initialization,
                    ActivationErrorKind::Initialization(format!(
                        "initialize panicked: {panic_msg}"
                    )),
                ));
            }
        }
        debug!(%key, state = %ActivationState::Initialized, "instance initialized");

        // Display-mode negotiation: the flag is read exactly once and is
        // immutable for the rest of the activation.
        let mode = widget.display_mode();
        let declared_own = manifest.has_own_surface;
        if declared_own != (mode == DisplayMode::OwnWindow) {
            warn!(
                %key,
                manifest_own_surface = declared_own,
                reported_mode = %mode,
                "manifest capability flag disagrees with instance display mode"
            );
        }

        let surface = match contain(|| widget.create_surface()) {
            Ok(surface) => surface,
            Err(panic_msg) => {
                self.discard(&key, widget);
                return Err(self.fail(
                    &key,
                    Stage::SurfaceCreation,
                    ActivationErrorKind::SurfaceCreation(format!(
                        "surface creation panicked: {panic_msg}"
                    )),
                ));
            }
        };

        let active_surface = match (mode, surface) {
            (_, None) => {
                self.discard(&key, widget);
                return Err(self.fail(
                    &key,
                    Stage::SurfaceCreation,
                    ActivationErrorKind::SurfaceCreation("instance yielded no surface".into()),
                ));
            }
            (DisplayMode::OwnWindow, Some(DisplaySurface::OwnWindow(mut window))) => {
                // Display ownership transfers to the widget's own window.
                window.show();
                ActiveSurface::OwnWindow(window)
            }
            (DisplayMode::HostedView, Some(DisplaySurface::HostedView(content))) => {
                ActiveSurface::Hosted(HostContainer::new(manifest, content))
            }
            (declared, Some(actual)) => {
                let reason = format!(
                    "declared {declared} but yielded a {} surface",
                    actual.mode()
                );
                self.discard(&key, widget);
                return Err(self.fail(
                    &key,
                    Stage::SurfaceCreation,
                    ActivationErrorKind::SurfaceCreation(reason),
                ));
            }
        };

        self.pending_unload.remove(&key);
        self.active.insert(
            (key.clone(), instance_id),
            ActiveWidget {
                surface: active_surface,
                widget,
                unit: factory.unit().cloned(),
                disposed: false,
            },
        );
        *self.live_counts.entry(key.clone()).or_insert(0) += 1;
        info!(%key, %instance_id, %mode, state = %ActivationState::Active, "widget active");

        Ok(Activation { instance_id, mode })
    }

    /// Closes one instance: teardown inside the error boundary, at most
    /// once. Returns false when the instance is not active (already closed
    /// or never activated), in which case no hook runs.
    pub fn close(&mut self, key: &str, instance_id: Uuid) -> bool {
        let Some(instance) = self.active.remove(&(key.to_string(), instance_id)) else {
            debug!(key, %instance_id, "close requested for inactive instance");
            return false;
        };
        info!(key, %instance_id, state = %ActivationState::Disposing, "closing widget");
        self.dispose_instance(key, instance);
        self.finish_instance(key);
        true
    }

    /// Disposes every live instance and releases all loading contexts.
    /// Called on host shutdown; safe to call more than once.
    pub fn shutdown(&mut self) {
        let keys: Vec<(String, Uuid)> = self.active.keys().cloned().collect();
        for (key, instance_id) in keys {
            if let Some(instance) = self.active.remove(&(key.clone(), instance_id)) {
                info!(%key, %instance_id, "disposing at shutdown");
                self.dispose_instance(&key, instance);
            }
        }
        self.live_counts.clear();
        self.pending_unload.clear();
        self.loader.release_all();
    }

    /// Requests that a package's loading context be released. Runs
    /// immediately when no instance is live; otherwise queued until the
    /// last instance disposes.
    pub fn request_unload(&mut self, key: &str) -> UnloadOutcome {
        if self.live_counts.get(key).copied().unwrap_or(0) > 0 {
            info!(key, "unload queued until last instance disposes");
            self.pending_unload.insert(key.to_string());
            return UnloadOutcome::Queued;
        }
        if self.loader.release(key) {
            UnloadOutcome::Released
        } else {
            UnloadOutcome::NotLoaded
        }
    }

    pub fn is_active(&self, key: &str, instance_id: Uuid) -> bool {
        self.active.contains_key(&(key.to_string(), instance_id))
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.loader.is_loaded(key)
    }

    /// The host-managed container for a hosted-view instance, if that is
    /// how it activated.
    pub fn hosted_container(&self, key: &str, instance_id: Uuid) -> Option<&HostContainer> {
        match &self.active.get(&(key.to_string(), instance_id))?.surface {
            ActiveSurface::Hosted(container) => Some(container),
            ActiveSurface::OwnWindow(_) => None,
        }
    }

    fn dispose_instance(&self, key: &str, mut instance: ActiveWidget) {
        if instance.disposed {
            return;
        }
        instance.disposed = true;

        let started = Instant::now();
        let outcome = contain(|| instance.widget.dispose());
        let elapsed = started.elapsed();
        if elapsed > self.slow_call {
            warn!(key, ?elapsed, "dispose exceeded the soft deadline");
        }
        if let Err(panic_msg) = outcome {
            let err = ActivationError::new(
                key,
                Stage::Disposal,
                ActivationErrorKind::Disposal(format!("dispose panicked: {panic_msg}")),
            );
            error!(key, "{err} (contained)");
        }
        debug!(key, state = %ActivationState::Disposed, "instance disposed");
        // `instance` drops here: surface and widget first, then the unit
        // handle, keeping the library alive until extension objects are gone.
    }

    fn finish_instance(&mut self, key: &str) {
        let remaining = match self.live_counts.get_mut(key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.live_counts.remove(key);
            if self.pending_unload.remove(key) {
                self.loader.release(key);
            }
        }
    }

    /// Best-effort teardown for an instance that failed before reaching the
    /// active set. Dispose must tolerate a partially failed initialization.
    fn discard(&self, key: &str, mut widget: Box<dyn Widget>) {
        if let Err(panic_msg) = contain(|| widget.dispose()) {
            let err = ActivationError::new(
                key,
                Stage::Disposal,
                ActivationErrorKind::Disposal(format!(
                    "dispose of failed instance panicked: {panic_msg}"
                )),
            );
            error!(key, "{err} (contained)");
        }
    }

    fn fail(&self, key: &str, stage: Stage, kind: ActivationErrorKind) -> ActivationError {
        let err = ActivationError::new(key, stage, kind);
        warn!(key, %stage, state = %ActivationState::Failed, "{err}");
        err
    }

    fn timed<R>(&self, key: &str, what: &str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        if elapsed > self.slow_call {
            // Soft contract-violation signal; the loader does not preempt
            // slow extension code.
            warn!(key, what, ?elapsed, "extension call exceeded the soft deadline");
        }
        result
    }
}

/// Error boundary for extension calls: converts a panic into its message.
fn contain<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
