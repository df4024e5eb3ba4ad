use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};
use semver::Version;
use tempfile::tempdir;
use uuid::Uuid;

use alcove::catalog::Catalog;
use alcove::contract::{
    DisplayMode, DisplaySurface, HostedViewContent, OwnWindowSurface, RawViewHandle, Widget,
    WidgetContext,
};
use alcove::error::{ActivationErrorKind, LoadError, Stage};
use alcove::lifecycle::{LifecycleController, UnloadOutcome};
use alcove::manifest::{self, ManifestDescriptor};
use alcove::resolver::FactoryHandle;

fn clock_manifest() -> ManifestDescriptor {
    manifest::parse(
        br#"{
            "key": "clock",
            "displayName": "Clock",
            "version": "1.0.0",
            "entry": "libclock.so",
            "hasOwnSurface": true
        }"#,
    )
    .unwrap()
}

fn hosted_manifest() -> ManifestDescriptor {
    manifest::parse(
        br#"{
            "key": "ticker",
            "displayName": "Stock Ticker",
            "version": "0.4.2",
            "entry": "libticker.so",
            "defaultSize": {"width": 420, "height": 120}
        }"#,
    )
    .unwrap()
}

fn controller() -> LifecycleController {
    LifecycleController::new(Version::new(1, 2, 0), tempdir().unwrap().keep())
}

struct TestWindow;

impl OwnWindowSurface for TestWindow {
    fn show(&mut self) {}
    fn hide(&mut self) {}
}

struct TestContent;

impl HostedViewContent for TestContent {
    fn view_handle(&self) -> RawViewHandle {
        RawViewHandle(0x7a7a)
    }
}

static CLOCK_DISPOSALS: AtomicUsize = AtomicUsize::new(0);

struct ClockWidget {
    initialized: bool,
}

impl Widget for ClockWidget {
    fn key(&self) -> &str {
        "clock"
    }
    fn display_name(&self) -> &str {
        "Clock"
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn display_mode(&self) -> DisplayMode {
        DisplayMode::OwnWindow
    }
    fn initialize(&mut self, _ctx: &WidgetContext) -> Result<()> {
        self.initialized = true;
        Ok(())
    }
    fn create_surface(&mut self) -> Option<DisplaySurface> {
        Some(DisplaySurface::OwnWindow(Box::new(TestWindow)))
    }
    fn dispose(&mut self) {
        CLOCK_DISPOSALS.fetch_add(1, Ordering::SeqCst);
    }
}

fn make_clock() -> Box<dyn Widget> {
    Box::new(ClockWidget { initialized: false })
}

struct TickerWidget;

impl Widget for TickerWidget {
    fn key(&self) -> &str {
        "ticker"
    }
    fn display_name(&self) -> &str {
        "Stock Ticker"
    }
    fn version(&self) -> &str {
        "0.4.2"
    }
    fn display_mode(&self) -> DisplayMode {
        DisplayMode::HostedView
    }
    fn initialize(&mut self, _ctx: &WidgetContext) -> Result<()> {
        Ok(())
    }
    fn create_surface(&mut self) -> Option<DisplaySurface> {
        Some(DisplaySurface::HostedView(Box::new(TestContent)))
    }
    fn dispose(&mut self) {}
}

fn make_ticker() -> Box<dyn Widget> {
    Box::new(TickerWidget)
}

#[test]
fn activation_reaches_active_and_close_reaches_disposed() {
    let mut controller = controller();
    let manifest = clock_manifest();
    let factory = FactoryHandle::from_fn("clock", make_clock);
    let id = Uuid::new_v4();

    let before = CLOCK_DISPOSALS.load(Ordering::SeqCst);
    let activation = controller
        .activate_with_factory(&manifest, &factory, id)
        .unwrap();
    assert_eq!(activation.mode, DisplayMode::OwnWindow);
    assert!(controller.is_active("clock", id));

    assert!(controller.close("clock", id));
    assert!(!controller.is_active("clock", id));
    assert_eq!(CLOCK_DISPOSALS.load(Ordering::SeqCst), before + 1);
}

#[test]
fn duplicate_instance_id_is_rejected_with_busy() {
    let mut controller = controller();
    let manifest = clock_manifest();
    let factory = FactoryHandle::from_fn("clock", make_clock);
    let id = Uuid::new_v4();

    controller
        .activate_with_factory(&manifest, &factory, id)
        .unwrap();
    let err = controller
        .activate_with_factory(&manifest, &factory, id)
        .unwrap_err();

    assert!(matches!(err.kind, ActivationErrorKind::Busy { .. }));
    // The first activation is untouched.
    assert!(controller.is_active("clock", id));
    assert_eq!(controller.active_count(), 1);
}

#[test]
fn close_is_at_most_once() {
    let mut controller = controller();
    let manifest = clock_manifest();
    let factory = FactoryHandle::from_fn("clock", make_clock);
    let id = Uuid::new_v4();

    controller
        .activate_with_factory(&manifest, &factory, id)
        .unwrap();

    let before = CLOCK_DISPOSALS.load(Ordering::SeqCst);
    assert!(controller.close("clock", id));
    // A user close racing host shutdown must not double-invoke teardown.
    assert!(!controller.close("clock", id));
    controller.shutdown();
    assert_eq!(CLOCK_DISPOSALS.load(Ordering::SeqCst), before + 1);
}

struct PanickingDisposeWidget;

impl Widget for PanickingDisposeWidget {
    fn key(&self) -> &str {
        "clock"
    }
    fn display_name(&self) -> &str {
        "Clock"
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn display_mode(&self) -> DisplayMode {
        DisplayMode::OwnWindow
    }
    fn initialize(&mut self, _ctx: &WidgetContext) -> Result<()> {
        Ok(())
    }
    fn create_surface(&mut self) -> Option<DisplaySurface> {
        Some(DisplaySurface::OwnWindow(Box::new(TestWindow)))
    }
    fn dispose(&mut self) {
        panic!("teardown exploded")
    }
}

fn make_panicking_dispose() -> Box<dyn Widget> {
    Box::new(PanickingDisposeWidget)
}

#[test]
fn panicking_dispose_is_contained() {
    let mut controller = controller();
    let manifest = clock_manifest();
    let id = Uuid::new_v4();

    controller
        .activate_with_factory(
            &manifest,
            &FactoryHandle::from_fn("clock", make_panicking_dispose),
            id,
        )
        .unwrap();

    // The panic stays inside the teardown boundary and the slot frees up.
    assert!(controller.close("clock", id));
    assert!(!controller.is_active("clock", id));
    assert_eq!(controller.active_count(), 0);

    let id2 = Uuid::new_v4();
    controller
        .activate_with_factory(&manifest, &FactoryHandle::from_fn("clock", make_clock), id2)
        .unwrap();
    assert!(controller.is_active("clock", id2));
}

static FAILING_INIT_DISPOSALS: AtomicUsize = AtomicUsize::new(0);

struct FailingInitWidget;

impl Widget for FailingInitWidget {
    fn key(&self) -> &str {
        "clock"
    }
    fn display_name(&self) -> &str {
        "Clock"
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn display_mode(&self) -> DisplayMode {
        DisplayMode::OwnWindow
    }
    fn initialize(&mut self, _ctx: &WidgetContext) -> Result<()> {
        bail!("no timezone database")
    }
    fn create_surface(&mut self) -> Option<DisplaySurface> {
        Some(DisplaySurface::OwnWindow(Box::new(TestWindow)))
    }
    fn dispose(&mut self) {
        FAILING_INIT_DISPOSALS.fetch_add(1, Ordering::SeqCst);
    }
}

fn make_failing_init() -> Box<dyn Widget> {
    Box::new(FailingInitWidget)
}

#[test]
fn failing_init_leaves_no_partial_instance() {
    let mut controller = controller();
    let manifest = clock_manifest();
    let factory = FactoryHandle::from_fn("clock", make_failing_init);

    let err = controller
        .activate_with_factory(&manifest, &factory, Uuid::new_v4())
        .unwrap_err();

    assert_eq!(err.stage, Stage::Initialization);
    assert!(err.to_string().contains("no timezone database"));
    assert_eq!(controller.active_count(), 0);
    // Teardown still ran, once, despite the failed initialization.
    assert_eq!(FAILING_INIT_DISPOSALS.load(Ordering::SeqCst), 1);
}

fn make_panicking() -> Box<dyn Widget> {
    panic!("factory exploded")
}

#[test]
fn panicking_factory_is_contained() {
    let mut controller = controller();
    let manifest = clock_manifest();
    let factory = FactoryHandle::from_fn("clock", make_panicking);

    let err = controller
        .activate_with_factory(&manifest, &factory, Uuid::new_v4())
        .unwrap_err();

    assert_eq!(err.stage, Stage::Instantiation);
    assert!(err.to_string().contains("factory exploded"));
    assert_eq!(controller.active_count(), 0);
}

#[test]
fn identity_mismatch_is_an_instantiation_error() {
    let mut controller = controller();
    // Manifest says `clock`, instance will report `ticker`.
    let manifest = clock_manifest();
    let factory = FactoryHandle::from_fn("ticker", make_ticker);

    let err = controller
        .activate_with_factory(&manifest, &factory, Uuid::new_v4())
        .unwrap_err();

    assert_eq!(err.stage, Stage::Instantiation);
    assert!(err.to_string().contains("ticker"));
}

#[test]
fn hosted_view_is_wrapped_in_a_host_container() {
    let mut controller = controller();
    let manifest = hosted_manifest();
    let factory = FactoryHandle::from_fn("ticker", make_ticker);
    let id = Uuid::new_v4();

    let activation = controller
        .activate_with_factory(&manifest, &factory, id)
        .unwrap();
    assert_eq!(activation.mode, DisplayMode::HostedView);

    let container = controller.hosted_container("ticker", id).unwrap();
    assert_eq!(container.title, "Stock Ticker");
    assert_eq!(container.default_size.width, 420);
    assert_eq!(container.default_size.height, 120);
    assert_eq!(container.min_size.width, 100);
    assert_eq!(container.content().view_handle(), RawViewHandle(0x7a7a));
}

struct NoSurfaceWidget;

impl Widget for NoSurfaceWidget {
    fn key(&self) -> &str {
        "clock"
    }
    fn display_name(&self) -> &str {
        "Clock"
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn display_mode(&self) -> DisplayMode {
        DisplayMode::OwnWindow
    }
    fn initialize(&mut self, _ctx: &WidgetContext) -> Result<()> {
        Ok(())
    }
    fn create_surface(&mut self) -> Option<DisplaySurface> {
        None
    }
    fn dispose(&mut self) {}
}

fn make_no_surface() -> Box<dyn Widget> {
    Box::new(NoSurfaceWidget)
}

struct WrongSurfaceWidget;

impl Widget for WrongSurfaceWidget {
    fn key(&self) -> &str {
        "clock"
    }
    fn display_name(&self) -> &str {
        "Clock"
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn display_mode(&self) -> DisplayMode {
        DisplayMode::OwnWindow
    }
    fn initialize(&mut self, _ctx: &WidgetContext) -> Result<()> {
        Ok(())
    }
    fn create_surface(&mut self) -> Option<DisplaySurface> {
        Some(DisplaySurface::HostedView(Box::new(TestContent)))
    }
    fn dispose(&mut self) {}
}

fn make_wrong_surface() -> Box<dyn Widget> {
    Box::new(WrongSurfaceWidget)
}

#[test]
fn missing_or_mismatched_surface_fails_activation() {
    let mut controller = controller();
    let manifest = clock_manifest();

    let err = controller
        .activate_with_factory(
            &manifest,
            &FactoryHandle::from_fn("clock", make_no_surface),
            Uuid::new_v4(),
        )
        .unwrap_err();
    assert_eq!(err.stage, Stage::SurfaceCreation);

    let err = controller
        .activate_with_factory(
            &manifest,
            &FactoryHandle::from_fn("clock", make_wrong_surface),
            Uuid::new_v4(),
        )
        .unwrap_err();
    assert_eq!(err.stage, Stage::SurfaceCreation);
    assert!(err.to_string().contains("own-window"));
    assert_eq!(controller.active_count(), 0);
}

#[test]
fn unload_is_queued_while_instances_are_live() {
    let mut controller = controller();
    let manifest = clock_manifest();
    let factory = FactoryHandle::from_fn("clock", make_clock);
    let id = Uuid::new_v4();

    controller
        .activate_with_factory(&manifest, &factory, id)
        .unwrap();

    assert_eq!(controller.request_unload("clock"), UnloadOutcome::Queued);
    assert!(controller.close("clock", id));
    // The queued unload drained with the last instance; nothing remains.
    assert_eq!(controller.request_unload("clock"), UnloadOutcome::NotLoaded);
}

#[test]
fn incompatible_package_fails_at_the_gate_before_any_load() {
    let root = tempdir().unwrap();
    let dir = root.path().join("clock");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.json"),
        r#"{
            "key": "clock",
            "displayName": "Clock",
            "version": "1.0.0",
            "entry": "libclock.so",
            "minHostVersion": "1.0.0"
        }"#,
    )
    .unwrap();
    // Deliberately not a loadable library. If the loader were invoked, the
    // error would be a LoadError rather than IncompatibleVersion.
    fs::write(dir.join("libclock.so"), b"garbage").unwrap();

    let mut catalog = Catalog::new(root.path(), Version::parse("0.9.0").unwrap());
    let record = &catalog.scan()[0];

    let mut controller =
        LifecycleController::new(Version::parse("0.9.0").unwrap(), root.path().join(".settings"));
    let err = controller.activate(record, Uuid::new_v4()).unwrap_err();

    assert_eq!(err.stage, Stage::VersionGate);
    assert!(matches!(
        err.kind,
        ActivationErrorKind::IncompatibleVersion { .. }
    ));
    assert!(!controller.is_loaded("clock"));
}

#[test]
fn corrupt_entry_binary_fails_closed_at_the_load_stage() {
    let root = tempdir().unwrap();
    let dir = root.path().join("clock");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.json"),
        r#"{
            "key": "clock",
            "displayName": "Clock",
            "version": "1.0.0",
            "entry": "libclock.so"
        }"#,
    )
    .unwrap();
    fs::write(dir.join("libclock.so"), b"definitely not a shared object").unwrap();

    let mut catalog = Catalog::new(root.path(), Version::new(1, 2, 0));
    let record = &catalog.scan()[0];
    assert!(record.is_activation_candidate());

    let mut controller =
        LifecycleController::new(Version::new(1, 2, 0), root.path().join(".settings"));
    // The bad binary is contained as a stage error, never a crash.
    let err = controller.activate(record, Uuid::new_v4()).unwrap_err();

    assert_eq!(err.key, "clock");
    assert_eq!(err.stage, Stage::Load);
    assert!(matches!(err.kind, ActivationErrorKind::Load(_)));
    assert_eq!(controller.active_count(), 0);
}

/// A real shared object that is loadable but is not a widget package. Paths
/// cover the common Linux multiarch layouts; the test is skipped when none
/// exists.
fn non_widget_library() -> Option<PathBuf> {
    [
        "/lib/x86_64-linux-gnu/libz.so.1",
        "/usr/lib/x86_64-linux-gnu/libz.so.1",
        "/lib/aarch64-linux-gnu/libz.so.1",
        "/usr/lib/aarch64-linux-gnu/libz.so.1",
        "/usr/lib64/libz.so.1",
        "/usr/lib/libz.so.1",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|path| path.is_file())
}

#[test]
fn loadable_library_without_abi_marker_is_rejected() {
    let Some(library) = non_widget_library() else {
        return;
    };

    let root = tempdir().unwrap();
    let dir = root.path().join("clock");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.json"),
        r#"{
            "key": "clock",
            "displayName": "Clock",
            "version": "1.0.0",
            "entry": "libclock.so"
        }"#,
    )
    .unwrap();
    fs::copy(&library, dir.join("libclock.so")).unwrap();

    let mut catalog = Catalog::new(root.path(), Version::new(1, 2, 0));
    let record = &catalog.scan()[0];
    assert!(record.is_activation_candidate());

    let mut controller =
        LifecycleController::new(Version::new(1, 2, 0), root.path().join(".settings"));
    // The library opens fine; the handshake must still reject it because it
    // exports no ABI version marker.
    let err = controller.activate(record, Uuid::new_v4()).unwrap_err();

    assert_eq!(err.key, "clock");
    assert_eq!(err.stage, Stage::Load);
    assert!(matches!(
        err.kind,
        ActivationErrorKind::Load(LoadError::MissingAbiVersion { .. })
    ));
    assert!(!controller.is_loaded("clock"));
    assert_eq!(controller.active_count(), 0);
}

#[test]
fn invalid_record_fails_validation_before_any_load() {
    let root = tempdir().unwrap();
    let dir = root.path().join("clock");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("manifest.json"), "{ not json").unwrap();

    let mut catalog = Catalog::new(root.path(), Version::new(1, 0, 0));
    let record = &catalog.scan()[0];

    let mut controller =
        LifecycleController::new(Version::new(1, 0, 0), root.path().join(".settings"));
    let err = controller.activate(record, Uuid::new_v4()).unwrap_err();

    assert_eq!(err.stage, Stage::Validation);
    assert!(!controller.is_loaded("clock"));
}

#[test]
fn settings_path_is_namespaced_by_instance_id() {
    struct PathRecorder;

    static SAW_NAMESPACED_PATH: AtomicUsize = AtomicUsize::new(0);

    impl Widget for PathRecorder {
        fn key(&self) -> &str {
            "clock"
        }
        fn display_name(&self) -> &str {
            "Clock"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn display_mode(&self) -> DisplayMode {
            DisplayMode::OwnWindow
        }
        fn initialize(&mut self, ctx: &WidgetContext) -> Result<()> {
            let path = ctx.settings_dir.to_string_lossy().into_owned();
            if path.contains(&ctx.instance_id.to_string()) && path.contains("clock") {
                SAW_NAMESPACED_PATH.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
        fn create_surface(&mut self) -> Option<DisplaySurface> {
            Some(DisplaySurface::OwnWindow(Box::new(TestWindow)))
        }
        fn dispose(&mut self) {}
    }

    fn make_recorder() -> Box<dyn Widget> {
        Box::new(PathRecorder)
    }

    let mut controller = controller();
    controller
        .activate_with_factory(
            &clock_manifest(),
            &FactoryHandle::from_fn("clock", make_recorder),
            Uuid::new_v4(),
        )
        .unwrap();
    assert_eq!(SAW_NAMESPACED_PATH.load(Ordering::SeqCst), 1);
}
