//! The contract between the host and a loaded widget.
//!
//! A widget package exports an ABI version marker and a factory table (or a
//! single declared factory symbol); the host resolves a factory, invokes it
//! with zero arguments, and drives the returned [`Widget`] through its
//! lifecycle hooks. Widget authors normally emit the exports with
//! [`declare_widget!`](crate::declare_widget).

use anyhow::Result;
use std::path::PathBuf;
use uuid::Uuid;

/// ABI revision of the host/widget contract. Bumped on any breaking change
/// to [`Widget`], [`FactoryDescriptor`], or the export symbols.
pub const ALCOVE_ABI_VERSION: u32 = 1;

/// Exported static checked by the loader before any factory symbol is touched.
pub const ABI_VERSION_SYMBOL: &[u8] = b"ALCOVE_ABI_VERSION\0";

/// Exported function returning the package's factory table.
pub const FACTORY_TABLE_SYMBOL: &[u8] = b"alcove_widget_factories\0";

/// How the widget presents itself. Read exactly once by the controller at
/// activation and immutable for the lifetime of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// The widget owns and manages a top-level window.
    OwnWindow,
    /// The widget supplies content the host embeds in its own container.
    HostedView,
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OwnWindow => f.write_str("own-window"),
            Self::HostedView => f.write_str("hosted-view"),
        }
    }
}

/// Opaque handle to a native view the host container embeds. The loader and
/// controller never interpret it; rendering collaborators do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawViewHandle(pub u64);

/// A top-level window fully managed by the widget itself.
pub trait OwnWindowSurface {
    fn show(&mut self);
    fn hide(&mut self);
}

/// Content hosted inside a host-managed container window.
pub trait HostedViewContent {
    fn view_handle(&self) -> RawViewHandle;
}

/// The display surface a widget yields at activation. Selected once,
/// matching the widget's declared [`DisplayMode`], and immutable thereafter.
pub enum DisplaySurface {
    OwnWindow(Box<dyn OwnWindowSurface>),
    HostedView(Box<dyn HostedViewContent>),
}

impl DisplaySurface {
    pub fn mode(&self) -> DisplayMode {
        match self {
            Self::OwnWindow(_) => DisplayMode::OwnWindow,
            Self::HostedView(_) => DisplayMode::HostedView,
        }
    }
}

/// Per-activation context handed to [`Widget::initialize`].
///
/// `settings_dir` is namespaced by the opaque instance id; the widget manages
/// its own durable state under it, uninterpreted by the host.
#[derive(Debug, Clone)]
pub struct WidgetContext {
    pub instance_id: Uuid,
    pub settings_dir: PathBuf,
}

/// The widget instance contract exposed to the lifecycle controller.
///
/// Identity accessors must report the same `key` as the package manifest.
/// `initialize` and `dispose` are each invoked at most once, inside the
/// controller's error boundary. Construction (the factory) and `initialize`
/// are expected to be fast; a slow call stalls the host UI thread and is
/// logged as a contract violation.
pub trait Widget {
    fn key(&self) -> &str;
    fn display_name(&self) -> &str;
    fn version(&self) -> &str;

    fn has_settings(&self) -> bool {
        false
    }

    /// Declared display mode; read once at activation.
    fn display_mode(&self) -> DisplayMode;

    /// One-shot setup hook, called before the surface is requested.
    fn initialize(&mut self, ctx: &WidgetContext) -> Result<()>;

    /// Yields the surface matching [`Widget::display_mode`]. `None` or a
    /// mismatched variant fails the activation.
    fn create_surface(&mut self) -> Option<DisplaySurface>;

    /// One-shot teardown hook. Must tolerate being called after a partially
    /// failed initialization.
    fn dispose(&mut self);
}

/// Zero-argument factory producing a fresh widget instance.
pub type WidgetCreate = fn() -> Box<dyn Widget>;

/// One entry in a package's exported factory table.
#[derive(Debug)]
pub struct FactoryDescriptor {
    pub name: &'static str,
    pub create: WidgetCreate,
}

/// Signature of the exported [`FACTORY_TABLE_SYMBOL`] function.
pub type FactoryTableFn = fn() -> &'static [FactoryDescriptor];

/// Emits the exports a widget package needs: the ABI version marker and the
/// factory table. Packages exporting more than one factory must name the
/// active one in their manifest's `factorySymbol` (or list them all and let
/// the manifest pick), since the resolver refuses to pick arbitrarily.
///
/// ```ignore
/// alcove::declare_widget! {
///     "clock" => ClockWidget::create,
/// }
/// ```
#[macro_export]
macro_rules! declare_widget {
    ($($name:expr => $create:path),+ $(,)?) => {
        #[no_mangle]
        pub static ALCOVE_ABI_VERSION: u32 = $crate::contract::ALCOVE_ABI_VERSION;

        #[no_mangle]
        pub fn alcove_widget_factories() -> &'static [$crate::contract::FactoryDescriptor] {
            static TABLE: &[$crate::contract::FactoryDescriptor] = &[
                $($crate::contract::FactoryDescriptor {
                    name: $name,
                    create: $create,
                }),+
            ];
            TABLE
        }
    };
}
