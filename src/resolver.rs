//! Factory entry-point resolution inside a loaded unit.
//!
//! Resolution order: an explicit `factorySymbol` declared in the manifest
//! wins; otherwise the exported factory table is consulted and must contain
//! exactly one entry. Zero candidates and ambiguous candidates are both
//! hard errors; the resolver never silently picks one of several.

use std::sync::Arc;
use tracing::debug;

use crate::contract::{FactoryDescriptor, FactoryTableFn, Widget, WidgetCreate, FACTORY_TABLE_SYMBOL};
use crate::error::ResolveError;
use crate::loader::LoadedUnit;

/// A resolved, invocable widget factory.
///
/// Holds the loaded unit alive for as long as the handle (or anything
/// instantiated through it) exists.
#[derive(Clone)]
pub struct FactoryHandle {
    name: String,
    create: WidgetCreate,
    unit: Option<Arc<LoadedUnit>>,
}

impl FactoryHandle {
    /// Wraps an in-process factory function. Used for built-in widgets and
    /// tests; no dynamic library backs the handle.
    pub fn from_fn(name: impl Into<String>, create: WidgetCreate) -> Self {
        Self {
            name: name.into(),
            create,
            unit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loaded unit backing this factory, absent for in-process handles.
    pub fn unit(&self) -> Option<&Arc<LoadedUnit>> {
        self.unit.as_ref()
    }

    /// Invokes the zero-argument factory. Callers are responsible for the
    /// error boundary; the factory may panic.
    pub(crate) fn instantiate(&self) -> Box<dyn Widget> {
        (self.create)()
    }
}

impl std::fmt::Debug for FactoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryHandle")
            .field("name", &self.name)
            .field("dynamic", &self.unit.is_some())
            .finish()
    }
}

/// Resolves the factory for a loaded unit.
///
/// # Errors
/// [`ResolveError::MissingSymbol`] when a declared symbol cannot be found,
/// [`ResolveError::NoFactories`] / [`ResolveError::Ambiguous`] when the
/// factory table cannot yield a unique undeclared candidate.
pub fn resolve(
    unit: &Arc<LoadedUnit>,
    declared_symbol: Option<&str>,
) -> Result<FactoryHandle, ResolveError> {
    let key = unit.key().to_string();

    if let Some(symbol) = declared_symbol {
        let mut raw = symbol.as_bytes().to_vec();
        raw.push(0);
        // SAFETY: the declared symbol is contractually a `WidgetCreate`
        // exported by the package's own declaration macro.
        let create: WidgetCreate = unsafe {
            let resolved = unit.get::<WidgetCreate>(&raw).map_err(|source| {
                ResolveError::MissingSymbol {
                    key: key.clone(),
                    symbol: symbol.to_string(),
                    source,
                }
            })?;
            *resolved
        };
        debug!(%key, symbol, "resolved declared factory symbol");
        return Ok(FactoryHandle {
            name: symbol.to_string(),
            create,
            unit: Some(Arc::clone(unit)),
        });
    }

    // No declaration: enumerate the exported table, built once per unit by
    // the widget-side macro.
    let table = unsafe {
        let table_fn = unit.get::<FactoryTableFn>(FACTORY_TABLE_SYMBOL).map_err(
            |source| ResolveError::MissingFactoryTable {
                key: key.clone(),
                source,
            },
        )?;
        (*table_fn)()
    };

    let only = select_unique(key, table)?;
    debug!(key = %unit.key(), name = only.name, "resolved unique table factory");
    Ok(FactoryHandle {
        name: only.name.to_string(),
        create: only.create,
        unit: Some(Arc::clone(unit)),
    })
}

/// Picks the single qualifying factory from an exported table. Zero entries
/// and multiple undeclared entries are both errors.
fn select_unique<'t>(
    key: String,
    table: &'t [FactoryDescriptor],
) -> Result<&'t FactoryDescriptor, ResolveError> {
    match table {
        [] => Err(ResolveError::NoFactories { key }),
        [only] => Ok(only),
        many => Err(ResolveError::Ambiguous {
            key,
            candidates: many.iter().map(|d| d.name.to_string()).collect(),
        }),
    }
}
