//! Dynamic loading of widget package binaries.
//!
//! Each package loads into its own [`libloading::Library`], one loading
//! context per package, so private dependency conflicts across packages
//! never collide and a package can be unloaded or reloaded without
//! restarting the host. The [`LoadedUnit`] owns the library; every factory
//! handle and live widget resolved from it holds an `Arc` to the unit, so
//! the context is released as a single unit when the last holder drops.
//!
//! Loading fails closed: every failure becomes a [`LoadError`] tagged with
//! the package key and never a host crash.

use libloading::Library;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::PackageRecord;
use crate::contract::{ABI_VERSION_SYMBOL, ALCOVE_ABI_VERSION};
use crate::error::LoadError;

pub(crate) use crate::catalog::FileStamp;

/// One package's loaded binary and loading context.
pub struct LoadedUnit {
    key: String,
    entry_path: PathBuf,
    library: Library,
}

impl LoadedUnit {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entry_path(&self) -> &PathBuf {
        &self.entry_path
    }

    /// Resolves a raw symbol from the unit's library.
    ///
    /// # Safety
    /// `T` must match the actual type of the exported symbol.
    pub(crate) unsafe fn get<T>(
        &self,
        symbol: &[u8],
    ) -> Result<libloading::Symbol<'_, T>, libloading::Error> {
        self.library.get(symbol)
    }
}

impl std::fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("key", &self.key)
            .field("entry_path", &self.entry_path)
            .finish_non_exhaustive()
    }
}

struct CachedUnit {
    unit: Arc<LoadedUnit>,
    stamp: Option<FileStamp>,
}

/// Loads package binaries and caches one unit per package key.
#[derive(Default)]
pub struct Loader {
    units: HashMap<String, CachedUnit>,
}

impl Loader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the record's entry binary, returning the cached unit when the
    /// package is already loaded and its binary unchanged on disk.
    ///
    /// # Errors
    /// Fails closed with a key-tagged [`LoadError`] on a missing binary,
    /// an unloadable library, or an ABI handshake mismatch.
    pub fn load(&mut self, record: &PackageRecord) -> Result<Arc<LoadedUnit>, LoadError> {
        let key = record.key.clone();
        let manifest = record.manifest.as_ref().ok_or(LoadError::Unvalidated {
            key: key.clone(),
        })?;

        let entry_path = record.dir.join(&manifest.entry);
        if !entry_path.is_file() {
            return Err(LoadError::MissingEntry {
                key,
                path: entry_path.display().to_string(),
            });
        }

        let stamp = FileStamp::of(&entry_path);
        if let Some(cached) = self.units.get(&key) {
            if cached.stamp == stamp && stamp.is_some() {
                debug!(%key, "returning cached loaded unit");
                return Ok(Arc::clone(&cached.unit));
            }
            debug!(%key, "entry binary changed on disk; reloading");
        }

        // SAFETY: loading arbitrary third-party code is inherently unsafe;
        // the contract confines what we call to the ABI handshake and the
        // resolved factory symbols.
        let library = unsafe { Library::new(&entry_path) }.map_err(|source| LoadError::Open {
            key: key.clone(),
            source,
        })?;

        check_abi(&key, &library)?;

        info!(%key, path = %entry_path.display(), "loaded widget package");
        let unit = Arc::new(LoadedUnit {
            key: key.clone(),
            entry_path,
            library,
        });
        self.units.insert(
            key,
            CachedUnit {
                unit: Arc::clone(&unit),
                stamp,
            },
        );
        Ok(unit)
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.units.contains_key(key)
    }

    /// Drops the cached unit for `key`. The underlying library is released
    /// once the last outstanding `Arc<LoadedUnit>` goes away; the lifecycle
    /// controller only calls this after all instances have disposed.
    pub fn release(&mut self, key: &str) -> bool {
        if self.units.remove(key).is_some() {
            info!(key, "released loading context");
            true
        } else {
            false
        }
    }

    /// Releases every cached unit, for host shutdown.
    pub fn release_all(&mut self) {
        for key in self.units.keys() {
            debug!(%key, "releasing loading context at shutdown");
        }
        self.units.clear();
    }
}

fn check_abi(key: &str, library: &Library) -> Result<(), LoadError> {
    // SAFETY: the symbol is declared as a u32 static by the widget-side
    // export macro; a package exporting it with another type is malformed
    // and reading 4 bytes from its address is the agreed handshake.
    let version = unsafe {
        let symbol = library
            .get::<*const u32>(ABI_VERSION_SYMBOL)
            .map_err(|_| LoadError::MissingAbiVersion { key: key.to_string() })?;
        **symbol
    };

    if version != ALCOVE_ABI_VERSION {
        return Err(LoadError::AbiMismatch {
            key: key.to_string(),
            expected: ALCOVE_ABI_VERSION,
            actual: version,
        });
    }
    Ok(())
}
