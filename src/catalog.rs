//! Install-root scanning and the in-memory package catalog.
//!
//! The catalog enumerates immediate subdirectories of the install root,
//! parses and validates each package manifest, and produces an ordered set
//! of immutable [`PackageRecord`]s. Records are replaced, never mutated:
//! a rescan reuses the prior record for unchanged packages (by file
//! fingerprint), parses new or changed ones fresh, and evicts records whose
//! backing directories disappeared. A scan never fails on a broken package;
//! partially written or malformed packages surface as `Invalid` records so
//! the host UI can show them as present-but-unavailable.

use semver::Version;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::gate;
use crate::manifest::{self, ManifestDescriptor, MANIFEST_FILE};

/// Size + mtime stamp used to detect changed files between rescans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileStamp {
    len: u64,
    mtime: Option<SystemTime>,
}

impl FileStamp {
    pub(crate) fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            len: meta.len(),
            mtime: meta.modified().ok(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Fingerprint {
    manifest: Option<FileStamp>,
    entry: Option<FileStamp>,
}

/// Validation outcome of a discovered package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    Valid,
    Invalid { reason: String },
    /// Manifest is well-formed but its host-version range excludes this host.
    Incompatible { min: Option<Version>, max: Option<Version> },
}

/// Load state of a package's binary, tracked per record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loaded,
    Failed { reason: String },
}

/// One discovered package: location, parsed manifest (when parseable),
/// validation status, and load state. Immutable once built.
#[derive(Debug, Clone)]
pub struct PackageRecord {
    /// Install subdirectory name; equals `manifest.key` for valid packages.
    pub key: String,
    pub dir: PathBuf,
    pub manifest: Option<ManifestDescriptor>,
    pub status: ValidationStatus,
    pub load_state: LoadState,
    fingerprint: Fingerprint,
}

impl PackageRecord {
    /// Whether this record may be offered for activation.
    pub fn is_activation_candidate(&self) -> bool {
        matches!(self.status, ValidationStatus::Valid)
    }

    /// Absolute path of the entry binary, for valid records.
    pub fn entry_path(&self) -> Option<PathBuf> {
        self.manifest.as_ref().map(|m| self.dir.join(&m.entry))
    }

    fn invalid(
        key: String,
        dir: PathBuf,
        manifest: Option<ManifestDescriptor>,
        fingerprint: Fingerprint,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            key,
            dir,
            manifest,
            status: ValidationStatus::Invalid {
                reason: reason.into(),
            },
            load_state: LoadState::Unloaded,
            fingerprint,
        }
    }
}

/// The extension catalog over one install root.
///
/// Owned by the host; all dependencies (root, host version) arrive via the
/// constructor. Scans may run on a background worker; the produced records
/// are immutable `Arc` snapshots, safe to hand to the UI thread.
pub struct Catalog {
    root: PathBuf,
    host_version: Version,
    records: BTreeMap<String, Arc<PackageRecord>>,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>, host_version: Version) -> Self {
        Self {
            root: root.into(),
            host_version,
            records: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Scans the install root and returns the resulting snapshot, ordered by
    /// package key. Idempotent: unchanged packages keep their prior record
    /// (validation result and load state included), removed directories are
    /// evicted, new or changed ones parse fresh.
    pub fn scan(&mut self) -> Vec<Arc<PackageRecord>> {
        let mut next: BTreeMap<String, Arc<PackageRecord>> = BTreeMap::new();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), "install root unreadable: {e}");
                self.records = next;
                return Vec::new();
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                warn!(path = %path.display(), "skipping package directory with non-UTF-8 name");
                continue;
            };

            let manifest_stamp = FileStamp::of(&path.join(MANIFEST_FILE));
            if let Some(prior) = self.records.get(&name) {
                if manifest_stamp.is_some()
                    && prior.fingerprint.manifest == manifest_stamp
                    && prior.entry_path().and_then(|p| FileStamp::of(&p)) == prior.fingerprint.entry
                {
                    debug!(key = %name, "package unchanged; keeping prior record");
                    next.insert(name, Arc::clone(prior));
                    continue;
                }
            }

            let record = self.scan_package(name.clone(), path, manifest_stamp);
            if let ValidationStatus::Invalid { reason } = &record.status {
                debug!(key = %name, reason = %reason, "package invalid");
            }
            next.insert(name, Arc::new(record));
        }

        for evicted in self.records.keys().filter(|k| !next.contains_key(*k)) {
            debug!(key = %evicted, "package directory removed; evicting record");
        }

        self.records = next;
        self.snapshot()
    }

    /// Current records, ordered by key.
    pub fn snapshot(&self) -> Vec<Arc<PackageRecord>> {
        self.records.values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Arc<PackageRecord>> {
        self.records.get(key).cloned()
    }

    /// Replaces a record with a copy carrying the given load state. Records
    /// are immutable; state changes produce a fresh record.
    pub fn set_load_state(&mut self, key: &str, state: LoadState) {
        if let Some(record) = self.records.get_mut(key) {
            let mut updated = (**record).clone();
            updated.load_state = state;
            *record = Arc::new(updated);
        }
    }

    fn scan_package(
        &self,
        name: String,
        dir: PathBuf,
        manifest_stamp: Option<FileStamp>,
    ) -> PackageRecord {
        let manifest_path = dir.join(MANIFEST_FILE);
        let no_manifest = Fingerprint {
            manifest: manifest_stamp,
            entry: None,
        };

        let bytes = match fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            // Missing or unreadable manifest also covers packages caught
            // mid-copy; they become Invalid, never a scan failure.
            Err(e) => {
                return PackageRecord::invalid(
                    name,
                    dir,
                    None,
                    no_manifest,
                    format!("manifest unreadable: {e}"),
                )
            }
        };

        let descriptor = match manifest::parse(&bytes) {
            Ok(descriptor) => descriptor,
            Err(e) => return PackageRecord::invalid(name, dir, None, no_manifest, e.to_string()),
        };

        let entry_path = dir.join(&descriptor.entry);
        let fingerprint = Fingerprint {
            manifest: manifest_stamp,
            entry: FileStamp::of(&entry_path),
        };

        if descriptor.key != name {
            let reason = format!(
                "manifest key `{}` does not match directory name `{name}`",
                descriptor.key
            );
            return PackageRecord::invalid(name, dir, Some(descriptor), fingerprint, reason);
        }

        if !entry_path.is_file() {
            let reason = format!("entry binary `{}` not found", descriptor.entry);
            return PackageRecord::invalid(name, dir, Some(descriptor), fingerprint, reason);
        }

        let status = if gate::is_compatible(&descriptor, &self.host_version) {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Incompatible {
                min: descriptor.min_host_version.clone(),
                max: descriptor.max_host_version.clone(),
            }
        };

        PackageRecord {
            key: name,
            dir,
            manifest: Some(descriptor),
            status,
            load_state: LoadState::Unloaded,
            fingerprint,
        }
    }
}
