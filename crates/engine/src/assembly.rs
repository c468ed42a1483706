//! User-assembly bundles.
//!
//! The dynamic loader and bytecode verifier live outside the engine; what
//! arrives here is the bundle's modules (opaque bytes plus their declared
//! references), the framework version it targets, and the typed model
//! descriptor the loader derived. The engine validates the bundle shape,
//! compares per-module content hashes against the installed bundle, and
//! swaps the model descriptor atomically. The version GUID changes exactly
//! once per effective change; an update with zero diff is a no-op.
//!
//! On disk a bundle is a zstd-compressed tar archive of its modules plus a
//! JSON manifest, stored in the system directory.

use helio_core::error::{AssemblyKind, Error, Result};
use helio_core::model::ModelDescriptor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Newest framework version this engine executes.
pub const SUPPORTED_FRAMEWORK_VERSION: u32 = 2;

/// One module inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyModule {
    /// Module name, unique within the bundle.
    pub name: String,
    /// Names of modules this one references.
    pub references: Vec<String>,
    /// The module's code, opaque to the engine.
    pub code: Vec<u8>,
}

/// A complete user-assembly bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyBundle {
    /// Framework version the bundle targets.
    pub framework_version: u32,
    /// Modules, by name.
    pub modules: Vec<AssemblyModule>,
    /// The model descriptor the loader derived from the bundle.
    pub model: ModelDescriptor,
}

impl AssemblyBundle {
    /// An empty bundle around a model.
    pub fn for_model(model: ModelDescriptor) -> Self {
        AssemblyBundle {
            framework_version: SUPPORTED_FRAMEWORK_VERSION,
            modules: Vec::new(),
            model,
        }
    }

    /// Structural validation: framework bound, unique names, resolvable
    /// references, valid model.
    pub fn validate(&self) -> Result<()> {
        if self.framework_version > SUPPORTED_FRAMEWORK_VERSION {
            return Err(Error::Assembly(AssemblyKind::FrameworkTooNew(format!(
                "bundle targets {} (supported {})",
                self.framework_version, SUPPORTED_FRAMEWORK_VERSION
            ))));
        }
        for (i, module) in self.modules.iter().enumerate() {
            if module.name.is_empty() {
                return Err(Error::Assembly(AssemblyKind::InvalidAssembly(
                    "empty module name".to_string(),
                )));
            }
            if self.modules[..i].iter().any(|m| m.name == module.name) {
                return Err(Error::Assembly(AssemblyKind::DuplicateName(
                    module.name.clone(),
                )));
            }
        }
        for module in &self.modules {
            for reference in &module.references {
                if !self.modules.iter().any(|m| &m.name == reference) {
                    return Err(Error::Assembly(AssemblyKind::MissingReference(
                        reference.clone(),
                    )));
                }
            }
        }
        self.model.validate()
    }

    /// Per-module content hashes, by name.
    pub fn hashes(&self) -> BTreeMap<String, u64> {
        self.modules
            .iter()
            .map(|m| (m.name.clone(), xxh3_64(&m.code)))
            .collect()
    }
}

/// The installed bundle plus its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledBundle {
    /// The bundle contents.
    pub bundle: AssemblyBundle,
    /// Changes exactly once per effective update.
    pub version_guid: Uuid,
}

/// Holds the installed bundle and performs atomic swaps.
pub struct AssemblyRegistry {
    installed: RwLock<Arc<InstalledBundle>>,
}

/// What an update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    /// Hashes matched the installed bundle; nothing changed.
    Unchanged,
    /// The bundle was installed under a fresh version GUID.
    Installed,
}

impl AssemblyRegistry {
    /// Start with `bundle` installed.
    pub fn new(bundle: AssemblyBundle) -> Result<Self> {
        bundle.validate()?;
        Ok(AssemblyRegistry {
            installed: RwLock::new(Arc::new(InstalledBundle {
                bundle,
                version_guid: Uuid::new_v4(),
            })),
        })
    }

    /// The installed bundle. Callers pin the `Arc`; an update never
    /// invalidates a pinned bundle.
    pub fn installed(&self) -> Arc<InstalledBundle> {
        Arc::clone(&self.installed.read())
    }

    /// The installed model descriptor.
    pub fn model(&self) -> Arc<ModelDescriptor> {
        Arc::new(self.installed().bundle.model.clone())
    }

    /// The current version GUID.
    pub fn version_guid(&self) -> Uuid {
        self.installed.read().version_guid
    }

    /// Restore a persisted identity after reload; the constructor minted a
    /// fresh GUID that must not survive a plain restart.
    pub fn restore_guid(&self, guid: Uuid) {
        let mut installed = self.installed.write();
        *installed = Arc::new(InstalledBundle {
            bundle: installed.bundle.clone(),
            version_guid: guid,
        });
    }

    /// Apply an update. Idempotent: identical content (hashes and model)
    /// leaves the installed GUID untouched.
    pub fn update(&self, bundle: AssemblyBundle) -> Result<UpdateOutcome> {
        bundle.validate()?;
        let mut installed = self.installed.write();
        let unchanged = installed.bundle.hashes() == bundle.hashes()
            && installed.bundle.model.classes == bundle.model.classes
            && installed.bundle.model.indexes == bundle.model.indexes
            && installed.bundle.model.inverse_refs == bundle.model.inverse_refs;
        if unchanged {
            return Ok(UpdateOutcome::Unchanged);
        }
        let guid = Uuid::new_v4();
        info!(%guid, modules = bundle.modules.len(), "installing assembly bundle");
        *installed = Arc::new(InstalledBundle {
            bundle,
            version_guid: guid,
        });
        Ok(UpdateOutcome::Installed)
    }
}

/// Manifest file name inside the archive.
const MANIFEST_NAME: &str = "manifest.json";

/// Pack a bundle into a zstd-compressed tar archive.
pub fn pack_bundle(bundle: &InstalledBundle) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Manifest<'a> {
        framework_version: u32,
        version_guid: Uuid,
        model: &'a ModelDescriptor,
        references: BTreeMap<&'a str, &'a [String]>,
    }
    let manifest = serde_json::to_vec_pretty(&Manifest {
        framework_version: bundle.bundle.framework_version,
        version_guid: bundle.version_guid,
        model: &bundle.bundle.model,
        references: bundle
            .bundle
            .modules
            .iter()
            .map(|m| (m.name.as_str(), m.references.as_slice()))
            .collect(),
    })
    .map_err(|e| Error::Serialization(e.to_string()))?;

    let mut tar = tar::Builder::new(Vec::new());
    append_file(&mut tar, MANIFEST_NAME, &manifest)?;
    for module in &bundle.bundle.modules {
        append_file(&mut tar, &module.name, &module.code)?;
    }
    let raw = tar
        .into_inner()
        .map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))?;
    zstd::encode_all(&raw[..], 3).map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))
}

fn append_file(tar: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, name, data)
        .map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))
}

/// Unpack a zstd-compressed tar archive into a bundle.
pub fn unpack_bundle(archive: &[u8]) -> Result<InstalledBundle> {
    #[derive(Deserialize)]
    struct Manifest {
        framework_version: u32,
        version_guid: Uuid,
        model: ModelDescriptor,
        references: BTreeMap<String, Vec<String>>,
    }

    let raw = zstd::decode_all(archive)
        .map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))?;
    let mut tar = tar::Archive::new(&raw[..]);
    let mut manifest: Option<Manifest> = None;
    let mut modules: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for entry in tar
        .entries()
        .map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))?
    {
        let mut entry =
            entry.map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))?;
        let name = entry
            .path()
            .ok()
            .and_then(|p| p.to_str().map(String::from))
            .ok_or_else(|| {
                Error::Assembly(AssemblyKind::InvalidAssembly("unnamed entry".to_string()))
            })?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))?;
        if name == MANIFEST_NAME {
            manifest = Some(
                serde_json::from_slice(&data)
                    .map_err(|e| Error::Assembly(AssemblyKind::InvalidAssembly(e.to_string())))?,
            );
        } else {
            modules.insert(name, data);
        }
    }
    let manifest = manifest.ok_or_else(|| {
        Error::Assembly(AssemblyKind::InvalidAssembly("missing manifest".to_string()))
    })?;
    let bundle = AssemblyBundle {
        framework_version: manifest.framework_version,
        modules: modules
            .into_iter()
            .map(|(name, code)| AssemblyModule {
                references: manifest.references.get(&name).cloned().unwrap_or_default(),
                name,
                code,
            })
            .collect(),
        model: manifest.model,
    };
    bundle.validate()?;
    Ok(InstalledBundle {
        bundle,
        version_guid: manifest.version_guid,
    })
}

/// Persist the installed bundle into the system directory.
pub fn save_bundle(system_dir: &Path, bundle: &InstalledBundle) -> Result<()> {
    std::fs::create_dir_all(system_dir)?;
    let archive = pack_bundle(bundle)?;
    let tmp = system_dir.join(".bundle.tmp");
    let final_path = system_dir.join("bundle.tar.zst");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&archive)?;
        file.sync_all()?;
    }
    std::fs::rename(tmp, final_path)?;
    Ok(())
}

/// Load the persisted bundle, if present.
pub fn load_bundle(system_dir: &Path) -> Result<Option<InstalledBundle>> {
    let path = system_dir.join("bundle.tar.zst");
    if !path.exists() {
        return Ok(None);
    }
    let archive = std::fs::read(path)?;
    Ok(Some(unpack_bundle(&archive)?))
}
