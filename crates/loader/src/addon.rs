//! Addons and the catalog of addons available to a server.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use strata_orm::ModelDef;
use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::manifest::Manifest;

/// Name of the manifest file at the root of an addon directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// A module: a manifest, model contributions and data files.
pub trait Addon: Send + Sync {
    fn manifest(&self) -> &Manifest;

    /// Model contributions, in the order they apply.
    fn models(&self) -> Vec<ModelDef> {
        Vec::new()
    }

    fn has_file(&self, path: &str) -> bool;

    /// Contents of the data file at `path`, relative to the addon root.
    fn read_file(&self, path: &str) -> Result<String, LoadError>;

    /// Translation file of `lang` (`i18n/<lang>.csv`), if the addon ships one.
    fn translation(&self, lang: &str) -> Result<Option<String>, LoadError> {
        let path = format!("i18n/{lang}.csv");
        if self.has_file(&path) {
            self.read_file(&path).map(Some)
        } else {
            Ok(None)
        }
    }
}

type ModelsFn = Arc<dyn Fn() -> Vec<ModelDef> + Send + Sync>;

/// Addon compiled into the binary, with its data files embedded.
#[derive(Clone)]
pub struct StaticAddon {
    manifest: Manifest,
    models: Option<ModelsFn>,
    files: BTreeMap<String, String>,
}

impl fmt::Debug for StaticAddon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAddon")
            .field("name", &self.manifest.name)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticAddon {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            models: None,
            files: BTreeMap::new(),
        }
    }

    pub fn from_manifest_str(raw: &str) -> Result<Self, LoadError> {
        Ok(Self::new(Manifest::parse(raw)?))
    }

    pub fn with_models(mut self, models: impl Fn() -> Vec<ModelDef> + Send + Sync + 'static) -> Self {
        self.models = Some(Arc::new(models));
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    pub fn with_files(mut self, files: &[(&str, &str)]) -> Self {
        for (path, contents) in files {
            self.files.insert((*path).to_string(), (*contents).to_string());
        }
        self
    }
}

impl Addon for StaticAddon {
    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn models(&self) -> Vec<ModelDef> {
        self.models.as_ref().map(|f| f()).unwrap_or_default()
    }

    fn has_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn read_file(&self, path: &str) -> Result<String, LoadError> {
        self.files.get(path).cloned().ok_or_else(|| {
            LoadError::data_file(&self.manifest.name, path, None, "no such file in the addon")
        })
    }
}

/// The `base` addon.
pub fn base_addon() -> Result<StaticAddon, LoadError> {
    Ok(StaticAddon::from_manifest_str(strata_base::MANIFEST)?
        .with_models(strata_base::model_defs)
        .with_files(strata_base::DATA_FILES))
}

/// Data-only addon read from a directory holding a `manifest.toml`.
#[derive(Debug, Clone)]
pub struct DirAddon {
    root: PathBuf,
    manifest: Manifest,
}

impl DirAddon {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let root = root.into();
        let manifest_path = root.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path).map_err(|source| LoadError::Io {
            path: manifest_path.display().to_string(),
            source,
        })?;
        let manifest = Manifest::parse(&raw)?;
        let dir_name = root.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if dir_name != manifest.name {
            return Err(LoadError::Manifest {
                module: manifest.name,
                message: format!("addon directory is named '{dir_name}'"),
            });
        }
        Ok(Self { root, manifest })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, LoadError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(LoadError::data_file(
                &self.manifest.name,
                path,
                None,
                "data paths must stay inside the addon",
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl Addon for DirAddon {
    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn has_file(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn read_file(&self, path: &str) -> Result<String, LoadError> {
        let full = self.resolve(path)?;
        std::fs::read_to_string(&full).map_err(|source| LoadError::Io {
            path: full.display().to_string(),
            source,
        })
    }
}

/// Every addon a server can install, by name.
#[derive(Clone, Default)]
pub struct AddonCatalog {
    addons: BTreeMap<String, Arc<dyn Addon>>,
}

impl fmt::Debug for AddonCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.addons.keys()).finish()
    }
}

impl AddonCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog holding the `base` addon.
    pub fn with_base() -> Result<Self, LoadError> {
        let mut catalog = Self::new();
        catalog.add(base_addon()?);
        Ok(catalog)
    }

    /// Add `addon`, replacing any addon of the same name.
    pub fn add(&mut self, addon: impl Addon + 'static) -> &mut Self {
        let name = addon.manifest().name.clone();
        if self.addons.insert(name.clone(), Arc::new(addon)).is_some() {
            warn!(module = %name, "addon replaced in catalog");
        }
        self
    }

    /// Add every addon directory found directly under `dir`.
    pub fn scan(&mut self, dir: &Path) -> Result<usize, LoadError> {
        let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let mut found = 0;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.join(MANIFEST_FILE).is_file())
            .collect();
        paths.sort();
        for path in paths {
            let addon = DirAddon::open(&path)?;
            debug!(module = %addon.manifest().name, path = %path.display(), "addon found");
            self.add(addon);
            found += 1;
        }
        info!(path = %dir.display(), found, "addons path scanned");
        Ok(found)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Addon>> {
        self.addons.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<dyn Addon>, LoadError> {
        self.get(name).ok_or_else(|| LoadError::UnknownModule(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.addons.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.addons.keys().map(String::as_str)
    }

    pub fn manifests(&self) -> impl Iterator<Item = &Manifest> {
        self.addons.values().map(|a| a.manifest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_addon_ships_its_data_files() {
        let base = base_addon().unwrap();
        for path in &base.manifest().data {
            assert!(base.has_file(path), "{path} missing");
        }
        assert!(!base.models().is_empty());
        assert_eq!(base.translation("fr_FR").unwrap(), None);
    }

    #[test]
    fn static_addons_expose_translations() {
        let addon = StaticAddon::from_manifest_str(r#"name = "m""#)
            .unwrap()
            .with_file("i18n/fr_FR.csv", "id,field,value\n");
        assert!(addon.translation("fr_FR").unwrap().is_some());
        assert!(addon.read_file("data/none.xml").is_err());
    }

    #[test]
    fn directory_addons_stay_inside_their_root() {
        let dir = std::env::temp_dir().join(format!("strata-addon-{}", std::process::id()));
        let root = dir.join("demo_addon");
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::write(root.join(MANIFEST_FILE), "name = \"demo_addon\"\ndata = [\"data/a.csv\"]\n").unwrap();
        std::fs::write(root.join("data/a.csv"), "id,name\n").unwrap();

        let mut catalog = AddonCatalog::new();
        assert_eq!(catalog.scan(&dir).unwrap(), 1);
        let addon = catalog.require("demo_addon").unwrap();
        assert_eq!(addon.read_file("data/a.csv").unwrap(), "id,name\n");
        assert!(addon.read_file("../demo_addon/manifest.toml").is_err());
        assert!(matches!(catalog.require("nope"), Err(LoadError::UnknownModule(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
