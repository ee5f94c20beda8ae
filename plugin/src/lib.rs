//! Dynamic plug-in loading for shader and geometry modules.
//!
//! Shaders ship as precompiled dynamic libraries exposing
//! `create_<name>` / `declare_<name>` entry points. Modules are linked
//! once and cached; the renderer resolves entry points through
//! [Plugin::invoke0]. Loading is Rust-to-Rust dynamic linking built with
//! the same toolchain on both sides.

use fxhash::FxHashMap;
use libloading::Library;
use log::{debug, error};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::{error, fmt, io};

/// Prefix of the object factory entry point.
pub const CREATE_PREFIX: &str = "create_";
/// Prefix of the parameter declaration entry point.
pub const DECLARE_PREFIX: &str = "declare_";

#[derive(Debug)]
pub enum Error {
    Load(String),
    MissingSymbol(String),
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Load(what) => write!(f, "failed to load plug-in: {}", what),
            Error::MissingSymbol(name) => write!(f, "missing plug-in symbol: {}", name),
            Error::Io(e) => write!(f, "plug-in I/O error: {}", e),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = ::std::result::Result<T, Error>;

/// A linked plug-in module.
pub struct Plugin {
    name: String,
    lib: Library,
}

impl Plugin {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves `symbol` as a zero-argument factory and invokes it.
    ///
    /// The caller picks the return type; the plug-in must have been
    /// compiled against the same interface crate.
    pub unsafe fn invoke0<R>(&self, symbol: &str) -> Result<R> {
        let sym = self
            .lib
            .get::<unsafe extern "Rust" fn() -> R>(symbol.as_bytes())
            .map_err(|_| Error::MissingSymbol(symbol.to_owned()))?;
        Ok(sym())
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        unsafe { self.lib.get::<*const ()>(symbol.as_bytes()).is_ok() }
    }
}

/// Links and caches plug-in modules by name.
pub struct PluginSystem {
    search_paths: Vec<PathBuf>,
    linked: Mutex<FxHashMap<String, Arc<Plugin>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

impl PluginSystem {
    pub fn new() -> PluginSystem {
        PluginSystem {
            search_paths: Vec::new(),
            linked: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.push(path);
    }

    /// Links a module by name, reusing an already linked one.
    pub fn link(&self, module: &str) -> Result<Arc<Plugin>> {
        if let Some(p) = lock(&self.linked).get(module) {
            return Ok(p.clone());
        }
        let filename = dylib_filename(module);
        let mut last_err = None;
        for dir in self.search_paths.iter() {
            let path = dir.join(&filename);
            if !path.exists() {
                continue;
            }
            match unsafe { Library::new(&path) } {
                Ok(lib) => {
                    debug!("linked plug-in module {} from {:?}", module, path);
                    let plugin = Arc::new(Plugin {
                        name: module.to_owned(),
                        lib,
                    });
                    lock(&self.linked).insert(module.to_owned(), plugin.clone());
                    return Ok(plugin);
                }
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        // fall back to the platform loader's own search path
        match unsafe { Library::new(&filename) } {
            Ok(lib) => {
                let plugin = Arc::new(Plugin {
                    name: module.to_owned(),
                    lib,
                });
                lock(&self.linked).insert(module.to_owned(), plugin.clone());
                Ok(plugin)
            }
            Err(e) => {
                let msg = last_err.unwrap_or_else(|| e.to_string());
                error!("cannot link plug-in module {}: {}", module, msg);
                Err(Error::Load(msg))
            }
        }
    }

    /// Finds an already-linked module that exports `symbol`.
    pub fn find_symbol(&self, symbol: &str) -> Option<Arc<Plugin>> {
        lock(&self.linked)
            .values()
            .find(|p| p.has_symbol(symbol))
            .cloned()
    }
}

impl Default for PluginSystem {
    fn default() -> PluginSystem {
        PluginSystem::new()
    }
}

fn dylib_filename(module: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        format!("{}.dll", module)
    }
    #[cfg(target_os = "macos")]
    {
        format!("lib{}.dylib", module)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        format!("lib{}.so", module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linking_unknown_module_fails() {
        let sys = PluginSystem::new();
        assert!(sys.link("no_such_module_xyz").is_err());
    }

    #[test]
    fn dylib_filename_matches_platform() {
        let name = dylib_filename("phong");
        assert!(name.contains("phong"));
    }
}
