//! Reference-counted shader module cache
//!
//! Shaders built from the same program share a single compiled module. Every
//! [`Shader`](crate::Shader) holds the module while it is alive and releases it
//! on cleanup; the device module is freed when the last holder releases it.

use crate::device::{ComputeDevice, DeviceError, DeviceHandle, ModuleHandle};
use std::collections::HashMap;
use std::path::PathBuf;

/// Resolves a shader identifier to its source code
pub trait ShaderLoader {
    fn load(&self, path: &str) -> Result<String, std::io::Error>;
}

impl<F> ShaderLoader for F
where
    F: Fn(&str) -> Result<String, std::io::Error>,
{
    fn load(&self, path: &str) -> Result<String, std::io::Error> {
        self(path)
    }
}

#[derive(Debug)]
struct PooledModule {
    handle: ModuleHandle,
    holds: usize,
}

/// A registry of compiled shader modules keyed by path
pub struct ShaderPool {
    loader: Box<dyn ShaderLoader>,
    modules: HashMap<String, PooledModule>,
}

impl ShaderPool {
    pub fn new(loader: impl ShaderLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            modules: HashMap::new(),
        }
    }

    /// Creates a pool that reads shader files relative to `dir`
    pub fn from_directory(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::new(move |path: &str| std::fs::read_to_string(dir.join(path)))
    }

    /// Returns the module for `path`, compiling it on first use, and takes a hold on it
    pub fn hold(&mut self, device: &mut dyn ComputeDevice, path: &str) -> Result<ModuleHandle, DeviceError> {
        if let Some(module) = self.modules.get_mut(path) {
            module.holds += 1;
            return Ok(module.handle);
        }

        let source = self.loader.load(path).map_err(|source| DeviceError::ShaderSource { path: path.to_string(), source })?;
        let handle = device.compile_shader(path, &source)?;
        tracing::debug!(path, "compiled shader module");

        self.modules.insert(path.to_string(), PooledModule { handle, holds: 1 });
        Ok(handle)
    }

    /// Drops one hold on `path`, freeing the module when no holds remain
    ///
    /// Releasing a path that is not held does nothing.
    pub fn release(&mut self, device: &mut dyn ComputeDevice, path: &str) {
        let Some(module) = self.modules.get_mut(path) else {
            return;
        };

        module.holds = module.holds.saturating_sub(1);
        if module.holds > 0 {
            return;
        }

        if let Some(module) = self.modules.remove(path) {
            let handle = DeviceHandle::Module(module.handle);
            if device.is_valid(handle) {
                device.free(handle);
            }
            tracing::debug!(path, "released shader module");
        }
    }

    /// Number of live holds on `path`
    pub fn hold_count(&self, path: &str) -> usize {
        self.modules.get(path).map_or(0, |module| module.holds)
    }

    /// Number of distinct modules currently compiled
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for ShaderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderPool").field("modules", &self.modules).finish_non_exhaustive()
    }
}
