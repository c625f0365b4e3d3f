//! Per-module symbol tables used for linking and global resolution.

use crate::error::Error;
use crate::kernel::EmulatedKernel;
use crate::sync::{Arc, RwLock, Weak};
use indexmap::IndexMap;
use serde::Serialize;

/// A module variable placed in device global memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GlobalSymbol {
    pub address: u64,
    pub size: u64,
    pub space: ptx::Space,
}

/// Global memory bound to a texture reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TextureBinding {
    pub address: u64,
    /// Extent in elements.
    pub width: u64,
    pub height: u64,
    /// Element type.
    pub ty: ptx::Type,
}

/// Symbols of one loaded module.
///
/// Kernels only hold weak references to each other through this table,
/// and modules reference their imports weakly, so unloading a module drops
/// its kernels.
#[derive(Debug)]
pub struct ModuleSymbols {
    name: String,
    module: Arc<ptx::Module>,
    kernels: RwLock<IndexMap<String, Weak<EmulatedKernel>>>,
    globals: RwLock<IndexMap<String, GlobalSymbol>>,
    textures: RwLock<IndexMap<String, Option<TextureBinding>>>,
    imports: RwLock<Vec<Weak<ModuleSymbols>>>,
}

impl ModuleSymbols {
    #[must_use]
    pub fn new(module: Arc<ptx::Module>) -> Self {
        let textures = module
            .textures
            .iter()
            .map(|texture| (texture.name.clone(), None))
            .collect();
        Self {
            name: module.name.clone(),
            module,
            kernels: RwLock::new(IndexMap::new()),
            globals: RwLock::new(IndexMap::new()),
            textures: RwLock::new(textures),
            imports: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn module(&self) -> &Arc<ptx::Module> {
        &self.module
    }

    pub fn register_kernel(&self, kernel: &Arc<EmulatedKernel>) {
        self.kernels
            .write()
            .insert(kernel.name().to_string(), Arc::downgrade(kernel));
    }

    /// Function of this module.
    #[must_use]
    pub fn kernel(&self, name: &str) -> Option<Arc<EmulatedKernel>> {
        self.kernels.read().get(name).and_then(Weak::upgrade)
    }

    /// Resolve a function by name, looking at imported modules after this one.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<Arc<EmulatedKernel>> {
        if let Some(kernel) = self.kernel(name) {
            return Some(kernel);
        }
        let imports: Vec<Arc<ModuleSymbols>> = self
            .imports
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        imports.iter().find_map(|module| module.kernel(name))
    }

    pub fn define_global(&self, name: &str, symbol: GlobalSymbol) {
        log::trace!(
            "{}: global {name} at {:#x} ({} bytes)",
            self.name,
            symbol.address,
            symbol.size
        );
        self.globals.write().insert(name.to_string(), symbol);
    }

    /// Address of a module variable, looking at imported modules after this one.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<GlobalSymbol> {
        if let Some(symbol) = self.globals.read().get(name) {
            return Some(*symbol);
        }
        self.imports
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|module| module.globals.read().get(name).copied())
    }

    #[must_use]
    pub fn globals(&self) -> Vec<(String, GlobalSymbol)> {
        self.globals
            .read()
            .iter()
            .map(|(name, symbol)| (name.clone(), *symbol))
            .collect()
    }

    /// Make the symbols of `other` visible to this module.
    pub fn import(&self, other: &Arc<ModuleSymbols>) {
        if std::ptr::eq(self, Arc::as_ptr(other)) {
            return;
        }
        let mut imports = self.imports.write();
        imports.retain(|module| module.strong_count() > 0);
        if !imports
            .iter()
            .any(|module| std::ptr::eq(module.as_ptr(), Arc::as_ptr(other)))
        {
            imports.push(Arc::downgrade(other));
        }
    }

    #[must_use]
    pub fn has_texture(&self, name: &str) -> bool {
        self.textures.read().contains_key(name)
    }

    pub fn bind_texture(&self, name: &str, binding: TextureBinding) -> Result<(), Error> {
        let mut textures = self.textures.write();
        let slot = textures.get_mut(name).ok_or_else(|| Error::UnknownTexture {
            module: self.name.clone(),
            texture: name.to_string(),
        })?;
        log::debug!(
            "{}: bind texture {name} to {:#x} ({}x{} {})",
            self.name,
            binding.address,
            binding.width,
            binding.height,
            binding.ty
        );
        *slot = Some(binding);
        Ok(())
    }

    pub fn unbind_texture(&self, name: &str) -> Result<(), Error> {
        let mut textures = self.textures.write();
        let slot = textures.get_mut(name).ok_or_else(|| Error::UnknownTexture {
            module: self.name.clone(),
            texture: name.to_string(),
        })?;
        *slot = None;
        Ok(())
    }

    /// Current binding of a texture reference.
    #[must_use]
    pub fn texture(&self, name: &str) -> Option<TextureBinding> {
        self.textures.read().get(name).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::{GlobalSymbol, ModuleSymbols, TextureBinding};
    use crate::error::Error;
    use crate::sync::Arc;
    use color_eyre::eyre;
    use ptx::{TexGeometry, Type};
    use similar_asserts as diff;

    #[test]
    fn test_imported_globals_resolve_after_local_ones() {
        let a = Arc::new(ModuleSymbols::new(Arc::new(ptx::Module::new("a"))));
        let b = Arc::new(ModuleSymbols::new(Arc::new(ptx::Module::new("b"))));
        let symbol = |address| GlobalSymbol {
            address,
            size: 4,
            space: ptx::Space::Global,
        };
        a.define_global("x", symbol(0x100));
        b.define_global("x", symbol(0x200));
        b.define_global("y", symbol(0x300));
        a.import(&b);
        a.import(&b);
        a.import(&a);
        diff::assert_eq!(have: a.global("x"), want: Some(symbol(0x100)));
        diff::assert_eq!(have: a.global("y"), want: Some(symbol(0x300)));
        diff::assert_eq!(have: b.global("z"), want: None);

        drop(b);
        diff::assert_eq!(have: a.global("y"), want: None);
    }

    #[test]
    fn test_texture_binding() -> eyre::Result<()> {
        let module = ptx::Module::new("m").with_texture("tex", Type::F32, TexGeometry::D1);
        let symbols = ModuleSymbols::new(Arc::new(module));
        assert!(symbols.has_texture("tex"));
        diff::assert_eq!(have: symbols.texture("tex"), want: None);

        let binding = TextureBinding {
            address: 0x1000,
            width: 8,
            height: 1,
            ty: Type::F32,
        };
        symbols.bind_texture("tex", binding)?;
        diff::assert_eq!(have: symbols.texture("tex"), want: Some(binding));
        symbols.unbind_texture("tex")?;
        diff::assert_eq!(have: symbols.texture("tex"), want: None);

        assert!(matches!(
            symbols.bind_texture("missing", binding),
            Err(Error::UnknownTexture { .. })
        ));
        Ok(())
    }
}
