//! ELF symbol table.
//!
//! The engine only ever needs data symbols by name (the DRTM descriptor), so
//! this is a flat name to address map filled from the ELF `.symtab`.

use anyhow::{Context as _, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct SymbolManager {
    symbols: HashMap<String, u64>,
}

impl SymbolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load symbols from an ELF file.
    pub fn load_elf(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read ELF {}", path.display()))?;
        let added = self
            .load_elf_bytes(&data)
            .with_context(|| format!("Failed to parse ELF {}", path.display()))?;
        log::info!("Loaded {added} symbols from {}", path.display());
        Ok(())
    }

    /// Load symbols from an in-memory ELF image. Returns how many were added.
    pub fn load_elf_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let obj = object::File::parse(data)?;
        let mut added = 0;
        for symbol in obj.symbols() {
            if symbol.is_undefined()
                || matches!(symbol.kind(), SymbolKind::Section | SymbolKind::File)
            {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            self.symbols.insert(name.to_string(), symbol.address());
            added += 1;
        }
        Ok(added)
    }

    /// Add or override a single symbol.
    pub fn insert(&mut self, name: impl Into<String>, address: u64) {
        self.symbols.insert(name.into(), address);
    }

    /// Lookup a symbol address by name.
    pub fn lookup_symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.symbols.iter().map(|(name, &address)| (name.as_str(), address))
    }
}
