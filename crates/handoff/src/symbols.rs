use std::collections::HashMap;
use std::fs;
use std::path::Path;

use elf::endian::AnyEndian;
use elf::ElfBytes;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Source of symbol addresses.
pub trait Symbols {
    /// Name of the image the symbols come from, used in diagnostics.
    fn image(&self) -> &str;

    /// Absolute address of the first symbol with exactly this name.
    fn lookup(&self, name: &str) -> Option<u64>;
}

/// Symbol table of an ELF image.
///
/// On ARM the low bit of a function symbol marks Thumb code and is not part of the address, so it
/// is cleared before the address is used for a breakpoint.
#[derive(Clone, Debug)]
pub struct ElfSymbols {
    image: String,
    symbols: HashMap<String, u64>,
}

impl ElfSymbols {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::BinaryNotFound(path.to_path_buf()));
        }

        let data = fs::read(path)?;
        Self::parse(path.display().to_string(), &data)
    }

    pub fn parse(image: impl Into<String>, data: &[u8]) -> Result<Self> {
        let image = image.into();
        let file = ElfBytes::<AnyEndian>::minimal_parse(data)?;
        let thumb_interworking = file.ehdr.e_machine == elf::abi::EM_ARM;

        let tables = match file.symbol_table()? {
            Some(tables) => Some(tables),
            None => file.dynamic_symbol_table()?,
        };

        let mut symbols = HashMap::new();
        if let Some((symtab, strtab)) = tables {
            for symbol in symtab.iter() {
                if symbol.st_name == 0 || symbol.is_undefined() {
                    continue;
                }

                let name = strtab.get(symbol.st_name as usize)?;
                let mut address = symbol.st_value;
                if thumb_interworking && symbol.st_symtype() == elf::abi::STT_FUNC {
                    address &= !1;
                }

                // First definition wins
                symbols.entry(name.to_string()).or_insert(address);
            }
        } else {
            warn!(%image, "binary image has no symbol table");
        }

        debug!(%image, symbols = symbols.len(), "loaded symbol table");
        Ok(Self { image, symbols })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl Symbols for ElfSymbols {
    fn image(&self) -> &str {
        &self.image
    }

    fn lookup(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

/// Fixed symbol addresses, for images that are not available locally.
#[derive(Clone, Debug, Default)]
pub struct StaticSymbols {
    image: String,
    symbols: HashMap<String, u64>,
}

impl StaticSymbols {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            symbols: HashMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, address: u64) -> Self {
        self.symbols.entry(name.into()).or_insert(address);
        self
    }
}

impl Symbols for StaticSymbols {
    fn image(&self) -> &str {
        &self.image
    }

    fn lookup(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

/// Resolve a symbol of the ELF image at `binary`.
pub fn resolve(binary: impl AsRef<Path>, symbol: &str) -> Result<u64> {
    let symbols = ElfSymbols::open(binary)?;
    lookup(&symbols, symbol)
}

pub fn lookup(symbols: &(impl Symbols + ?Sized), symbol: &str) -> Result<u64> {
    symbols
        .lookup(symbol)
        .ok_or_else(|| Error::SymbolNotFound {
            image: symbols.image().to_string(),
            symbol: symbol.to_string(),
        })
}

/// A resolved breakpoint symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// Symbol that was asked for.
    pub requested: String,

    /// Symbol that actually resolved. Differs from `requested` when a fallback was used.
    pub name: String,

    pub address: u64,
}

impl Resolved {
    /// Whether a fallback symbol stands in for the requested one.
    pub fn substituted(&self) -> bool {
        self.requested != self.name
    }
}

/// Resolve `primary`, trying each fallback in order when it is missing. A substitution is logged
/// as a warning.
pub fn resolve_with_fallback(
    symbols: &(impl Symbols + ?Sized),
    primary: &str,
    fallbacks: &[String],
) -> Result<Resolved> {
    let candidates = std::iter::once(primary).chain(fallbacks.iter().map(String::as_str));
    for candidate in candidates {
        match lookup(symbols, candidate) {
            Ok(address) => {
                if candidate != primary {
                    warn!(
                        requested = primary,
                        substitute = candidate,
                        address = %format_args!("{address:#x}"),
                        "symbol not found, using fallback"
                    );
                }

                return Ok(Resolved {
                    requested: primary.to_string(),
                    name: candidate.to_string(),
                    address,
                });
            }
            Err(err) => debug!("{err}"),
        }
    }

    Err(Error::SymbolNotFound {
        image: symbols.image().to_string(),
        symbol: primary.to_string(),
    })
}
