use elf::endian::AnyEndian;
use elf::ElfBytes;
use handoff::{resolve, ElfSymbols, Symbols};

use crate::common::{self, ElfImage, EM_386};

#[test]
fn builder_produces_parsable_image() {
    let image = ElfImage::arm().function("main", 0x1800_5d79).build();
    let file = ElfBytes::<AnyEndian>::minimal_parse(&image).expect("valid elf");
    assert_eq!(file.ehdr.e_machine, elf::abi::EM_ARM);

    let (symtab, _) = file.symbol_table().expect("symbol table").expect("present");
    assert_eq!(symtab.len(), 2);
}

#[test]
fn thumb_bit_is_cleared_for_functions() -> handoff::Result<()> {
    common::initialize_logger();

    let image = ElfImage::arm()
        .function("main", 0x1800_5d79)
        .object("__libc_fini_array", 0x1800_7001)
        .build();
    let symbols = ElfSymbols::parse("firmware.elf", &image)?;

    assert_eq!(symbols.lookup("main"), Some(0x1800_5d78));
    assert_eq!(symbols.lookup("__libc_fini_array"), Some(0x1800_7001));
    Ok(())
}

#[test]
fn other_machines_keep_addresses() -> handoff::Result<()> {
    let image = ElfImage::new(EM_386).function("main", 0x0804_9001).build();
    let symbols = ElfSymbols::parse("a.out", &image)?;
    assert_eq!(symbols.lookup("main"), Some(0x0804_9001));
    Ok(())
}

#[test]
fn undefined_symbols_are_skipped() -> handoff::Result<()> {
    let image = ElfImage::arm()
        .undefined("_Z3finv")
        .function("main", 0x100)
        .function("main", 0x200)
        .build();
    let symbols = ElfSymbols::parse("firmware.elf", &image)?;

    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols.lookup("_Z3finv"), None);
    assert_eq!(symbols.lookup("main"), Some(0x100));
    Ok(())
}

#[test]
fn resolve_from_file() -> handoff::Result<()> {
    let temp = assert_fs::TempDir::new().expect("temp dir");
    let path = ElfImage::arm()
        .function("main", 0x1800_5d79)
        .write(&temp, "firmware.elf");

    assert_eq!(resolve(&path, "main")?, 0x1800_5d78);
    assert!(matches!(
        resolve(&path, "_Z3finv"),
        Err(handoff::Error::SymbolNotFound { .. })
    ));
    Ok(())
}
