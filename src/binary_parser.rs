//! Binary introspection used by C1's `find_section`: locates named metadata
//! regions (well-known symbols or sections) in the target's loaded
//! executable/shared libraries.
//!
//! Grounded directly on
//! `examples/benfred-py-spy/src/binary_parser.rs::parse_binary`, which uses
//! `goblin` to dispatch over ELF/Mach-O/PE. That function returns an entire
//! symbol table keyed by name plus the BSS region; this module keeps the
//! same dispatch structure but collects a merged symbols+sections map,
//! since spec §4.1 needs to look up metadata regions by name regardless of
//! whether the target publishes them as a symbol or a section.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use goblin::error::Error as GoblinError;
use goblin::Object;

pub struct BinaryInfo {
    pub sections: HashMap<String, u64>,
}

/// Parses `filename` and returns every named symbol/section address it can
/// find. `find_section` (see `src/memory.rs`) looks up by name in here.
pub fn parse_binary(filename: &str) -> Result<BinaryInfo, GoblinError> {
    let mut fd = File::open(Path::new(filename))?;
    let mut buffer = Vec::new();
    fd.read_to_end(&mut buffer)?;

    let mut sections = HashMap::new();

    match Object::parse(&buffer)? {
        Object::Elf(elf) => {
            for sym in elf.syms.iter() {
                if sym.st_value == 0 {
                    continue;
                }
                if let Some(name) = elf.strtab.get_at(sym.st_name) {
                    if !name.is_empty() {
                        sections.insert(name.to_string(), sym.st_value);
                    }
                }
            }
            for header in elf.section_headers.iter() {
                if let Some(name) = elf.shdr_strtab.get_at(header.sh_name) {
                    if !name.is_empty() {
                        sections.insert(name.to_string(), header.sh_addr);
                    }
                }
            }
        }
        Object::Mach(goblin::mach::Mach::Binary(macho)) => {
            parse_mach(&macho, &mut sections)?;
        }
        Object::Mach(goblin::mach::Mach::Fat(fat)) => {
            let arch = fat
                .iter_arches()
                .find_map(|a| a.ok().filter(|a| a.is_64()))
                .ok_or_else(|| GoblinError::Malformed("no 64 bit arch in FAT archive".into()))?;
            let bytes = &buffer[arch.offset as usize..][..arch.size as usize];
            parse_mach(&goblin::mach::MachO::parse(bytes, 0)?, &mut sections)?;
        }
        Object::PE(pe) => {
            for export in pe.exports {
                if let Some(name) = export.name {
                    sections.insert(name.to_string(), export.rva as u64);
                }
            }
            for section in pe.sections.iter() {
                let name = String::from_utf8_lossy(&section.name)
                    .trim_end_matches('\0')
                    .to_string();
                if !name.is_empty() {
                    sections.insert(name, section.virtual_address as u64);
                }
            }
        }
        _ => return Err(GoblinError::Malformed("unhandled binary type".into())),
    }

    Ok(BinaryInfo { sections })
}

fn parse_mach(
    macho: &goblin::mach::MachO,
    sections: &mut HashMap<String, u64>,
) -> Result<(), GoblinError> {
    for segment in macho.segments.iter() {
        for (section, _) in segment.sections()? {
            if let Ok(name) = section.name() {
                sections.insert(name.to_string(), section.addr);
            }
        }
    }
    if let Some(syms) = &macho.symbols {
        for symbol in syms.iter() {
            let (name, value) = symbol?;
            if value.n_value == 0 {
                continue;
            }
            let name = name.strip_prefix('_').unwrap_or(name);
            sections.insert(name.to_string(), value.n_value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_error() {
        assert!(parse_binary("/nonexistent/path/to/binary").is_err());
    }
}
