// This module writes generated kernels into an AArch64 ELF relocatable object using the object
// crate's writer. Each kernel becomes a global function symbol in a shared .text section, which
// lets standard tools such as objdump disassemble JIT output for inspection. It is only used
// for debugging: the kernels themselves are executed straight from their mapped buffers.

//! ELF object output for generated kernels.

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

use super::error::{JitError, JitResult};

/// Build an ELF object containing one function symbol per `(name, words)` pair.
pub fn write_elf(kernels: &[(&str, &[u32])]) -> JitResult<Vec<u8>> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);

    for (name, words) in kernels {
        if words.is_empty() {
            return Err(JitError::bad_parameter(format!("kernel {name} has no code")));
        }
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let offset = obj.append_section_data(text, &bytes, 4);
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: bytes.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        log::debug!("object: {name} at .text+{offset:#x}, {} words", words.len());
    }

    obj.write().map_err(|e| JitError::Object { reason: e.to_string() })
}
