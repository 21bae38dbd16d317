// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns placed, patched [`crate::section::Section`]s into a flat ROM
//! image, and re-resolves the holes the linker deferred until that
//! image existed (`CHECKSUM` and friends).
//!
//! Bank windows are sized per layout: `end_addr - start_addr` bytes,
//! times the number of banks needed to cover every bank actually used
//! (rounded up to a power of two, then reduced by `bank_min`), matching
//! the original assembler's bank-window arithmetic bit for bit.

use std::collections::HashMap;
use std::path::Path;

use crate::assembler::Assembler;
use crate::builtin::BuiltinContext;
use crate::error::{AssemblerError, Result};
use crate::eval;

pub fn build_rom(asm: &mut Assembler) -> Result<Vec<u8>> {
    let mut max_bank: HashMap<String, i64> = HashMap::new();
    for section in &asm.sections {
        if let Some(bank) = section.bank {
            let entry = max_bank.entry(section.layout.clone()).or_insert(0);
            *entry = (*entry).max(bank);
        }
    }

    let mut rom_size: i64 = 0;
    for (name, layout) in &asm.layouts {
        let Some(rom_location) = layout.rom_location else { continue };
        let mut layout_size = layout.end_addr - layout.start_addr;
        if layout.banked {
            let highest = *max_bank.get(name).unwrap_or(&0);
            layout_size *= (1i64 << bit_length(highest)) - layout.bank_min;
        }
        rom_size = rom_size.max(rom_location + layout_size);
    }

    let mut rom = vec![0u8; rom_size.max(0) as usize];
    for idx in 0..asm.sections.len() {
        let layout = match asm.layouts.get(&asm.sections[idx].layout) {
            Some(layout) => layout.clone(),
            None => continue,
        };
        let Some(rom_location) = layout.rom_location else { continue };
        let offset = rom_offset(&layout, rom_location, &asm.sections[idx]) as usize;
        let data = &asm.sections[idx].data;
        rom[offset..offset + data.len()].copy_from_slice(data);
    }

    asm.rom = Some(rom);

    let pending = std::mem::take(&mut asm.post_build_link);
    for (section_idx, hole_offset, size, node) in pending {
        let layout = match asm.layouts.get(&asm.sections[section_idx].layout) {
            Some(layout) => layout.clone(),
            None => continue,
        };
        let Some(rom_location) = layout.rom_location else { continue };
        let base = asm.sections[section_idx].base_address;
        let rom_offset = rom_offset(&layout, rom_location, &asm.sections[section_idx]) as usize + hole_offset;

        asm.set_linking_section(Some(section_idx));
        let resolved = eval::resolve(asm, Some(base + hole_offset as i64), node)?;
        asm.set_linking_section(None);
        let node = resolved.into_node();
        if !node.is_number() {
            return Err(AssemblerError::at(&node.token, "Failed to link, symbol not found?"));
        }
        let value = node.token.as_number().unwrap_or(0);
        match size {
            1 => {
                if !(-128..=255).contains(&value) {
                    return Err(AssemblerError::at(&node.token, "Value out of range"));
                }
                asm.rom.as_mut().unwrap()[rom_offset] = value as u8;
            }
            2 => {
                if !(0..=0xFFFF).contains(&value) {
                    return Err(AssemblerError::at(&node.token, "Value out of range"));
                }
                let bytes = asm.rom.as_mut().unwrap();
                bytes[rom_offset] = (value & 0xFF) as u8;
                bytes[rom_offset + 1] = ((value >> 8) & 0xFF) as u8;
            }
            other => unreachable!("post-build holes are only ever 1 or 2 bytes wide, got {other}"),
        }
    }

    Ok(asm.rom.clone().unwrap())
}

fn rom_offset(layout: &crate::layout::Layout, rom_location: i64, section: &crate::section::Section) -> i64 {
    let mut offset = rom_location + section.base_address - layout.start_addr;
    if layout.banked {
        let bank = section.bank.unwrap_or(0);
        offset += (layout.end_addr - layout.start_addr) * (bank - layout.bank_min);
    }
    offset
}

fn bit_length(n: i64) -> u32 {
    if n <= 0 {
        0
    } else {
        64 - n.leading_zeros()
    }
}

/// Writes one `"bank:address label"` line per label, sorted by name for
/// reproducible output.
pub fn save_symbols(asm: &Assembler, path: &Path) -> Result<()> {
    let mut names: Vec<&String> = asm.labels.keys().collect();
    names.sort();

    let mut out = String::new();
    for name in names {
        let address = asm.label_address(name).unwrap_or(0);
        let bank = asm.label_bank(name).flatten().unwrap_or(0);
        out.push_str(&format!("{bank:02x}:{address:04x} {name}\n"));
    }
    std::fs::write(path, out).map_err(|e| AssemblerError::bare(format!("Failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(source: &str) -> Assembler {
        let mut asm = Assembler::new();
        asm.process_code(source, "test").unwrap();
        asm
    }

    #[test]
    fn places_a_fixed_section_at_its_rom_offset() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[$10] { db $AB, $CD }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        let rom = build_rom(&mut asm).unwrap();
        assert_eq!(&rom[0x10..0x12], &[0xAB, 0xCD]);
    }

    #[test]
    fn banked_section_lands_in_its_own_window() {
        let mut asm = build(
            "#LAYOUT ROMX[$4000,$8000], AT[$4000], BANKED[1,3]\n#SECTION \"A\", ROMX[$4000], BANK[1] { db 1 }\n#SECTION \"B\", ROMX[$4000], BANK[2] { db 2 }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        let rom = build_rom(&mut asm).unwrap();
        assert_eq!(rom[0x4000], 1);
        assert_eq!(rom[0x8000], 2);
    }

    #[test]
    fn checksum_hole_resolves_after_rom_exists() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { db $01, $02\ndb CHECKSUM() }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        let rom = build_rom(&mut asm).unwrap();
        assert_eq!(rom[2], 0x03);
    }

    #[test]
    fn symbol_file_lists_bank_and_address() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { label: db 0 }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        build_rom(&mut asm).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sym");
        save_symbols(&asm, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "00:0000 label\n");
    }
}
