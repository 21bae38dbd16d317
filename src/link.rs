// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The linker: turns unresolved [`Section`]s into placed, patched
//! ones.
//!
//! Three passes, matching `main.py`'s `link`: fixed sections first (so
//! a later floating allocation never collides with one the user pinned
//! to an explicit address), then floating sections by first fit, then
//! every hole and assertion is resolved against final addresses.
//! A hole whose expression needs ROM bytes (`CHECKSUM`) is stashed on
//! `Assembler::post_build_link` for [`crate::rom::build_rom`] to patch
//! after the ROM buffer exists.

use crate::allocator::SpaceAllocator;
use crate::assembler::Assembler;
use crate::ast::AstNode;
use crate::error::{AssemblerError, Result};
use crate::eval::{self, Resolution};
use crate::token::Token;

pub fn link(asm: &mut Assembler, print_free_space: bool) -> Result<()> {
    let mut sa = SpaceAllocator::new(asm.layouts().clone());

    for idx in 0..asm.sections.len() {
        let (layout, base, len, bank, token) = {
            let s = &asm.sections[idx];
            (s.layout.clone(), s.base_address, s.data.len() as i64, s.bank, s.name_token.clone())
        };
        if base > -1 {
            let placed_bank = sa
                .allocate_fixed(&layout, base, len, bank)
                .map_err(|e| AssemblerError::at(&token, e.message))?;
            asm.sections[idx].bank = placed_bank;
        }
    }
    for idx in 0..asm.sections.len() {
        let (layout, base, len, bank, token) = {
            let s = &asm.sections[idx];
            (s.layout.clone(), s.base_address, s.data.len() as i64, s.bank, s.name_token.clone())
        };
        if base < 0 {
            let (placed_bank, addr) = sa
                .allocate(&layout, len, bank)
                .map_err(|e| AssemblerError::at(&token, e.message))?;
            asm.sections[idx].bank = placed_bank;
            asm.sections[idx].base_address = addr;
        }
    }
    asm.allocation_done = true;

    for idx in 0..asm.sections.len() {
        resolve_section(asm, idx)?;
    }

    if print_free_space {
        sa.dump_free_space();
    }
    Ok(())
}

fn resolve_section(asm: &mut Assembler, idx: usize) -> Result<()> {
    asm.set_linking_section(Some(idx));
    let base = asm.sections[idx].base_address;

    let asserts = std::mem::take(&mut asm.sections[idx].asserts);
    for (offset, expr, message) in asserts {
        let resolved = eval::resolve(asm, Some(base + offset as i64), expr)?;
        let node = resolved.into_node();
        if !node.is_number() {
            return Err(from_expression(&node, "Assertion failure (symbol not found?)"));
        }
        if node.token.as_number() == Some(0) {
            return Err(from_expression(&node, &format!("Assertion failure: {message}")));
        }
    }

    let holes: Vec<(usize, u8, AstNode)> =
        std::mem::take(&mut asm.sections[idx].holes).into_iter().map(|(o, (s, n))| (o, s, n)).collect();
    for (offset, size, expr) in holes {
        let resolution = eval::resolve(asm, Some(base + offset as i64), expr)?;
        match resolution {
            Resolution::DeferToPostBuild(node) => {
                asm.post_build_link.push((idx, offset, size, node));
            }
            Resolution::Resolved(node) | Resolution::Pending(node) => {
                write_hole(asm, idx, offset, size, &node)?;
            }
        }
    }
    asm.set_linking_section(None);
    Ok(())
}

/// Writes a resolved hole's value into `section.data`, little-endian,
/// after an emission-width range check (§8: size 1 -> `[-128, 255]`,
/// size 2 -> `[0, 65535]`).
pub(crate) fn write_hole(asm: &mut Assembler, section_idx: usize, offset: usize, size: u8, node: &AstNode) -> Result<()> {
    if !node.is_number() {
        return Err(from_expression(node, "Failed to link, symbol not found?"));
    }
    let value = node.token.as_number().unwrap_or(0);
    match size {
        1 => {
            if !(-128..=255).contains(&value) {
                return Err(AssemblerError::at(&node.token, "Value out of range"));
            }
            asm.sections[section_idx].data[offset] = value as u8;
        }
        2 => {
            if !(0..=0xFFFF).contains(&value) {
                return Err(AssemblerError::at(&node.token, "Value out of range"));
            }
            asm.sections[section_idx].data[offset] = (value & 0xFF) as u8;
            asm.sections[section_idx].data[offset + 1] = ((value >> 8) & 0xFF) as u8;
        }
        other => unreachable!("section holes are only ever 1 or 2 bytes wide, got {other}"),
    }
    Ok(())
}

/// §7's "most local token" heuristic: collects every token in the
/// still-unresolved expression and blames the one whose source file is
/// rarest among them.
fn from_expression(node: &AstNode, message: &str) -> AssemblerError {
    let mut tokens: Vec<Token> = Vec::new();
    collect_tokens(node, &mut tokens);
    AssemblerError::from_tokens(&tokens, message)
}

fn collect_tokens(node: &AstNode, out: &mut Vec<Token>) {
    out.push(node.token.clone());
    if let Some(left) = &node.left {
        collect_tokens(left, out);
    }
    if let Some(right) = &node.right {
        collect_tokens(right, out);
    }
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
    fn fixed_and_floating_sections_get_addresses() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { db $12, $34 }\n",
        );
        link(&mut asm, false).unwrap();
        assert_eq!(asm.sections[0].base_address, 0);
        assert_eq!(asm.sections[0].data, vec![0x12, 0x34]);
    }

    #[test]
    fn label_hole_resolves_to_its_own_address() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { dw label\nlabel: }\n",
        );
        link(&mut asm, false).unwrap();
        assert_eq!(asm.sections[0].data, vec![0x02, 0x00]);
    }

    #[test]
    fn assertion_failure_reports_message() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { #ASSERT 0, \"nope\" }\n",
        );
        let err = link(&mut asm, false).unwrap_err();
        assert!(err.message.contains("nope"));
    }
}
