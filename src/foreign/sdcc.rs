// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reader for SDCC `.rel` object files (`-msm83` target), with
//! optional `.lst` sidecar lookup for source-line diagnostics.
//!
//! The format is line-oriented text: `H`/`O`/`M` header records, `S`
//! symbol records, `A` area (section) records, and `T`/`R` pairs that
//! together describe one chunk of bytes and the relocations inside it.
//! A relocation's "mode" byte picks apart into a 2-byte absolute patch
//! or a 1-byte patch (optionally shifted right 8 bits to grab the high
//! byte of a 16-bit target) against either another area or a symbol.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use crate::ast::{AstKind, AstNode};
use crate::error::{AssemblerError, Result};
use crate::foreign::{ForeignLabel, ForeignObject, ForeignSection};
use crate::token::{Op, Token, TokenKind, TokenValue};

#[derive(Clone)]
enum Target {
    Area(usize),
    Symbol(String),
}

struct RawPatch {
    offset: usize,
    target: Target,
    target_offset: i64,
    size: u8,
    shift: u8,
}

struct RawArea {
    type_name: String,
    name: String,
    address: i64,
    data: Vec<u8>,
    symbols: Vec<(String, usize)>,
    patches: Vec<RawPatch>,
}

struct Symbol {
    name: String,
    area: Option<usize>,
}

fn hex(s: &str) -> Result<i64> {
    i64::from_str_radix(s, 16).map_err(|_| AssemblerError::bare(format!("Bad hex literal in SDCC object: {s}")))
}

fn layout_name(type_name: &str) -> Result<&'static str> {
    if type_name == "_CODE" {
        Ok("ROM0")
    } else if type_name.starts_with("_CODE_") {
        Ok("ROMX")
    } else if type_name == "_DATA" {
        Ok("WRAM0")
    } else {
        Err(AssemblerError::bare(format!("Unsupported SDCC area type: {type_name}")))
    }
}

fn bank_of(type_name: &str) -> Result<i64> {
    type_name
        .strip_prefix("_CODE_")
        .ok_or_else(|| AssemblerError::bare(format!("Area type {type_name} has no bank number")))
        .and_then(|rest| rest.parse::<i64>().map_err(|_| AssemblerError::bare(format!("Bad bank suffix in {type_name}"))))
}

/// Splits a `T`/`R` record's hex byte columns into a `Vec<u8>`.
fn record_bytes(fields: &[&str]) -> Result<Vec<u8>> {
    fields.iter().map(|f| hex(f).map(|v| v as u8)).collect()
}

/// Applies one area's pending `T`/`R` pair: walks the raw bytes,
/// copying literal data through and recording a [`RawPatch`] (instead
/// of the bytes) wherever a relocation record said one of the
/// 4-byte/2-byte placeholder windows lives.
fn apply_patches(area: &mut RawArea, mut new_offset: usize, new_data: &[u8], mut patches: Vec<(i64, u8, Target)>) -> Result<()> {
    patches.sort_by_key(|(offset, _, _)| *offset);
    let mut patches = patches.into_iter();
    let mut next = patches.next();
    let mut index = 0usize;
    loop {
        let (patch_index, patch_mode, ref patch_target) = match &next {
            Some(p) => (p.0, p.1, p.2.clone()),
            None => (new_data.len() as i64, 0, Target::Symbol(String::new())),
        };
        if index >= new_data.len() {
            break;
        }
        if (index as i64) < patch_index {
            area.data[new_offset] = new_data[index];
            new_offset += 1;
            index += 1;
            continue;
        }
        match patch_mode {
            0x00 | 0x02 => {
                let patch_offset = new_data[index] as i64 | ((new_data[index + 1] as i64) << 8);
                area.patches.push(RawPatch { offset: new_offset, target: patch_target.clone(), target_offset: patch_offset, size: 2, shift: 0 });
                new_offset += 2;
                index += 2;
            }
            0x09 | 0x0B => {
                let patch_offset = new_data[index] as i64
                    | ((new_data[index + 1] as i64) << 8)
                    | ((new_data[index + 2] as i64) << 16)
                    | ((new_data[index + 3] as i64) << 24);
                area.patches.push(RawPatch { offset: new_offset, target: patch_target.clone(), target_offset: patch_offset, size: 1, shift: 0 });
                new_offset += 1;
                index += 4;
            }
            0x89 | 0x8B => {
                let patch_offset = new_data[index] as i64
                    | ((new_data[index + 1] as i64) << 8)
                    | ((new_data[index + 2] as i64) << 16)
                    | ((new_data[index + 3] as i64) << 24);
                area.patches.push(RawPatch { offset: new_offset, target: patch_target.clone(), target_offset: patch_offset, size: 1, shift: 8 });
                new_offset += 1;
                index += 4;
            }
            other => return Err(AssemblerError::bare(format!("Unsupported SDCC relocation mode: {other:02x}"))),
        }
        next = patches.next();
    }
    Ok(())
}

/// Parses the optional `.lst` sidecar into `symbol name -> [(offset, file, line)]`,
/// used only to attribute a patch's originating source line.
fn read_lst(path: &Path) -> HashMap<String, Vec<(i64, String, u32)>> {
    let mut table: HashMap<String, Vec<(i64, String, u32)>> = HashMap::new();
    let Ok(text) = std::fs::read_to_string(path) else {
        return table;
    };
    let mut current_file: Option<String> = None;
    let mut current_line: Option<u32> = None;
    let mut active_symbol: Option<String> = None;
    for line in text.lines() {
        if line.len() < 40 {
            continue;
        }
        let offset_field = line[4..12].trim();
        if !offset_field.is_empty() {
            if let (Some(file), Some(lineno)) = (current_file.take(), current_line.take()) {
                if let Ok(offset) = i64::from_str_radix(offset_field, 16) {
                    if let Some(sym) = &active_symbol {
                        table.entry(sym.clone()).or_default().push((offset, file, lineno));
                    }
                }
            }
        }
        let data = line[40..].trim_end();
        if let Some(name) = data.strip_suffix("::") {
            active_symbol = Some(name.to_string());
            table.entry(name.to_string()).or_default();
        } else if let Some(rest) = data.strip_prefix(';') {
            if let Some((file, lineno)) = rest.split_once(':') {
                if let Ok(lineno) = lineno.trim().parse::<u32>() {
                    current_file = Some(file.trim().to_string());
                    current_line = Some(lineno);
                }
            }
        }
    }
    table
}

fn filename_line_for(lst: &HashMap<String, Vec<(i64, String, u32)>>, module: &str, area: &RawArea, offset: usize) -> (String, u32) {
    let mut previous: Option<&(String, usize)> = None;
    for sym in &area.symbols {
        if sym.1 <= offset && previous.map(|p| p.1 < sym.1).unwrap_or(true) {
            previous = Some(sym);
        }
    }
    let Some((sym_name, sym_offset)) = previous else {
        return (format!("{module}.c#?"), 0);
    };
    if let Some(entries) = lst.get(sym_name) {
        let rel_offset = (offset - sym_offset) as i64;
        let mut prev: Option<(&String, u32)> = None;
        for (o, file, line) in entries {
            if *o > rel_offset {
                break;
            }
            prev = Some((file, *line));
        }
        if let Some((file, line)) = prev {
            return (file.clone(), line);
        }
    }
    (format!("{module}.c#{sym_name}"), (offset - sym_offset) as u32)
}

pub fn read(path: &Path) -> Result<ForeignObject> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AssemblerError::bare(format!("Failed to read {}: {e}", path.display())))?;
    let lst = read_lst(&path.with_extension("lst"));

    let mut lines = text.lines();
    let header = lines.next().unwrap_or("").trim();
    if !header.starts_with("XL") {
        return Err(AssemblerError::bare("Not an SDCC .rel file (missing XL header)"));
    }
    let asize: i64 = header[2..].parse().unwrap_or(-1);
    if asize != 4 {
        return Err(AssemblerError::bare("Unsupported SDCC address size (expected XL4)"));
    }

    let mut module_name = String::new();
    let mut symbols: Vec<Symbol> = Vec::new();
    let mut areas: Vec<RawArea> = Vec::new();
    let mut pending: Option<(usize, Vec<u8>)> = None;

    for raw_line in lines {
        let fields: Vec<&str> = raw_line.trim().split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        match fields[0] {
            "H" | "O" => {}
            "M" => {
                module_name = fields.get(1).copied().unwrap_or("").to_string();
            }
            "S" => {
                let name = fields[1].to_string();
                let spec = fields[2];
                if let Some(hexval) = spec.strip_prefix("Def") {
                    let offset = hex(hexval)? as usize;
                    let area_idx = areas.len().checked_sub(1);
                    if let Some(idx) = area_idx {
                        areas[idx].symbols.push((name.clone(), offset));
                    }
                    symbols.push(Symbol { name, area: area_idx });
                } else {
                    symbols.push(Symbol { name, area: None });
                }
            }
            "A" => {
                let name = fields[1].to_string();
                let size = hex(fields[3])?;
                let flags = hex(fields[5])?;
                let addr = hex(fields[7])?;
                areas.push(RawArea {
                    type_name: name.clone(),
                    name: format!("{module_name}{name}"),
                    address: if flags & 0x08 != 0 { addr } else { -1 },
                    data: vec![0u8; size as usize],
                    symbols: Vec::new(),
                    patches: Vec::new(),
                });
            }
            "T" => {
                let bytes = record_bytes(&fields[1..])?;
                let offset = bytes[0] as usize | (bytes[1] as usize) << 8 | (bytes[2] as usize) << 16 | (bytes[3] as usize) << 24;
                pending = Some((offset, bytes[4..].to_vec()));
            }
            "R" => {
                let bytes = record_bytes(&fields[1..])?;
                let area_index = bytes[2] as usize | (bytes[3] as usize) << 8;
                let mut rest = &bytes[4..];
                let mut patches = Vec::new();
                while !rest.is_empty() {
                    let mut mode = rest[0];
                    if mode & 0xF0 == 0xF0 {
                        mode = ((mode as u16) << 8 | rest[1] as u16) as u8;
                        rest = &rest[1..];
                    }
                    let offset = rest[1] as i64;
                    let ref_idx = rest[2] as usize | (rest[3] as usize) << 8;
                    let target = if mode & 0x02 != 0 {
                        Target::Symbol(symbols[ref_idx].name.clone())
                    } else {
                        Target::Area(ref_idx)
                    };
                    patches.push((offset - 4, mode, target));
                    rest = &rest[4..];
                }
                let (new_offset, new_data) = pending.take().ok_or_else(|| AssemblerError::bare("SDCC R record without preceding T record"))?;
                if !new_data.is_empty() {
                    apply_patches(&mut areas[area_index], new_offset, &new_data, patches)?;
                } else if !patches.is_empty() {
                    return Err(AssemblerError::bare("SDCC relocation against empty data record"));
                }
            }
            other => {
                log::warn!("Unknown line in SDCC object {}: {other} ...", path.display());
            }
        }
    }

    let mut sections = Vec::with_capacity(areas.len());
    let mut labels = Vec::new();
    for (idx, area) in areas.iter().enumerate() {
        let name_token = Token::new(TokenKind::String, TokenValue::Text(area.name.clone()), 1, Rc::from(area.name.as_str()));
        let mut holes = Vec::new();
        for patch in &area.patches {
            let (filename, line_no) = filename_line_for(&lst, &module_name, area, patch.offset);
            let file: Rc<str> = Rc::from(filename.as_str());
            let node = target_ast(patch, &areas, line_no, &file);
            holes.push((patch.offset, patch.size, node));
        }
        sections.push(ForeignSection {
            layout: layout_name(&area.type_name)?.to_string(),
            name: area.name.clone(),
            name_token,
            base_address: area.address,
            bank: if area.type_name.starts_with("_CODE_") { Some(bank_of(&area.type_name)?) } else { None },
            data: area.data.clone(),
            holes,
        });
        labels.push(ForeignLabel { name: format!("__area_start_{}", area.name), section_index: idx, offset: 0 });
        for (name, offset) in &area.symbols {
            labels.push(ForeignLabel { name: name.clone(), section_index: idx, offset: *offset as i64 });
        }
    }

    Ok(ForeignObject { sections, labels })
}

fn leaf(kind: TokenKind, value: TokenValue, line: u32, file: &Rc<str>) -> AstNode {
    AstNode { kind: AstKind::Value, token: Token::new(kind, value, line, file.clone()), left: None, right: None }
}

fn binop(op: Op, left: AstNode, right: AstNode, line: u32, file: &Rc<str>) -> AstNode {
    AstNode {
        kind: AstKind::Op(op),
        token: Token::new(TokenKind::Op(op), TokenValue::None, line, file.clone()),
        left: Some(Box::new(left)),
        right: Some(Box::new(right)),
    }
}

fn bank_call(ident: String, line: u32, file: &Rc<str>) -> AstNode {
    let id_node = leaf(TokenKind::Id, TokenValue::Text(ident), line, file);
    let param = AstNode { kind: AstKind::Param, token: id_node.token.clone(), left: Some(Box::new(id_node)), right: None };
    AstNode {
        kind: AstKind::Call,
        token: Token::new(TokenKind::Id, TokenValue::Text("BANK".into()), line, file.clone()),
        left: None,
        right: Some(Box::new(param)),
    }
}

/// Mirrors the reference decoder's `Patch.get_ast`: a bank-of-symbol
/// reference (`b_*` / `___bank_*` prefixed names), an area-start
/// reference, or a plain symbol value -- then layers on the offset,
/// shift, and 1-byte mask the relocation record called for.
fn target_ast(patch: &RawPatch, areas: &[RawArea], line: u32, file: &Rc<str>) -> AstNode {
    let mut node = match &patch.target {
        Target::Area(idx) => leaf(TokenKind::Id, TokenValue::Text(format!("__area_start_{}", areas[*idx].name)), line, file),
        Target::Symbol(name) => {
            if let Some(rest) = name.strip_prefix("b_") {
                bank_call(rest.to_string(), line, file)
            } else if let Some(rest) = name.strip_prefix("___bank_") {
                bank_call(rest.to_string(), line, file)
            } else {
                leaf(TokenKind::Id, TokenValue::Text(name.clone()), line, file)
            }
        }
    };
    if patch.target_offset != 0 {
        node = binop(Op::Plus, node, leaf(TokenKind::Number, TokenValue::Number(patch.target_offset), line, file), line, file);
    }
    if patch.shift != 0 {
        node = binop(Op::Shr, node, leaf(TokenKind::Number, TokenValue::Number(patch.shift as i64), line, file), line, file);
    }
    if patch.size == 1 {
        node = binop(Op::Amp, node, leaf(TokenKind::Number, TokenValue::Number(0xFF), line, file), line, file);
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rel(dir: &std::path::Path, text: &str) -> std::path::PathBuf {
        let path = dir.join("test.rel");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn reads_literal_bytes_with_no_relocations() {
        let text = "XL4\nM test\nA _CODE size 02 flags 00 addr 0000\nS lbl Def0000\nT 00 00 00 00 AA BB\nR 00 00 00 00\n";
        let dir = tempfile::tempdir().unwrap();
        let obj = read(&write_rel(dir.path(), text)).unwrap();

        assert_eq!(obj.sections.len(), 1);
        assert_eq!(obj.sections[0].layout, "ROM0");
        assert_eq!(obj.sections[0].data, vec![0xAA, 0xBB]);
        assert!(obj.sections[0].holes.is_empty());
        assert!(obj.labels.iter().any(|l| l.name == "lbl" && l.offset == 0));
        assert!(obj.labels.iter().any(|l| l.name == "__area_start_test_CODE"));
    }

    #[test]
    fn reads_a_word_patch_against_an_external_symbol() {
        let text = "XL4\nM test\nA _CODE size 02 flags 00 addr 0000\n\
                    S lbl Def0000\nS target\nT 00 00 00 00 00 00\nR 00 00 00 00 02 04 01 00\n";
        let dir = tempfile::tempdir().unwrap();
        let obj = read(&write_rel(dir.path(), text)).unwrap();

        assert_eq!(obj.sections[0].holes.len(), 1);
        let (offset, size, node) = &obj.sections[0].holes[0];
        assert_eq!(*offset, 0);
        assert_eq!(*size, 2);
        assert_eq!(node.token.as_str(), Some("target"));
    }

    #[test]
    fn bank_of_parses_the_numeric_suffix() {
        assert_eq!(bank_of("_CODE_3").unwrap(), 3);
        assert!(bank_of("_CODE").is_err());
    }

    #[test]
    fn rejects_a_missing_xl4_header() {
        let text = "XL2\nM test\n";
        let dir = tempfile::tempdir().unwrap();
        let err = read(&write_rel(dir.path(), text)).unwrap_err();
        assert!(err.message.contains("XL4"));
    }
}
