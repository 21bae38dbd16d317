// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A contiguous run of bytes destined for one layout, plus the
//! not-yet-resolved expressions embedded in it.

use std::collections::BTreeMap;

use crate::ast::{AstKind, AstNode};
use crate::token::{Token, TokenKind};

/// `base_address < 0` means the section has not yet been placed by
/// the allocator.
pub struct Section {
    pub layout: String,
    pub name: String,
    pub name_token: Token,
    pub base_address: i64,
    pub bank: Option<i64>,
    pub data: Vec<u8>,
    /// offset -> (hole size in bytes, expression to resolve)
    pub holes: BTreeMap<usize, (u8, AstNode)>,
    pub asserts: Vec<(usize, AstNode, String)>,
}

impl Section {
    pub fn new(layout: String, name: String, name_token: Token) -> Self {
        Section {
            layout,
            name,
            name_token,
            base_address: -1,
            bank: None,
            data: Vec::new(),
            holes: BTreeMap::new(),
            asserts: Vec::new(),
        }
    }

    /// `DB`: a literal number or string is written immediately; any
    /// other expression becomes a 1-byte hole patched at link time.
    pub fn add8(&mut self, node: AstNode) {
        if node.kind == AstKind::Value && node.token.kind == TokenKind::Number {
            self.data.push(node.token.as_number().unwrap_or(0) as u8);
        } else if node.kind == AstKind::Value && node.token.kind == TokenKind::String {
            self.data.extend(node.token.as_str().unwrap_or("").as_bytes());
        } else {
            let offset = self.data.len();
            self.data.push(0);
            self.holes.insert(offset, (1, node));
        }
    }

    /// `DW`: same as [`Section::add8`] but a 2-byte little-endian hole.
    pub fn add16(&mut self, node: AstNode) {
        if node.kind == AstKind::Value && node.token.kind == TokenKind::Number {
            let value = node.token.as_number().unwrap_or(0);
            self.data.push((value & 0xFF) as u8);
            self.data.push(((value >> 8) & 0xFF) as u8);
        } else {
            let offset = self.data.len();
            self.data.push(0);
            self.data.push(0);
            self.holes.insert(offset, (2, node));
        }
    }

    pub fn add_assert(&mut self, node: AstNode, message: String) {
        let offset = self.data.len();
        self.asserts.push((offset, node, message));
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn section() -> Section {
        let name_tok = Token::new(TokenKind::String, crate::token::TokenValue::Text("S".into()), 1, Rc::from("t"));
        Section::new("ROM0".into(), "S".into(), name_tok)
    }

    fn num(n: i64) -> AstNode {
        AstNode {
            kind: AstKind::Value,
            token: Token::new(TokenKind::Number, crate::token::TokenValue::Number(n), 1, Rc::from("t")),
            left: None,
            right: None,
        }
    }

    fn unresolved_id(name: &str) -> AstNode {
        AstNode {
            kind: AstKind::Value,
            token: Token::new(TokenKind::Id, crate::token::TokenValue::Text(name.into()), 1, Rc::from("t")),
            left: None,
            right: None,
        }
    }

    #[test]
    fn add8_writes_literal_numbers_immediately() {
        let mut s = section();
        s.add8(num(0x12));
        s.add8(num(0x34));
        assert_eq!(s.data, vec![0x12, 0x34]);
        assert!(s.holes.is_empty());
    }

    #[test]
    fn add16_writes_little_endian() {
        let mut s = section();
        s.add16(num(0x1234));
        assert_eq!(s.data, vec![0x34, 0x12]);
    }

    #[test]
    fn unresolved_expressions_become_holes_at_their_offset() {
        let mut s = section();
        s.add8(num(0));
        s.add16(unresolved_id("label"));
        assert_eq!(s.len(), 3);
        let (size, _) = s.holes.get(&1).expect("hole recorded at offset 1");
        assert_eq!(*size, 2);
    }
}
