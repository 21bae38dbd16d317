// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Import of foreign object files (`#INCRGBDS`, `#INCSDCC`) so that
//! binaries built with other Game Boy toolchains can be linked
//! against.

pub mod rgbds;
pub mod sdcc;

use crate::ast::AstNode;
use crate::token::Token;

/// One imported section: a layout name, the data/holes that make it
/// up, and the labels it exports. The caller (`assembler.rs`) folds
/// these into its own `Section`/label tables exactly as if they had
/// been produced by `#SECTION`/`DB`/`name:`.
pub struct ForeignSection {
    pub layout: String,
    pub name: String,
    pub name_token: Token,
    pub base_address: i64,
    pub bank: Option<i64>,
    pub data: Vec<u8>,
    pub holes: Vec<(usize, u8, AstNode)>,
}

pub struct ForeignLabel {
    pub name: String,
    pub section_index: usize,
    pub offset: i64,
}

pub struct ForeignObject {
    pub sections: Vec<ForeignSection>,
    pub labels: Vec<ForeignLabel>,
}
