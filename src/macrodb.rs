// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage and pattern matching for statement macros and expression
//! macros.
//!
//! A macro's parameter list is a sequence of token runs. A run is
//! either a literal sequence that must match the caller's tokens
//! exactly, or contains "holes" -- `ID` tokens whose name starts with
//! `_` -- each of which slurps a contiguous, possibly-empty slice of
//! caller tokens. Macros with no holes at all (`is_constant_params`)
//! are tried before hole-bearing ones, and among hole-bearing macros
//! the ones with holes furthest to the right are tried first, so that
//! `_FOO 1, 2` beats `_FOO _BAR` for a literal call.

use std::collections::HashMap;

use crate::token::Token;

#[derive(Clone)]
pub struct Macro {
    pub name: String,
    pub params: Vec<Vec<Token>>,
    pub contents: Vec<Token>,
    pub post_contents: Vec<Token>,
    pub chains: HashMap<String, Macro>,
    pub linked: Option<(Token, Vec<Vec<Token>>)>,
    sort_key: Vec<i64>,
}

impl Macro {
    pub fn new(name: String, params: Vec<Vec<Token>>, contents: Vec<Token>) -> Self {
        let mut sort_key = Vec::new();
        for (param_idx, param) in params.iter().enumerate() {
            for (t_idx, t) in param.iter().enumerate() {
                if t.is_hole() {
                    sort_key.push(-(param_idx as i64) * 100 - t_idx as i64);
                }
            }
        }
        Macro {
            name,
            params,
            contents,
            post_contents: Vec::new(),
            chains: HashMap::new(),
            linked: None,
            sort_key,
        }
    }

    pub fn is_constant_params(&self) -> bool {
        !self.params.iter().any(|param| param.iter().any(Token::is_hole))
    }

    pub fn match_params(&self, params: &[Vec<Token>]) -> Option<HashMap<String, Vec<Token>>> {
        if params.len() != self.params.len() {
            return None;
        }
        let mut res = HashMap::new();
        for (caller, pattern) in params.iter().zip(self.params.iter()) {
            if !Macro::match_node_list(caller, pattern, &mut res) {
                return None;
            }
        }
        Some(res)
    }

    pub fn add_chain(&mut self, name: String, contents: Vec<Token>) -> &mut Macro {
        let chain = Macro::new(name.clone(), self.params.clone(), contents);
        self.chains.insert(name.clone(), chain);
        self.chains.get_mut(&name).unwrap()
    }

    pub fn is_equal(&self, other: &Macro) -> bool {
        if self.params.len() != other.params.len() {
            return false;
        }
        for (p0, p1) in self.params.iter().zip(other.params.iter()) {
            if p0.len() != p1.len() {
                return false;
            }
            for (t0, t1) in p0.iter().zip(p1.iter()) {
                if t0.is_hole() && t1.is_hole() {
                    continue;
                }
                if !t0.matches(t1) {
                    return false;
                }
            }
        }
        true
    }

    /// Matches a caller token run `a` against a pattern run `b`,
    /// recording the slice each hole captures into `res`. Each hole
    /// takes exactly enough tokens to leave the right number for the
    /// literal tokens that follow it in `b`.
    fn match_node_list(a: &[Token], b: &[Token], res: &mut HashMap<String, Vec<Token>>) -> bool {
        let mut a_idx: isize = 0;
        for (b_idx, token) in b.iter().enumerate() {
            if token.is_hole() {
                let to_add = (a.len() as isize - a_idx) - (b.len() as isize - b_idx as isize) + 1;
                if to_add < 1 {
                    return false;
                }
                let start = a_idx as usize;
                let end = start + to_add as usize;
                if end > a.len() {
                    return false;
                }
                res.insert(token.text(), a[start..end].to_vec());
                a_idx += to_add;
            } else {
                if a_idx as usize >= a.len() {
                    return false;
                }
                if !a[a_idx as usize].matches(token) {
                    return false;
                }
                a_idx += 1;
            }
        }
        true
    }
}

#[derive(Default)]
pub struct MacroDb {
    macros: HashMap<String, (Vec<Macro>, Vec<Macro>)>,
}

impl MacroDb {
    pub fn new() -> Self {
        MacroDb { macros: HashMap::new() }
    }

    /// Registers a macro. Returns `None` (and registers nothing) if an
    /// identical macro -- same arity, same literal/hole shape -- is
    /// already present, matching the original's silent-duplicate
    /// rejection.
    pub fn add(&mut self, name: &str, params: Vec<Vec<Token>>, contents: Vec<Token>) -> Option<&mut Macro> {
        let macro_ = Macro::new(name.to_string(), params, contents);
        let entry = self.macros.entry(name.to_string()).or_default();
        if macro_.is_constant_params() {
            if entry.0.iter().any(|m| m.is_equal(&macro_)) {
                return None;
            }
            entry.0.push(macro_);
            entry.0.last_mut()
        } else {
            if entry.1.iter().any(|m| m.is_equal(&macro_)) {
                return None;
            }
            let sort_key = macro_.sort_key.clone();
            entry.1.push(macro_);
            entry.1.sort_by_key(|m| m.sort_key.clone());
            entry.1.iter_mut().find(|m| m.sort_key == sort_key)
        }
    }

    pub fn get(&self, name: &str, params: &[Vec<Token>]) -> Option<(&Macro, HashMap<String, Vec<Token>>)> {
        let Some((constant, holed)) = self.macros.get(name) else { return None };
        for macro_ in constant {
            if macro_.params.len() != params.len() {
                continue;
            }
            if let Some(res) = macro_.match_params(params) {
                return Some((macro_, res));
            }
        }
        for macro_ in holed {
            if let Some(res) = macro_.match_params(params) {
                return Some((macro_, res));
            }
        }
        None
    }

    pub fn get_mut(&mut self, name: &str, params: &[Vec<Token>]) -> Option<&mut Macro> {
        let (constant, holed) = self.macros.get_mut(name)?;
        for macro_ in constant.iter_mut() {
            if macro_.params.len() != params.len() {
                continue;
            }
            if macro_.match_params(params).is_some() {
                return Some(macro_);
            }
        }
        for macro_ in holed.iter_mut() {
            if macro_.match_params(params).is_some() {
                return Some(macro_);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{TokenKind, TokenValue, Tokenizer};
    use std::rc::Rc;

    fn toks(code: &str) -> Vec<Token> {
        let mut t = Tokenizer::new();
        t.add_code(code, "test").unwrap();
        let mut out = Vec::new();
        loop {
            let tok = t.pop();
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok);
        }
        out
    }

    fn id(name: &str) -> Token {
        Token::new(TokenKind::Id, TokenValue::Text(name.to_string()), 1, Rc::from("test"))
    }

    #[test]
    fn literal_macro_beats_hole_bearing_one() {
        let mut db = MacroDb::new();
        db.add("FOO", vec![toks("1"), toks("2")], toks("literal"));
        db.add("FOO", vec![vec![id("_A")], vec![id("_B")]], toks("holed"));
        let (m, _) = db.get("FOO", &[toks("1"), toks("2")]).unwrap();
        assert_eq!(m.contents, toks("literal"));
    }

    #[test]
    fn hole_captures_correct_slice() {
        let mut res = HashMap::new();
        let pattern = vec![id("_A"), id("_B")];
        let caller = toks("1, 2, 3, 4");
        assert!(Macro::match_node_list(&caller, &pattern, &mut res));
        assert_eq!(res.len(), 2);
    }

    #[test]
    fn duplicate_macro_rejected() {
        let mut db = MacroDb::new();
        db.add("FOO", vec![vec![id("_A")]], toks("one"));
        let added = db.add("FOO", vec![vec![id("_X")]], toks("two"));
        assert!(added.is_none());
    }
}
