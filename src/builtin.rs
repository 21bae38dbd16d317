// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed registry of built-in operations.
//!
//! `macro`-typed built-ins (`STRLEN`, `DEFINED`) rewrite a raw token
//! stream and run wherever a `FUNC` token is encountered, independent
//! of expression resolution. The rest are invoked by `eval::resolve`
//! on `call` AST nodes, gated by the phase their `FunctionType`
//! permits.

use crate::ast::{AstKind, AstNode};
use crate::error::{AssemblerError, Result};
use crate::token::{Token, TokenKind, TokenValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionType {
    Macro,
    Function,
    Link,
    Postbuild,
}

/// What a `link`/`postbuild` built-in needs from the assembler. Kept
/// narrow so `eval` and `builtin` don't have to know about
/// `Assembler`'s full internal state.
pub trait BuiltinContext {
    fn get_constant(&self, name: &str) -> Option<ConstantValue>;
    fn label_address(&self, name: &str) -> Option<i64>;
    fn label_bank(&self, name: &str) -> Option<Option<i64>>;
    fn linking_section_bank(&self) -> Option<Option<i64>>;
    fn allocation_done(&self) -> bool;
    fn max_bank_for_layout(&self, layout: &str) -> i64;
    fn rom(&self) -> Option<&[u8]>;
}

#[derive(Clone, Debug)]
pub enum ConstantValue {
    Number(i64),
    Text(String),
}

pub fn function_type(name: &str) -> Option<FunctionType> {
    match name {
        "STRLEN" | "DEFINED" => Some(FunctionType::Macro),
        "BIT_LENGTH" => Some(FunctionType::Function),
        "BANK" | "BANK_MAX" => Some(FunctionType::Link),
        "CHECKSUM" => Some(FunctionType::Postbuild),
        _ => None,
    }
}

/// Runs a `macro`-typed built-in against raw caller arguments.
/// `args[n]` is the token run for the n-th argument.
pub fn call_macro(name: &str, args: &[Vec<Token>]) -> Result<Vec<Token>> {
    match name {
        "STRLEN" => strlen(args),
        "DEFINED" => defined_placeholder(args),
        _ => Err(AssemblerError::bare(format!("{name} is not a macro built-in"))),
    }
}

fn strlen(args: &[Vec<Token>]) -> Result<Vec<Token>> {
    if args.len() != 1 {
        return Err(token_err(args, "STRLEN requires 1 argument"));
    }
    let arg = &args[0];
    if arg.len() != 1 || arg[0].kind != TokenKind::String {
        return Err(AssemblerError::at(&arg[0], "Expected a string"));
    }
    let st = &arg[0];
    let len = st.as_str().map(str::len).unwrap_or(0) as i64;
    Ok(vec![Token::new(TokenKind::Number, TokenValue::Number(len), st.line, st.file.clone())])
}

/// `DEFINED` needs `Assembler::get_constant`, which isn't reachable
/// from this free function; `assembler.rs` intercepts `DEFINED` calls
/// before falling through here. Kept as a named stub so the registry
/// in `function_type` and the dispatch table stay in one place.
fn defined_placeholder(args: &[Vec<Token>]) -> Result<Vec<Token>> {
    if args.len() != 1 {
        return Err(token_err(args, "DEFINED requires 1 argument"));
    }
    Err(AssemblerError::bare(
        "DEFINED must be resolved by the assembler, which holds the constant table",
    ))
}

fn token_err(args: &[Vec<Token>], message: &str) -> AssemblerError {
    match args.first().and_then(|a| a.first()) {
        Some(t) => AssemblerError::at(t, message),
        None => AssemblerError::bare(message),
    }
}

/// Runs `BIT_LENGTH`, a `function`-typed built-in: `param` is already
/// fully resolved by the caller before this runs.
pub fn bit_length(param: &AstNode) -> Result<AstNode> {
    if !param.is_number() {
        return Err(AssemblerError::at(&param.token, "BIT_LENGTH parameter is not a number"));
    }
    let n = param.token.as_number().unwrap_or(0);
    let bits = (i64::BITS - n.unsigned_abs().leading_zeros()) as i64;
    Ok(value_node(bits, &param.token))
}

/// Runs `BANK`: `param` is the raw `Param` chain head from the `call`
/// node (unresolved; the bank built-ins peek at the bare label token
/// rather than resolving a sub-expression).
pub fn bank(ctx: &dyn BuiltinContext, call_token: &Token, param: &AstNode) -> Result<AstNode> {
    if param.right.is_some() {
        return Err(AssemblerError::at(call_token, "BANK requires 1 argument"));
    }
    let arg = param.left.as_ref().expect("Param node always has a left operand");
    let label_token = &arg.token;
    let bank = match label_token.kind {
        TokenKind::CurAddr => ctx
            .linking_section_bank()
            .ok_or_else(|| AssemblerError::at(call_token, "BANK(@) used outside a section"))?,
        TokenKind::Id => {
            let name = label_token.as_str().unwrap_or("");
            ctx.label_bank(name).ok_or_else(|| {
                AssemblerError::at(call_token, format!("Could not find label {name} for BANK()"))
            })?
        }
        _ => return Err(AssemblerError::at(call_token, "Expected a label to BANK()")),
    };
    Ok(value_node(bank.unwrap_or(0), label_token))
}

pub fn bank_max(ctx: &dyn BuiltinContext, call_token: &Token, param: &AstNode) -> Result<AstNode> {
    if param.right.is_some() {
        return Err(AssemblerError::at(call_token, "BANK_MAX requires 1 argument"));
    }
    let arg = param.left.as_ref().expect("Param node always has a left operand");
    if arg.token.kind != TokenKind::Id {
        return Err(AssemblerError::at(call_token, "Expected a layout type to BANK_MAX()"));
    }
    let name = arg.token.as_str().unwrap_or("");
    let count = ctx.max_bank_for_layout(name);
    Ok(value_node(count, &arg.token))
}

pub fn checksum(ctx: &dyn BuiltinContext, call_token: &Token, param: Option<&AstNode>) -> Result<AstNode> {
    let rom = ctx.rom().expect("checksum only runs once the ROM has been built");
    let (start, end) = match param {
        None => (0usize, rom.len()),
        Some(p) => {
            let left = p.left.as_ref().expect("Param node always has a left operand");
            if !left.is_number() {
                return Err(AssemblerError::at(call_token, "Expected a number to checksum"));
            }
            let right = p
                .right
                .as_ref()
                .and_then(|r| r.left.as_ref())
                .ok_or_else(|| AssemblerError::at(call_token, "CHECKSUM requires a start and end"))?;
            if !right.is_number() {
                return Err(AssemblerError::at(call_token, "Expected a number to checksum"));
            }
            (left.token.as_number().unwrap_or(0) as usize, right.token.as_number().unwrap_or(0) as usize)
        }
    };
    let sum: i64 = rom.get(start..end).unwrap_or(&[]).iter().map(|b| *b as i64).sum();
    Ok(AstNode {
        kind: AstKind::Value,
        token: Token::new(TokenKind::Number, TokenValue::Number(sum), 0, std::rc::Rc::from("")),
        left: None,
        right: None,
    })
}

fn value_node(n: i64, at: &Token) -> AstNode {
    AstNode {
        kind: AstKind::Value,
        token: Token::new(TokenKind::Number, TokenValue::Number(n), at.line, at.file.clone()),
        left: None,
        right: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn num(n: i64) -> Token {
        Token::new(TokenKind::Number, TokenValue::Number(n), 1, Rc::from("test"))
    }

    #[test]
    fn bit_length_counts_significant_bits() {
        let node = AstNode { kind: AstKind::Value, token: num(5), left: None, right: None };
        let res = bit_length(&node).unwrap();
        assert_eq!(res.token.as_number(), Some(3));
    }

    #[test]
    fn strlen_measures_string_argument() {
        let tok = Token::new(TokenKind::String, TokenValue::Text("hello".into()), 1, Rc::from("test"));
        let res = call_macro("STRLEN", &[vec![tok]]).unwrap();
        assert_eq!(res[0].as_number(), Some(5));
    }
}
