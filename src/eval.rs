// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The expression evaluator: a pure, terminating bottom-up fold over
//! an [`AstNode`] tree.
//!
//! `resolve` never mutates assembler state and never loops; each call
//! walks the tree exactly once. Three outcomes are possible for any
//! subtree: it folded all the way down to a `value` leaf
//! ([`Resolution::Resolved`]), it folded partially because some
//! symbol is still unknown ([`Resolution::Pending`]), or it named a
//! `link`/`postbuild` built-in that cannot run yet
//! ([`Resolution::DeferToPostBuild`]) -- the caller (the linker, or
//! the post-build re-resolution pass) decides what to do with each.

use crate::ast::{AstKind, AstNode};
use crate::builtin::{self, BuiltinContext, FunctionType};
use crate::error::Result;
use crate::token::{Op, Token, TokenKind, TokenValue};

pub enum Resolution {
    Resolved(AstNode),
    Pending(AstNode),
    DeferToPostBuild(AstNode),
}

impl Resolution {
    pub fn into_node(self) -> AstNode {
        match self {
            Resolution::Resolved(n) | Resolution::Pending(n) | Resolution::DeferToPostBuild(n) => n,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }
}

pub fn resolve(ctx: &dyn BuiltinContext, offset: Option<i64>, node: AstNode) -> Result<Resolution> {
    match &node.kind {
        AstKind::Value => resolve_value(ctx, offset, node),
        AstKind::Call => resolve_call(ctx, offset, node),
        AstKind::Op(op) => resolve_op(ctx, offset, node, *op),
        AstKind::Ref | AstKind::Param => resolve_structural(ctx, offset, node),
    }
}

fn resolve_value(ctx: &dyn BuiltinContext, offset: Option<i64>, mut node: AstNode) -> Result<Resolution> {
    match node.token.kind {
        TokenKind::Id => {
            let name = node.token.as_str().unwrap_or("").to_string();
            match ctx.label_address(&name) {
                Some(addr) => {
                    node.token = Token::new(TokenKind::Number, TokenValue::Number(addr), node.token.line, node.token.file.clone());
                    Ok(Resolution::Resolved(node))
                }
                None => Ok(Resolution::Pending(node)),
            }
        }
        TokenKind::CurAddr => match offset {
            Some(addr) => {
                node.token = Token::new(TokenKind::Number, TokenValue::Number(addr), node.token.line, node.token.file.clone());
                Ok(Resolution::Resolved(node))
            }
            None => Ok(Resolution::Pending(node)),
        },
        TokenKind::Number | TokenKind::String => Ok(Resolution::Resolved(node)),
        _ => Ok(Resolution::Pending(node)),
    }
}

fn resolve_call(ctx: &dyn BuiltinContext, offset: Option<i64>, node: AstNode) -> Result<Resolution> {
    let name = node.token.as_str().unwrap_or("").to_string();
    let Some(kind) = builtin::function_type(&name) else {
        return Ok(Resolution::Pending(node));
    };
    match kind {
        FunctionType::Link => {
            if !ctx.allocation_done() {
                return Ok(Resolution::DeferToPostBuild(node));
            }
            let param = node.right.as_ref().expect("link built-ins require one argument");
            let result = match name.as_str() {
                "BANK" => builtin::bank(ctx, &node.token, param)?,
                "BANK_MAX" => builtin::bank_max(ctx, &node.token, param)?,
                _ => unreachable!("function_type table and dispatch are out of sync"),
            };
            Ok(Resolution::Resolved(result))
        }
        FunctionType::Postbuild => {
            if ctx.rom().is_none() {
                return Ok(Resolution::DeferToPostBuild(node));
            }
            let result = builtin::checksum(ctx, &node.token, node.right.as_deref())?;
            Ok(Resolution::Resolved(result))
        }
        FunctionType::Function => {
            let param = node.right.as_ref().expect("function built-ins require one argument");
            let arg = param.left.as_ref().expect("Param node always has a left operand");
            let resolved_arg = resolve(ctx, offset, (**arg).clone())?;
            let result = match resolved_arg {
                Resolution::Resolved(arg_node) => builtin::bit_length(&arg_node)?,
                other => return Ok(other),
            };
            Ok(Resolution::Resolved(result))
        }
        FunctionType::Macro => {
            // Macro built-ins rewrite token streams before parsing and
            // never reach the evaluator as `call` nodes.
            Ok(Resolution::Pending(node))
        }
    }
}

fn resolve_structural(ctx: &dyn BuiltinContext, offset: Option<i64>, mut node: AstNode) -> Result<Resolution> {
    if let Some(left) = node.left.take() {
        match resolve(ctx, offset, *left)? {
            Resolution::DeferToPostBuild(n) => {
                node.left = Some(Box::new(n));
                return Ok(Resolution::DeferToPostBuild(node));
            }
            Resolution::Resolved(n) | Resolution::Pending(n) => node.left = Some(Box::new(n)),
        }
    }
    if let Some(right) = node.right.take() {
        match resolve(ctx, offset, *right)? {
            Resolution::DeferToPostBuild(n) => {
                node.right = Some(Box::new(n));
                return Ok(Resolution::DeferToPostBuild(node));
            }
            Resolution::Resolved(n) | Resolution::Pending(n) => node.right = Some(Box::new(n)),
        }
    }
    Ok(Resolution::Pending(node))
}

fn resolve_op(ctx: &dyn BuiltinContext, offset: Option<i64>, mut node: AstNode, op: Op) -> Result<Resolution> {
    let left = match node.left.take() {
        Some(left) => match resolve(ctx, offset, *left)? {
            Resolution::DeferToPostBuild(n) => {
                node.left = Some(Box::new(n));
                return Ok(Resolution::DeferToPostBuild(node));
            }
            Resolution::Resolved(n) => {
                node.left = Some(Box::new(n.clone()));
                Some(n)
            }
            Resolution::Pending(n) => {
                node.left = Some(Box::new(n));
                None
            }
        },
        None => None,
    };
    let is_unary = node.right.is_none();
    let right = match node.right.take() {
        Some(right) => match resolve(ctx, offset, *right)? {
            Resolution::DeferToPostBuild(n) => {
                node.right = Some(Box::new(n));
                return Ok(Resolution::DeferToPostBuild(node));
            }
            Resolution::Resolved(n) => {
                node.right = Some(Box::new(n.clone()));
                Some(n)
            }
            Resolution::Pending(n) => {
                node.right = Some(Box::new(n));
                None
            }
        },
        None => None,
    };

    if op == Op::Hash {
        // Structural marker with no fold rule of its own (§4.5 names
        // no operator-fold entry for `#`).
        return Ok(Resolution::Pending(node));
    }

    let Some(left) = left else { return Ok(Resolution::Pending(node)) };

    if is_unary {
        return Ok(fold_unary(op, &left).unwrap_or(Resolution::Pending(node)));
    }

    let Some(right) = right else { return Ok(Resolution::Pending(node)) };
    Ok(fold_binary(op, &left, &right).unwrap_or(Resolution::Pending(node)))
}

fn fold_unary(op: Op, left: &AstNode) -> Option<Resolution> {
    if !left.is_number() {
        return None;
    }
    let n = left.token.as_number()?;
    let result = match op {
        Op::Minus => -n,
        Op::Plus => n,
        Op::Bang => i64::from(n == 0),
        Op::Tilde => (!n) & 0xFF,
        _ => return None,
    };
    Some(Resolution::Resolved(value(result, left)))
}

fn fold_binary(op: Op, left: &AstNode, right: &AstNode) -> Option<Resolution> {
    if left.is_string() && right.is_string() {
        let a = left.token.as_str()?;
        let b = right.token.as_str()?;
        return match op {
            Op::Plus => Some(Resolution::Resolved(text(format!("{a}{b}"), left))),
            Op::EqEq => Some(Resolution::Resolved(value(i64::from(a == b), left))),
            Op::Ne => Some(Resolution::Resolved(value(i64::from(a != b), left))),
            _ => None,
        };
    }
    if !left.is_number() || !right.is_number() {
        return None;
    }
    let a = left.token.as_number()?;
    let b = right.token.as_number()?;
    let result = match op {
        Op::Plus => a + b,
        Op::Minus => a - b,
        Op::Star => a * b,
        Op::Slash => floor_div(a, b)?,
        Op::Percent => floor_mod(a, b)?,
        Op::Amp => a & b,
        Op::Pipe => a | b,
        Op::Caret => a ^ b,
        Op::Shl => a << b,
        Op::Shr => a >> b,
        Op::Gt => i64::from(a > b),
        Op::Lt => i64::from(a < b),
        Op::Ge => i64::from(a >= b),
        Op::Le => i64::from(a <= b),
        Op::EqEq => i64::from(a == b),
        Op::Ne => i64::from(a != b),
        Op::AndAnd => i64::from(a != 0 && b != 0),
        Op::OrOr => i64::from(a != 0 || b != 0),
        _ => return None,
    };
    Some(Resolution::Resolved(value(result, left)))
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    Some(a.div_euclid(b))
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    Some(a.rem_euclid(b))
}

fn value(n: i64, at: &AstNode) -> AstNode {
    AstNode {
        kind: AstKind::Value,
        token: Token::new(TokenKind::Number, TokenValue::Number(n), at.token.line, at.token.file.clone()),
        left: None,
        right: None,
    }
}

fn text(s: String, at: &AstNode) -> AstNode {
    AstNode {
        kind: AstKind::Value,
        token: Token::new(TokenKind::String, TokenValue::Text(s), at.token.line, at.token.file.clone()),
        left: None,
        right: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_expression;
    use crate::builtin::ConstantValue;
    use crate::token::Tokenizer;

    struct Ctx;
    impl BuiltinContext for Ctx {
        fn get_constant(&self, _name: &str) -> Option<ConstantValue> {
            None
        }
        fn label_address(&self, name: &str) -> Option<i64> {
            if name == "START" { Some(0x150) } else { None }
        }
        fn label_bank(&self, _name: &str) -> Option<Option<i64>> {
            None
        }
        fn linking_section_bank(&self) -> Option<Option<i64>> {
            None
        }
        fn allocation_done(&self) -> bool {
            true
        }
        fn max_bank_for_layout(&self, _layout: &str) -> i64 {
            0
        }
        fn rom(&self) -> Option<&[u8]> {
            None
        }
    }

    fn lex(code: &str) -> Vec<Token> {
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

    #[test]
    fn folds_arithmetic_fully() {
        let ast = parse_expression(lex("1 + 2 * 3"), 0).unwrap();
        let res = resolve(&Ctx, None, ast).unwrap();
        assert!(res.is_resolved());
        assert_eq!(res.into_node().token.as_number(), Some(7));
    }

    #[test]
    fn label_resolves_to_absolute_address() {
        let ast = parse_expression(lex("START + 1"), 0).unwrap();
        let res = resolve(&Ctx, None, ast).unwrap();
        assert!(res.is_resolved());
        assert_eq!(res.into_node().token.as_number(), Some(0x151));
    }

    #[test]
    fn unknown_label_stays_pending() {
        let ast = parse_expression(lex("UNKNOWN + 1"), 0).unwrap();
        let res = resolve(&Ctx, None, ast).unwrap();
        assert!(!res.is_resolved());
    }

    #[test]
    fn tilde_clamps_to_eight_bits() {
        let ast = parse_expression(lex("~0"), 0).unwrap();
        let res = resolve(&Ctx, None, ast).unwrap();
        assert_eq!(res.into_node().token.as_number(), Some(0xFF));
    }

    #[test]
    fn string_concatenation() {
        let ast = parse_expression(lex("\"a\" + \"b\""), 0).unwrap();
        let res = resolve(&Ctx, None, ast).unwrap();
        assert_eq!(res.into_node().token.as_str(), Some("ab"));
    }
}
