// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The expression grammar: a Pratt parser over a fixed precedence
//! table, producing an [`AstNode`] tree that `eval` and the directive
//! dispatcher in `assembler` both walk.

use crate::error::{AssemblerError, Result};
use crate::token::{Op, Token, TokenKind, TokenValue, Tokenizer};

const PREC_ASSIGNMENT: u8 = 1;
const PREC_LOGIC_OR: u8 = 2;
const PREC_LOGIC_AND: u8 = 3;
const PREC_BITWISE_OR: u8 = 4;
const PREC_BITWISE_XOR: u8 = 5;
const PREC_BITWISE_AND: u8 = 6;
const PREC_EQUALITY: u8 = 7;
const PREC_COMPARISON: u8 = 8;
const PREC_SHIFT: u8 = 9;
const PREC_TERM: u8 = 10;
const PREC_FACTOR: u8 = 11;
const PREC_UNARY: u8 = 12;
const PREC_CALL: u8 = 13;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AstKind {
    Value,
    Call,
    Param,
    Ref,
    Op(Op),
}

#[derive(Clone, Debug)]
pub struct AstNode {
    pub kind: AstKind,
    pub token: Token,
    pub left: Option<Box<AstNode>>,
    pub right: Option<Box<AstNode>>,
}

impl AstNode {
    pub fn is_number(&self) -> bool {
        self.kind == AstKind::Value && self.token.kind == TokenKind::Number
    }

    pub fn is_string(&self) -> bool {
        self.kind == AstKind::Value && self.token.kind == TokenKind::String
    }

    fn leaf(kind: AstKind, token: Token) -> Self {
        AstNode { kind, token, left: None, right: None }
    }
}

/// Binding power of `kind` when it appears in infix position, and
/// whether it has an infix rule at all. `None` means the kind cannot
/// follow a completed operand (it has neither binary nor postfix
/// meaning).
fn infix_precedence(kind: &TokenKind) -> Option<u8> {
    use Op::*;
    use TokenKind::Op as O;
    Some(match kind {
        O(Amp) => PREC_BITWISE_AND,
        O(Caret) => PREC_BITWISE_XOR,
        O(Pipe) => PREC_BITWISE_OR,
        O(Plus) | O(Minus) => PREC_TERM,
        O(Slash) | O(Star) | O(Percent) => PREC_FACTOR,
        O(Shr) | O(Shl) => PREC_SHIFT,
        O(EqEq) | O(Ne) => PREC_EQUALITY,
        O(Lt) | O(Gt) | O(Le) | O(Ge) => PREC_COMPARISON,
        O(AndAnd) => PREC_LOGIC_AND,
        O(OrOr) => PREC_LOGIC_OR,
        O(LParen) => PREC_CALL,
        O(LBracket) => PREC_CALL,
        TokenKind::Func => PREC_CALL,
        _ => return None,
    })
}

fn has_infix(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Op(Op::Amp)
            | TokenKind::Op(Op::Caret)
            | TokenKind::Op(Op::Pipe)
            | TokenKind::Op(Op::Plus)
            | TokenKind::Op(Op::Minus)
            | TokenKind::Op(Op::Slash)
            | TokenKind::Op(Op::Star)
            | TokenKind::Op(Op::Percent)
            | TokenKind::Op(Op::Shr)
            | TokenKind::Op(Op::Shl)
            | TokenKind::Op(Op::EqEq)
            | TokenKind::Op(Op::Ne)
            | TokenKind::Op(Op::Lt)
            | TokenKind::Op(Op::Gt)
            | TokenKind::Op(Op::Le)
            | TokenKind::Op(Op::Ge)
            | TokenKind::Op(Op::AndAnd)
            | TokenKind::Op(Op::OrOr)
    )
}

fn is_known(kind: &TokenKind) -> bool {
    has_infix(kind)
        || matches!(
            kind,
            TokenKind::Id
                | TokenKind::Alabel
                | TokenKind::String
                | TokenKind::CurAddr
                | TokenKind::Number
                | TokenKind::Func
                | TokenKind::Op(Op::Hash)
                | TokenKind::Op(Op::Tilde)
                | TokenKind::Op(Op::Bang)
                | TokenKind::Op(Op::LParen)
                | TokenKind::Op(Op::LBracket)
        )
}

struct Parser<'a> {
    tok: &'a mut Tokenizer,
    anonymous_label_count: i64,
}

pub fn parse_expression(tokens: Vec<Token>, anonymous_label_count: i64) -> Result<AstNode> {
    let mut tok = Tokenizer::new();
    tok.prepend(tokens);
    let mut parser = Parser { tok: &mut tok, anonymous_label_count };
    let result = parse_precedence(&mut parser, PREC_ASSIGNMENT)?;
    let eof = parser.tok.pop();
    if eof.kind != TokenKind::Eof {
        return Err(AssemblerError::at(&eof, "Syntax error"));
    }
    Ok(result)
}

fn parse_precedence(p: &mut Parser, precedence: u8) -> Result<AstNode> {
    let token = p.tok.peek();
    let mut a = parse_prefix(p, &token)?;

    loop {
        let t = p.tok.peek();
        if !is_known(&t.kind) {
            break;
        }
        let Some(prec) = infix_precedence(&t.kind) else { break };
        if precedence > prec {
            break;
        }
        let (kind, right) = parse_binary(p, prec)?;
        a = AstNode { kind, token: t, left: Some(Box::new(a)), right: Some(Box::new(right)) };
    }
    Ok(a)
}

fn parse_prefix(p: &mut Parser, token: &Token) -> Result<AstNode> {
    match &token.kind {
        TokenKind::Id | TokenKind::String | TokenKind::CurAddr | TokenKind::Number => {
            Ok(AstNode::leaf(AstKind::Value, p.tok.pop()))
        }
        TokenKind::Alabel => parse_anonymous_label(p),
        TokenKind::Op(Op::Hash) | TokenKind::Op(Op::Tilde) | TokenKind::Op(Op::Bang) => {
            parse_unary(p)
        }
        TokenKind::Op(Op::Minus) | TokenKind::Op(Op::Plus) => parse_unary(p),
        TokenKind::Func => parse_call(p),
        TokenKind::Op(Op::LParen) => parse_grouping(p),
        TokenKind::Op(Op::LBracket) => parse_ref(p),
        _ if is_known(&token.kind) => Err(AssemblerError::at(token, "Expect expression.")),
        _ => Err(AssemblerError::at(token, format!("Unexpected {}", token.text()))),
    }
}

fn parse_anonymous_label(p: &mut Parser) -> Result<AstNode> {
    let t = p.tok.pop();
    let text = t.as_str().unwrap_or("");
    let bytes = text.as_bytes();
    let mut offset: i64 = 0;
    for &c in &bytes[1..] {
        match c {
            b'+' => offset += 1,
            b'-' => offset -= 1,
            _ => {}
        }
    }
    if bytes.len() > 1 && bytes[1] == b'-' {
        offset += 1;
    }
    let name = format!("__anonymous_{}", p.anonymous_label_count + offset);
    Ok(AstNode::leaf(
        AstKind::Value,
        Token::new(TokenKind::Id, TokenValue::Text(name), t.line, t.file.clone()),
    ))
}

fn parse_grouping(p: &mut Parser) -> Result<AstNode> {
    p.tok.pop();
    let res = parse_precedence(p, PREC_ASSIGNMENT)?;
    p.tok.expect(TokenKind::Op(Op::RParen))?;
    Ok(res)
}

fn parse_call(p: &mut Parser) -> Result<AstNode> {
    let func_token = p.tok.pop();
    if p.tok.matches_kind(&TokenKind::Op(Op::RParen)).is_some() {
        return Ok(AstNode::leaf(AstKind::Call, func_token));
    }
    let mut args = vec![parse_precedence(p, PREC_ASSIGNMENT)?];
    while p.tok.matches_kind(&TokenKind::Op(Op::Comma)).is_some() {
        args.push(parse_precedence(p, PREC_ASSIGNMENT)?);
    }
    p.tok.expect(TokenKind::Op(Op::RParen))?;

    let mut chain: Option<Box<AstNode>> = None;
    for arg in args.into_iter().rev() {
        let arg_token = arg.token.clone();
        chain = Some(Box::new(AstNode {
            kind: AstKind::Param,
            token: arg_token,
            left: Some(Box::new(arg)),
            right: chain,
        }));
    }
    Ok(AstNode { kind: AstKind::Call, token: func_token, left: None, right: chain })
}

fn parse_ref(p: &mut Parser) -> Result<AstNode> {
    let t = p.tok.pop();
    let res = parse_precedence(p, PREC_ASSIGNMENT)?;
    p.tok.expect(TokenKind::Op(Op::RBracket))?;
    Ok(AstNode { kind: AstKind::Ref, token: t, left: Some(Box::new(res)), right: None })
}

fn parse_unary(p: &mut Parser) -> Result<AstNode> {
    let t = p.tok.pop();
    let kind = match &t.kind {
        TokenKind::Op(op) => AstKind::Op(*op),
        _ => unreachable!("parse_unary only dispatched for Op tokens"),
    };
    let operand = parse_precedence(p, PREC_UNARY)?;
    Ok(AstNode { kind, token: t, left: Some(Box::new(operand)), right: None })
}

fn parse_binary(p: &mut Parser, precedence: u8) -> Result<(AstKind, AstNode)> {
    let t = p.tok.pop();
    let kind = match &t.kind {
        TokenKind::Op(op) => AstKind::Op(*op),
        _ => unreachable!("parse_binary only dispatched for Op tokens"),
    };
    let right = parse_precedence(p, precedence + 1)?;
    Ok((kind, right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

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
    fn respects_precedence_of_mul_over_add() {
        let ast = parse_expression(lex("1 + 2 * 3"), 0).unwrap();
        assert_eq!(ast.kind, AstKind::Op(Op::Plus));
        assert_eq!(ast.right.unwrap().kind, AstKind::Op(Op::Star));
    }

    #[test]
    fn grouping_overrides_precedence() {
        let ast = parse_expression(lex("(1 + 2) * 3"), 0).unwrap();
        assert_eq!(ast.kind, AstKind::Op(Op::Star));
        assert_eq!(ast.left.unwrap().kind, AstKind::Op(Op::Plus));
    }

    #[test]
    fn call_chains_params_in_order() {
        let ast = parse_expression(lex("FOO(1, 2, 3)"), 0).unwrap();
        assert_eq!(ast.kind, AstKind::Call);
        let p1 = ast.right.unwrap();
        assert_eq!(p1.left.as_ref().unwrap().token.as_number(), Some(1));
        let p2 = p1.right.unwrap();
        assert_eq!(p2.left.as_ref().unwrap().token.as_number(), Some(2));
        let p3 = p2.right.unwrap();
        assert_eq!(p3.left.as_ref().unwrap().token.as_number(), Some(3));
        assert!(p3.right.is_none());
    }

    #[test]
    fn anonymous_label_forward_offset() {
        let ast = parse_expression(lex(":++"), 5).unwrap();
        assert_eq!(ast.token.as_str(), Some("__anonymous_7"));
    }

    #[test]
    fn anonymous_label_backward_offset_has_shift() {
        // ":-" means "one label back from here"; the counter already
        // points one past the most recently defined label, hence +1.
        let ast = parse_expression(lex(":-"), 5).unwrap();
        assert_eq!(ast.token.as_str(), Some("__anonymous_5"));
    }

    #[test]
    fn unresolved_reference_uses_ref_kind() {
        let ast = parse_expression(lex("[hl]"), 0).unwrap();
        assert_eq!(ast.kind, AstKind::Ref);
        let _ = Rc::from("unused");
    }
}
