// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The assembler's single error type.
//!
//! Every failure mode in the pipeline -- lexical, syntactic, semantic,
//! allocation, link -- is conveyed through the message text rather than
//! through a closed set of variants. What varies across call sites is
//! whether a source token is available to anchor the diagnostic.

use std::fmt;

use crate::token::Token;

/// A fatal assembler error: a human-readable message plus the token
/// (if any) that caused it.
pub struct AssemblerError {
    pub message: String,
    pub token: Option<Token>,
}

impl AssemblerError {
    pub fn new(token: impl Into<Option<Token>>, message: impl Into<String>) -> Self {
        AssemblerError { message: message.into(), token: token.into() }
    }

    pub fn at(token: &Token, message: impl Into<String>) -> Self {
        AssemblerError { message: message.into(), token: Some(token.clone()) }
    }

    pub fn bare(message: impl Into<String>) -> Self {
        AssemblerError { message: message.into(), token: None }
    }

    /// Picks the token most indicative of the cause from an
    /// unresolved expression: the one whose source file appears
    /// *least* often among the expression's tokens (§7 heuristic).
    pub fn from_tokens(tokens: &[Token], message: impl Into<String>) -> Self {
        let mut per_file: Vec<(std::rc::Rc<str>, usize)> = Vec::new();
        for t in tokens {
            if let Some(entry) = per_file.iter_mut().find(|(f, _)| *f == t.file) {
                entry.1 += 1;
            } else {
                per_file.push((t.file.clone(), 1));
            }
        }
        per_file.sort_by_key(|(_, count)| *count);
        let message = message.into();
        if let Some((rarest, _)) = per_file.first() {
            if let Some(token) = tokens.iter().find(|t| t.file == *rarest) {
                return AssemblerError::at(token, message);
            }
        }
        AssemblerError::bare(message)
    }
}

impl fmt::Debug for AssemblerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AssemblerError {}

pub type Result<T> = std::result::Result<T, AssemblerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{TokenKind, TokenValue};
    use std::rc::Rc;

    fn tok(file: &str) -> Token {
        Token::new(TokenKind::Id, TokenValue::Text(file.into()), 1, Rc::from(file))
    }

    #[test]
    fn from_tokens_picks_the_token_from_the_rarest_source_file() {
        let tokens = vec![tok("common.asm"), tok("common.asm"), tok("odd_one_out.asm")];
        let err = AssemblerError::from_tokens(&tokens, "symbol not found");
        assert_eq!(err.token.unwrap().file.as_ref(), "odd_one_out.asm");
    }

    #[test]
    fn from_tokens_with_no_tokens_has_no_anchor() {
        let err = AssemblerError::from_tokens(&[], "symbol not found");
        assert!(err.token.is_none());
    }
}
