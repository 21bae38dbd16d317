// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The assembler driver: walks a token stream at statement granularity,
//! dispatching directives, macro calls, data emission, and symbol
//! definitions, and accumulating [`Section`]s, labels, and constants.
//! `link`/`rom` operate on the state this module builds up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::ast::{parse_expression, AstKind, AstNode};
use crate::builtin::{self, BuiltinContext, ConstantValue, FunctionType};
use crate::error::{AssemblerError, Result};
use crate::eval::{self, Resolution};
use crate::foreign::{self, ForeignObject};
use crate::gfx::{self, GfxOptions};
use crate::layout::Layout;
use crate::macrodb::{Macro, MacroDb};
use crate::section::Section;
use crate::token::{Op, Token, TokenKind, TokenValue, Tokenizer};

/// Why a parameter run ends, and how the original end token is used
/// afterward. Mirrors the two shapes `_fetch_parameters`'s
/// `params_end` argument takes: a bare sentinel kind, or a pair of
/// kinds whose matching token the caller needs (statement dispatch
/// needs to know whether a call ended at `NEWLINE` or `{`).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ParamsEnd {
    Newline,
    LBrace,
    RParen,
    NewlineOrLBrace,
}

impl ParamsEnd {
    fn matches(self, kind: &TokenKind) -> bool {
        match self {
            ParamsEnd::Newline => matches!(kind, TokenKind::Newline | TokenKind::Eof),
            ParamsEnd::LBrace => *kind == TokenKind::Op(Op::LBrace),
            ParamsEnd::RParen => *kind == TokenKind::Op(Op::RParen),
            ParamsEnd::NewlineOrLBrace => {
                matches!(kind, TokenKind::Newline | TokenKind::Eof) || *kind == TokenKind::Op(Op::LBrace)
            }
        }
    }

    fn is_newline_only(self) -> bool {
        matches!(self, ParamsEnd::Newline)
    }
}

/// An entry on the block-macro stack: an in-progress statement macro
/// waiting for its closing `}` (to play `post_contents` or a chain),
/// or the sentinel pushed by a true `#IF` branch.
enum Frame {
    Macro(Macro, HashMap<String, Vec<Token>>),
    IfBranch,
}

pub struct Assembler {
    macro_db: MacroDb,
    func_db: MacroDb,
    constants: HashMap<String, ConstantValue>,
    pub(crate) labels: HashMap<String, (usize, i64)>,
    pub(crate) sections: Vec<Section>,
    current_scope: Option<String>,
    include_paths: Vec<PathBuf>,
    pub(crate) layouts: HashMap<String, Layout>,
    pub(crate) rom: Option<Vec<u8>>,
    pub(crate) post_build_link: Vec<(usize, usize, u8, AstNode)>,
    section_stack: Vec<usize>,
    block_macro_stack: Vec<Frame>,
    user_stack: HashMap<String, Vec<i64>>,
    pub(crate) allocation_done: bool,
    anonymous_label_count: i64,
    /// Set by the linker around resolving a given section's holes and
    /// asserts, so that `BANK(@)` inside that section's expressions
    /// resolves against the section actually being linked.
    pub(crate) current_link_section: Option<usize>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            macro_db: MacroDb::new(),
            func_db: MacroDb::new(),
            constants: HashMap::new(),
            labels: HashMap::new(),
            sections: Vec::new(),
            current_scope: None,
            include_paths: Vec::new(),
            layouts: HashMap::new(),
            rom: None,
            post_build_link: Vec::new(),
            section_stack: Vec::new(),
            block_macro_stack: Vec::new(),
            user_stack: HashMap::new(),
            allocation_done: false,
            anonymous_label_count: 0,
            current_link_section: None,
        }
    }

    pub fn set_linking_section(&mut self, section_idx: Option<usize>) {
        self.current_link_section = section_idx;
    }

    pub fn layouts(&self) -> &HashMap<String, Layout> {
        &self.layouts
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, &str, i64)> {
        self.labels.iter().map(|(name, (section_idx, offset))| {
            (name.as_str(), self.sections[*section_idx].name.as_str(), *offset)
        })
    }

    pub fn get_sections(&self, layout_name: &str) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(move |s| s.layout == layout_name)
    }

    /// Adds a directory to the `#INCLUDE`/`#INCBIN`/`#INCGFX`/foreign-object
    /// search path, searched in the order added before the file's own
    /// directory (which `process_file` pushes automatically).
    pub fn add_include_path(&mut self, dir: PathBuf) {
        self.include_paths.push(dir);
    }

    /// Lists each section's placed bytes with label markers inline,
    /// for the CLI's `--dump` flag.
    pub fn dump(&self) {
        println!("\nOutput dump:");
        for (idx, section) in self.sections.iter().enumerate() {
            println!(
                "Section: {}[{:02x}]:{}:{:04x}",
                section.layout,
                section.bank.unwrap_or(0),
                section.name,
                section.base_address
            );
            let mut offset_to_label: HashMap<i64, &str> = HashMap::new();
            for (label, (section_idx, offset)) in &self.labels {
                if *section_idx == idx {
                    offset_to_label.insert(*offset, label.as_str());
                }
            }

            let mut column = 0usize;
            for (offset, byte) in section.data.iter().enumerate() {
                if let Some(label) = offset_to_label.get(&(offset as i64)) {
                    if column > 0 {
                        println!();
                        column = 0;
                    }
                    println!("{label}:");
                }
                if column == 0 {
                    print!(" ");
                }
                print!(" {byte:02X}");
                column += 1;
                if column == 16 {
                    println!();
                    column = 0;
                }
            }
            if column > 0 {
                println!();
            }
            if let Some(label) = offset_to_label.get(&(section.data.len() as i64)) {
                println!("{label}:");
            }
        }
    }

    pub fn process_file(&mut self, filename: &Path) -> Result<()> {
        if let Some(dir) = filename.parent() {
            self.include_paths.push(dir.to_path_buf());
        }
        let result = self.process_file_inner(filename);
        self.include_paths.pop();
        result
    }

    fn process_file_inner(&mut self, filename: &Path) -> Result<()> {
        log::info!("Processing file: {}", filename.display());
        let code = std::fs::read_to_string(filename)
            .map_err(|e| AssemblerError::bare(format!("Failed to read {}: {e}", filename.display())))?;
        self.process_code(&code, &filename.to_string_lossy())
    }

    fn include_file(&mut self, filename: &Token) -> Result<()> {
        let name = filename.as_str().unwrap_or("");
        for dir in &self.include_paths {
            let full = dir.join(name);
            if full.exists() {
                return self.process_file(&full);
            }
        }
        if Path::new(name).exists() {
            return self.process_file(Path::new(name));
        }
        Err(AssemblerError::at(filename, "Include not found"))
    }

    fn resolve_include_path(&self, filename: &Token) -> Result<PathBuf> {
        let name = filename.as_str().unwrap_or("");
        for dir in &self.include_paths {
            let full = dir.join(name);
            if full.exists() {
                return Ok(full);
            }
        }
        if Path::new(name).exists() {
            return Ok(PathBuf::from(name));
        }
        Err(AssemblerError::at(filename, "Include not found"))
    }

    /// Processes one file's (or one included file's) worth of source
    /// text. Resets the per-file scope and stacks, matching the
    /// original's `process_code`, which is re-entered once per
    /// `#INCLUDE`.
    pub fn process_code(&mut self, code: &str, filename: &str) -> Result<()> {
        let saved_sections = std::mem::take(&mut self.section_stack);
        let saved_blocks = std::mem::take(&mut self.block_macro_stack);
        let saved_scope = self.current_scope.take();

        let mut tok = Tokenizer::new();
        self.seed_constants(&mut tok);
        tok.add_code(code, filename)?;
        let result = self.process_statements(&mut tok);

        self.section_stack = saved_sections;
        self.block_macro_stack = saved_blocks;
        self.current_scope = saved_scope;
        result
    }

    fn seed_constants(&self, tok: &mut Tokenizer) {
        for (name, value) in &self.constants {
            tok.set_constant_text(name, constant_text(value));
        }
    }

    fn process_statements(&mut self, tok: &mut Tokenizer) -> Result<()> {
        loop {
            let start = tok.pop();
            if start.kind == TokenKind::Newline {
                continue;
            }
            if start.kind == TokenKind::Eof {
                break;
            }
            if start.kind == TokenKind::Directive {
                self.dispatch_directive(&start, tok)?;
                continue;
            }
            if start.kind == TokenKind::Id && tok.peek().is_op(Op::Assign) {
                tok.pop();
                self.assign_constant(&start, tok)?;
                continue;
            }
            if start.kind == TokenKind::Id && tok.peek().kind == TokenKind::Label {
                tok.pop();
                self.define_label(&start)?;
                continue;
            }
            if start.kind == TokenKind::Label {
                self.define_anonymous_label(&start)?;
                continue;
            }
            if start.is_id("DS") {
                self.emit_ds(&start, tok)?;
                continue;
            }
            if start.is_id("DB") {
                self.emit_db(&start, tok)?;
                continue;
            }
            if start.is_id("DW") {
                self.emit_dw(&start, tok)?;
                continue;
            }
            if start.kind == TokenKind::Id {
                self.process_statement_macro(&start, tok)?;
                continue;
            }
            if start.is_op(Op::RBrace) {
                self.close_brace(tok)?;
                continue;
            }
            return Err(AssemblerError::at(&start, "Syntax error"));
        }
        if !self.section_stack.is_empty() {
            return Err(AssemblerError::bare("End of file reached with section open"));
        }
        Ok(())
    }

    fn dispatch_directive(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let name = start.as_str().unwrap_or("").to_ascii_uppercase();
        match name.as_str() {
            "MACRO" => self.add_macro(tok),
            "FMACRO" => self.add_function(tok),
            "INCLUDE" => self.directive_include(start, tok),
            "INCBIN" => self.directive_incbin(start, tok),
            "INCGFX" => self.directive_incgfx(start, tok),
            "INCRGBDS" => self.directive_foreign(start, tok, foreign::rgbds::read),
            "INCSDCC" => self.directive_foreign(start, tok, foreign::sdcc::read),
            "LAYOUT" => self.define_layout(start, tok),
            "SECTION" => self.start_section(start, tok),
            "ASSERT" => self.directive_assert(tok),
            "PRINT" => self.directive_print(tok),
            "IF" => self.directive_if(start, tok),
            "FOR" => self.directive_for(start, tok),
            "PUSH" => self.directive_push(start, tok),
            "POP" => self.directive_pop(start, tok),
            _ => Err(AssemblerError::at(start, format!("Unknown directive: #{name}"))),
        }
    }

    // ---- fetch_parameters / bracket_param / process_expression ----

    /// Splits a parameter list at top-level commas up to `end`,
    /// resolving nested `FUNC` calls along the way: known built-ins
    /// just widen the bracket depth (the tokenizer already consumed
    /// their `(`); unknown ones are looked up in the function database
    /// and their (argument-substituted) body is spliced directly into
    /// the current parameter, never appearing as tokens themselves.
    /// `.`-prefixed identifiers are rewritten to the current scope as
    /// they're captured.
    fn fetch_parameters(&mut self, tok: &mut Tokenizer, end: ParamsEnd) -> Result<(Vec<Vec<Token>>, Token)> {
        let mut params: Vec<Vec<Token>> = Vec::new();
        if end.matches(&tok.peek().kind) {
            let end_token = tok.pop();
            return Ok((params, end_token));
        }
        let mut param: Vec<Token> = Vec::new();
        params.push(Vec::new());
        let mut brackets = 0i32;
        let end_token;
        loop {
            if brackets == 0 && end.matches(&tok.peek().kind) {
                end_token = tok.pop();
                break;
            }
            let t = tok.pop();
            if t.kind == TokenKind::Eof {
                if !end.is_newline_only() {
                    return Err(AssemblerError::at(&t, "Unexpected end of file"));
                }
                end_token = t;
                break;
            }
            if t.kind == TokenKind::Func {
                let name = t.as_str().unwrap_or("").to_ascii_uppercase();
                if builtin::function_type(&name).is_some() {
                    brackets += 1;
                } else {
                    let (fargs, _) = self.fetch_parameters(tok, ParamsEnd::RParen)?;
                    let func = self
                        .func_db
                        .get(&name, &fargs)
                        .ok_or_else(|| AssemblerError::at(&t, format!("Function not found: {name}")))?;
                    let (func, func_args) = func;
                    for token in &func.contents {
                        if token.kind == TokenKind::Id {
                            if let Some(bound) = func_args.get(token.as_str().unwrap_or("")) {
                                param.extend(bound.iter().cloned());
                                continue;
                            }
                        }
                        param.push(token.clone());
                    }
                    continue;
                }
            } else if matches!(t.kind, TokenKind::Op(Op::LParen) | TokenKind::Op(Op::LBracket) | TokenKind::Op(Op::LBrace)) {
                brackets += 1;
            } else if matches!(t.kind, TokenKind::Op(Op::RParen) | TokenKind::Op(Op::RBracket) | TokenKind::Op(Op::RBrace)) {
                brackets -= 1;
                if brackets < 0 {
                    return Err(AssemblerError::at(&t, "Syntax error"));
                }
            }
            if t.is_op(Op::Comma) && brackets == 0 {
                params.push(std::mem::take(&mut param));
            } else {
                let t = self.rewrite_local_label(t);
                param.push(t);
            }
        }
        *params.last_mut().expect("params always has at least one entry") = param;
        Ok((params, end_token))
    }

    fn rewrite_local_label(&self, t: Token) -> Token {
        if t.kind == TokenKind::Id && t.as_str().is_some_and(|s| s.starts_with('.')) {
            let scope = self.current_scope.as_deref().unwrap_or("");
            let name = format!("{scope}{}", t.as_str().unwrap_or(""));
            return Token::new(TokenKind::Id, TokenValue::Text(name), t.line, t.file);
        }
        t
    }

    /// `id[args]` bracket-parameter parsing. `args` are fully resolved
    /// (not merely parsed) so that arithmetic in a bracket, e.g.
    /// `BANKED[0, 1+2]`, actually folds to a number rather than being
    /// rejected downstream -- the original only parses these, which
    /// would leave such an expression unresolved.
    ///
    /// A flag-style option with no brackets at all (`UNIQUE`) yields no
    /// arguments. An *empty* bracket pair (`UNIQUE[]`) also yields no
    /// arguments: `#INCGFX`'s flag options are written this way, and
    /// running the empty token list through expression parsing would
    /// otherwise fail at end-of-input.
    fn bracket_param(&mut self, tokens: Vec<Token>, arg_count: Option<usize>) -> Result<(Token, Vec<AstNode>)> {
        let mut iter = tokens.into_iter();
        let name = iter.next().ok_or_else(|| AssemblerError::bare("Syntax error"))?;
        if name.kind != TokenKind::Id {
            return Err(AssemblerError::at(&name, "Syntax error"));
        }
        let rest: Vec<Token> = iter.collect();
        if rest.is_empty() {
            if arg_count.is_some() {
                return Err(AssemblerError::at(&name, "Expected '['"));
            }
            return Ok((name, Vec::new()));
        }
        if rest[0].kind != TokenKind::Op(Op::LBracket) {
            return Err(AssemblerError::at(&rest[0], "Expected '['"));
        }
        let last = rest.last().expect("checked non-empty above");
        if last.kind != TokenKind::Op(Op::RBracket) {
            return Err(AssemblerError::at(last, "Expected ']'"));
        }
        let inner = rest[1..rest.len() - 1].to_vec();
        let mut t = Tokenizer::new();
        self.seed_constants(&mut t);
        t.prepend(inner);
        let (params, _) = self.fetch_parameters(&mut t, ParamsEnd::Newline)?;
        if params.len() == 1 && params[0].is_empty() {
            if let Some(n) = arg_count {
                if n != 0 {
                    return Err(AssemblerError::at(&name, "Wrong number of parameters"));
                }
            }
            return Ok((name, Vec::new()));
        }
        if let Some(n) = arg_count {
            if params.len() != n {
                return Err(AssemblerError::at(&name, "Wrong number of parameters"));
            }
        }
        let mut out = Vec::with_capacity(params.len());
        for param in params {
            let expr = self.process_expression(param)?;
            let resolved = eval::resolve(self, None, expr)?;
            out.push(resolved.into_node());
        }
        Ok((name, out))
    }

    /// Resolves `FUNC` tokens and known constants in a raw parameter
    /// token run, then parses the remainder as an expression.
    ///
    /// `macro`-typed built-ins (`STRLEN`, `DEFINED`) splice their
    /// result back into the token list and restart the scan; any other
    /// function type stops substitution -- from that point on, parsing
    /// proceeds over the untouched remainder, so a constant occurring
    /// after the first non-macro `FUNC` will not be substituted here.
    /// This is source behavior, preserved as-is.
    ///
    /// Unlike the original, a substituted constant keeps its actual
    /// type (`Number` or `Text`) rather than always becoming a
    /// `NUMBER` token, so string-valued constants behave correctly.
    pub(crate) fn process_expression(&mut self, mut tokens: Vec<Token>) -> Result<AstNode> {
        let mut idx = 0;
        while idx < tokens.len() {
            let start = tokens[idx].clone();
            if start.kind == TokenKind::Func {
                let mut args: Vec<Vec<Token>> = Vec::new();
                let mut arg: Vec<Token> = Vec::new();
                let mut brackets = 0i32;
                let mut end_idx = None;
                let mut j = idx + 1;
                while j < tokens.len() {
                    let t = tokens[j].clone();
                    if t.is_op(Op::RParen) && brackets == 0 {
                        if !arg.is_empty() {
                            args.push(std::mem::take(&mut arg));
                        }
                        end_idx = Some(j);
                        break;
                    } else if t.is_op(Op::Comma) && brackets == 0 {
                        args.push(std::mem::take(&mut arg));
                    } else {
                        if t.kind == TokenKind::Func {
                            brackets += 1;
                        } else if t.is_op(Op::RParen) {
                            brackets -= 1;
                        }
                        arg.push(t);
                    }
                    j += 1;
                }
                let end_idx = end_idx
                    .ok_or_else(|| AssemblerError::at(&start, format!("Function not closed: {}", start.text())))?;
                let name = start.as_str().unwrap_or("").to_ascii_uppercase();
                if name == "DEFINED" {
                    if args.len() != 1 || args[0].len() != 1 {
                        return Err(AssemblerError::at(&start, "DEFINED requires 1 argument"));
                    }
                    let id = args[0][0]
                        .as_str()
                        .ok_or_else(|| AssemblerError::at(&start, "DEFINED requires an identifier"))?;
                    let found = i64::from(self.constants.contains_key(id));
                    let replacement = Token::new(TokenKind::Number, TokenValue::Number(found), start.line, start.file.clone());
                    tokens.splice(idx..=end_idx, [replacement]);
                    idx = 0;
                    continue;
                }
                let kind = builtin::function_type(&name)
                    .ok_or_else(|| AssemblerError::bare("fetch_parameters allowed a non-builtin through?"))?;
                if kind == FunctionType::Macro {
                    let contents = builtin::call_macro(&name, &args)?;
                    tokens.splice(idx..=end_idx, contents);
                    idx = 0;
                    continue;
                }
                return parse_expression(tokens, self.anonymous_label_count);
            }
            if start.kind == TokenKind::Id {
                let name = start.as_str().unwrap_or("");
                if let Some(value) = self.constants.get(name) {
                    let replacement = match value {
                        ConstantValue::Number(n) => {
                            Token::new(TokenKind::Number, TokenValue::Number(*n), start.line, start.file.clone())
                        }
                        ConstantValue::Text(s) => {
                            Token::new(TokenKind::String, TokenValue::Text(s.clone()), start.line, start.file.clone())
                        }
                    };
                    tokens[idx] = replacement;
                }
            }
            idx += 1;
        }
        parse_expression(tokens, self.anonymous_label_count)
    }

    // ---- symbols ----

    fn assign_constant(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.len() != 1 {
            return Err(AssemblerError::at(start, "Syntax error"));
        }
        let expr = self.process_expression(params.into_iter().next().unwrap())?;
        let resolved = eval::resolve(self, None, expr)?;
        let node = resolved.into_node();
        let value = match (&node.kind, node.token.kind.clone()) {
            (AstKind::Value, TokenKind::Number) => ConstantValue::Number(node.token.as_number().unwrap_or(0)),
            (AstKind::Value, TokenKind::String) => ConstantValue::Text(node.token.as_str().unwrap_or("").to_string()),
            _ => return Err(AssemblerError::at(&node.token, "Assignment requires constant expression")),
        };
        self.constants.insert(start.as_str().unwrap_or("").to_string(), value);
        Ok(())
    }

    fn define_label(&mut self, start: &Token) -> Result<()> {
        let raw = start.as_str().unwrap_or("").to_string();
        let label = if raw.starts_with('.') {
            format!("{}{}", self.current_scope.as_deref().unwrap_or(""), raw)
        } else {
            if !raw.starts_with("__") {
                self.current_scope = Some(raw.clone());
            }
            raw
        };
        self.place_label(start, label)
    }

    fn define_anonymous_label(&mut self, start: &Token) -> Result<()> {
        self.anonymous_label_count += 1;
        let label = format!("__anonymous_{}", self.anonymous_label_count);
        self.place_label(start, label)
    }

    fn place_label(&mut self, start: &Token, label: String) -> Result<()> {
        if self.labels.contains_key(&label) {
            return Err(AssemblerError::at(start, "Duplicate label"));
        }
        let section_idx = *self
            .section_stack
            .last()
            .ok_or_else(|| AssemblerError::at(start, "Trying to place label outside of section"))?;
        let offset = self.sections[section_idx].len() as i64;
        self.labels.insert(label, (section_idx, offset));
        Ok(())
    }

    // ---- data emission ----

    fn emit_ds(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let section_idx = self.current_section(start)?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        for param in params {
            let expr = self.process_expression(param)?;
            let offset = self.sections[section_idx].len() as i64;
            let resolved = eval::resolve(self, Some(offset), expr)?;
            let node = resolved.into_node();
            if !node.is_number() {
                return Err(AssemblerError::at(&node.token, "DS needs a constant number"));
            }
            let n = node.token.as_number().unwrap_or(0);
            if n < 0 {
                return Err(AssemblerError::at(&node.token, "DS needs a positive number"));
            }
            self.sections[section_idx].data.extend(std::iter::repeat(0u8).take(n as usize));
        }
        Ok(())
    }

    fn emit_db(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let section_idx = self.current_section(start)?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        for param in params {
            let expr = self.process_expression(param)?;
            let offset = self.sections[section_idx].len() as i64;
            let resolved = eval::resolve(self, Some(offset), expr)?.into_node();
            self.sections[section_idx].add8(resolved);
        }
        Ok(())
    }

    fn emit_dw(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let section_idx = self.current_section(start)?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        for param in params {
            let expr = self.process_expression(param)?;
            let offset = self.sections[section_idx].len() as i64;
            let resolved = eval::resolve(self, Some(offset), expr)?.into_node();
            self.sections[section_idx].add16(resolved);
        }
        Ok(())
    }

    fn current_section(&self, start: &Token) -> Result<usize> {
        self.section_stack
            .last()
            .copied()
            .ok_or_else(|| AssemblerError::at(start, "Expression outside of section"))
    }

    // ---- directives ----

    fn directive_include(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.len() != 1 || params[0].len() != 1 || params[0][0].kind != TokenKind::String {
            return Err(AssemblerError::at(start, "Syntax error"));
        }
        self.include_file(&params[0][0])
    }

    fn directive_incbin(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let section_idx = self.current_section(start)?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.len() != 1 || params[0].len() != 1 || params[0][0].kind != TokenKind::String {
            return Err(AssemblerError::at(start, "Syntax error"));
        }
        let path = self.resolve_include_path(&params[0][0])?;
        let bytes = std::fs::read(&path)
            .map_err(|e| AssemblerError::at(&params[0][0], format!("Failed to read {}: {e}", path.display())))?;
        self.sections[section_idx].data.extend(bytes);
        Ok(())
    }

    fn directive_incgfx(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let section_idx = self.current_section(start)?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.is_empty() || params[0].len() != 1 || params[0][0].kind != TokenKind::String {
            return Err(AssemblerError::at(start, "Syntax error"));
        }
        let path = self.resolve_include_path(&params[0][0])?;
        let mut opts = GfxOptions::default();
        for param in params.into_iter().skip(1) {
            let (key, value) = self.bracket_param(param, None)?;
            match key.as_str().unwrap_or("").to_ascii_uppercase().as_str() {
                "TILEHEIGHT" => {
                    let n = value.first().and_then(|v| v.token.as_number()).ok_or_else(|| {
                        AssemblerError::at(&key, "TILEHEIGHT requires an argument")
                    })?;
                    opts.tileheight = Some(n as u32);
                }
                "COLORMAP" => {
                    if value.len() != 4 {
                        return Err(AssemblerError::at(&key, "COLORMAP requires 4 arguments"));
                    }
                    let mut colors = [0u32; 4];
                    for (i, v) in value.iter().enumerate() {
                        colors[i] = v.token.as_number().unwrap_or(0) as u32;
                    }
                    opts.colormap = Some(colors);
                }
                "UNIQUE" => opts.unique = true,
                "TILEMAP" => opts.tilemap = true,
                "RANGE" => {
                    if value.len() != 2 {
                        return Err(AssemblerError::at(&key, "RANGE requires 2 arguments"));
                    }
                    let start_n = value[0].token.as_number().unwrap_or(0) as usize;
                    let end_n = value[1].token.as_number().unwrap_or(0) as usize;
                    opts.range = Some((start_n, end_n));
                }
                "DEBUG" => opts.debug = true,
                other => return Err(AssemblerError::at(&key, format!("Unknown #INCGFX parameter: {other}"))),
            }
        }
        let data = gfx::read(&path, &opts)?;
        self.sections[section_idx].data.extend(data);
        Ok(())
    }

    fn directive_foreign(
        &mut self,
        start: &Token,
        tok: &mut Tokenizer,
        reader: fn(&Path) -> Result<ForeignObject>,
    ) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.len() != 1 || params[0].len() != 1 || params[0][0].kind != TokenKind::String {
            return Err(AssemblerError::at(start, "Syntax error"));
        }
        let path = self.resolve_include_path(&params[0][0])?;
        let object = reader(&path)?;
        let base = self.sections.len();
        for section in object.sections {
            let mut s = Section::new(section.layout, section.name, section.name_token);
            s.base_address = section.base_address;
            s.bank = section.bank;
            s.data = section.data;
            for (offset, size, node) in section.holes {
                s.holes.insert(offset, (size, node));
            }
            self.sections.push(s);
        }
        for label in object.labels {
            let label_name = label.name;
            if self.labels.contains_key(&label_name) {
                return Err(AssemblerError::at(start, "Duplicate label"));
            }
            self.labels.insert(label_name, (base + label.section_index, label.offset));
        }
        Ok(())
    }

    fn define_layout(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.is_empty() {
            return Err(AssemblerError::at(start, "Expected name of section layout"));
        }
        let mut iter = params.into_iter();
        let (name, bounds) = self.bracket_param(iter.next().unwrap(), Some(2))?;
        if self.layouts.contains_key(name.as_str().unwrap_or("")) {
            return Err(AssemblerError::at(start, "Duplicate layout name"));
        }
        let start_addr = bounds[0].token.as_number().unwrap_or(0);
        let end_addr = bounds[1].token.as_number().unwrap_or(0);
        let mut layout = Layout::new(name.as_str().unwrap_or("").to_string(), start_addr, end_addr);
        for param in iter {
            let (key, value) = self.bracket_param(param, None)?;
            match key.as_str().unwrap_or("").to_ascii_uppercase().as_str() {
                "AT" => {
                    let v = value.first().ok_or_else(|| AssemblerError::at(&key, "AT requires an argument"))?;
                    layout.rom_location = Some(v.token.as_number().unwrap_or(0));
                }
                "BANKED" => {
                    if value.len() > 2 {
                        return Err(AssemblerError::at(&key, "BANKED expects at most 2 arguments"));
                    }
                    if value.len() > 1 {
                        layout.bank_max = Some(value[1].token.as_number().unwrap_or(0));
                    }
                    if !value.is_empty() {
                        layout.bank_min = value[0].token.as_number().unwrap_or(0);
                    }
                    layout.banked = true;
                }
                other => return Err(AssemblerError::at(&key, format!("Unknown parameter to #LAYOUT: {other}"))),
            }
        }
        self.layouts.insert(layout.name.clone(), layout);
        Ok(())
    }

    fn start_section(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::LBrace)?;
        if params.len() < 2 {
            return Err(AssemblerError::at(start, "Expected name and type of section"));
        }
        let mut iter = params.into_iter();
        let name_param = iter.next().unwrap();
        let type_param = iter.next().unwrap();
        let name_expr = self.process_expression(name_param)?;
        if !name_expr.is_string() {
            return Err(AssemblerError::at(&name_expr.token, "Expected name of section"));
        }
        let section_name = name_expr.token.as_str().unwrap_or("").to_string();
        if self.sections.iter().any(|s| s.name == section_name) {
            return Err(AssemblerError::at(&name_expr.token, "Duplicate section name"));
        }
        let (section_type, type_args) = self.bracket_param(type_param, None)?;
        let mut address = -1i64;
        if let Some(v) = type_args.first() {
            address = v.token.as_number().unwrap_or(-1);
        }
        let layout_name = section_type.as_str().unwrap_or("").to_string();
        let layout = self
            .layouts
            .get(&layout_name)
            .ok_or_else(|| AssemblerError::at(&section_type, "Section type not found"))?
            .clone();
        if address > -1 && !(layout.start_addr <= address && address < layout.end_addr) {
            return Err(AssemblerError::at(&section_type, "Address out of range for section"));
        }
        let mut section = Section::new(layout.name.clone(), section_name, name_expr.token);
        section.base_address = address;
        for param in iter {
            let (key, value) = self.bracket_param(param, None)?;
            match key.as_str().unwrap_or("").to_ascii_uppercase().as_str() {
                "BANK" => {
                    let v = value.first().ok_or_else(|| AssemblerError::at(&key, "BANK requires an argument"))?;
                    if !layout.banked {
                        return Err(AssemblerError::at(&key, "Cannot assign a bank to an unbanked section"));
                    }
                    let bank = v.token.as_number().unwrap_or(0);
                    if bank < layout.bank_min {
                        return Err(AssemblerError::at(&key, format!("Bank number need to be at least {}", layout.bank_min)));
                    }
                    if layout.bank_max.is_some_and(|max| bank >= max) {
                        return Err(AssemblerError::at(&key, format!("Bank number needs to be lower then {}", layout.bank_max.unwrap())));
                    }
                    section.bank = Some(bank);
                }
                other => return Err(AssemblerError::at(&key, format!("Unknown parameter to #SECTION: {other}"))),
            }
        }
        self.section_stack.push(self.sections.len());
        self.sections.push(section);
        Ok(())
    }

    /// Records one or more assert conditions against the current
    /// section, to be resolved (and only then checked) by the linker.
    /// A string argument anywhere in the parameter list supplies the
    /// failure message for every condition in the same `#ASSERT`.
    fn directive_assert(&mut self, tok: &mut Tokenizer) -> Result<()> {
        let section_idx = *self
            .section_stack
            .last()
            .ok_or_else(|| AssemblerError::bare("Expression outside of section"))?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        let mut message = String::new();
        let mut conditions = Vec::new();
        for param in params {
            let expr = self.process_expression(param)?;
            if expr.is_string() {
                message = expr.token.as_str().unwrap_or("").to_string();
            } else {
                conditions.push(expr);
            }
        }
        for condition in conditions {
            self.sections[section_idx].add_assert(condition, message.clone());
        }
        Ok(())
    }

    fn directive_print(&mut self, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        let mut parts = Vec::new();
        for param in params {
            let expr = self.process_expression(param)?;
            let resolved = eval::resolve(self, None, expr)?.into_node();
            parts.push(print_repr(&resolved));
        }
        println!("{}", parts.join(" "));
        Ok(())
    }

    fn directive_if(&mut self, _start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::LBrace)?;
        let mut allow = true;
        for condition in params {
            let expr = self.process_expression(condition)?;
            let resolved = eval::resolve(self, None, expr)?.into_node();
            if !resolved.is_number() {
                return Err(AssemblerError::at(&resolved.token, "#IF needs a constant expression"));
            }
            allow = allow && resolved.token.as_number().unwrap_or(0) != 0;
        }
        if allow {
            self.block_macro_stack.push(Frame::IfBranch);
        } else {
            self.get_raw_macro_block(tok)?;
        }
        Ok(())
    }

    /// `#FOR var, begin, end { body }`: absent from the reference
    /// implementation snapshot this was ported from, but required by
    /// the concrete test scenarios. `begin`/`end` are fully resolved
    /// (not merely parsed) so arithmetic bounds work; the body is
    /// substituted once per iteration and the whole run prepended in
    /// one shot rather than one `prepend` per iteration, keeping
    /// iteration order intact under the head-splice model.
    fn directive_for(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::LBrace)?;
        if params.len() != 3 {
            return Err(AssemblerError::at(start, "#FOR requires 3 parameters: var, begin, end"));
        }
        let var_name = params[0]
            .first()
            .filter(|t| t.kind == TokenKind::Id)
            .ok_or_else(|| AssemblerError::at(start, "First parameter of #FOR should be a variable name"))?
            .as_str()
            .unwrap_or("")
            .to_string();
        let begin_expr = self.process_expression(params[1].clone())?;
        let begin = eval::resolve(self, None, begin_expr)?.into_node();
        let end_expr = self.process_expression(params[2].clone())?;
        let end = eval::resolve(self, None, end_expr)?.into_node();
        if !begin.is_number() || !end.is_number() {
            return Err(AssemblerError::at(start, "#FOR bounds must be constant expressions"));
        }
        let begin_n = begin.token.as_number().unwrap_or(0);
        let end_n = end.token.as_number().unwrap_or(0);
        let body = self.get_raw_macro_block(tok)?;

        let step: i64 = match end_n.cmp(&begin_n) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Equal => return Ok(()),
        };
        let mut prepend: Vec<Token> = Vec::new();
        let mut n = begin_n;
        while n != end_n {
            for token in &body {
                if token.kind == TokenKind::Id && token.as_str() == Some(var_name.as_str()) {
                    prepend.push(Token::new(TokenKind::Number, TokenValue::Number(n), token.line, token.file.clone()));
                } else {
                    prepend.push(token.clone());
                }
            }
            n += step;
        }
        tok.prepend(prepend);
        Ok(())
    }

    fn directive_push(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.len() != 2 {
            return Err(AssemblerError::at(start, "#PUSH requires 2 parameters: [stack name], [value]"));
        }
        let mut iter = params.into_iter();
        let stack_name = self.process_expression(iter.next().unwrap())?;
        let value_expr = self.process_expression(iter.next().unwrap())?;
        let value = eval::resolve(self, None, value_expr)?.into_node();
        if stack_name.kind != AstKind::Value || stack_name.token.kind != TokenKind::Id {
            return Err(AssemblerError::at(start, "First parameter of #PUSH should be a stack name to push to"));
        }
        if !value.is_number() {
            return Err(AssemblerError::at(start, "Second parameter of #PUSH should be a value to push"));
        }
        let name = stack_name.token.as_str().unwrap_or("").to_string();
        self.user_stack.entry(name).or_default().push(value.token.as_number().unwrap_or(0));
        Ok(())
    }

    fn directive_pop(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
        if params.len() != 2 || params[1].len() != 1 {
            return Err(AssemblerError::at(start, "#PUSH requires 2 parameters: [stack name], [value]"));
        }
        let mut iter = params.into_iter();
        let stack_name_param = iter.next().unwrap();
        let value_token = iter.next().unwrap().into_iter().next().unwrap();
        let stack_name = self.process_expression(stack_name_param)?;
        if stack_name.kind != AstKind::Value || stack_name.token.kind != TokenKind::Id {
            return Err(AssemblerError::at(start, "First parameter of #POP should be a stack name to push to"));
        }
        if value_token.kind != TokenKind::Id {
            return Err(AssemblerError::at(start, "Second parameter of #POP should be a constant name to pop"));
        }
        let name = stack_name.token.as_str().unwrap_or("").to_string();
        let stack = self
            .user_stack
            .get_mut(&name)
            .ok_or_else(|| AssemblerError::at(start, format!("Stack {name} not found")))?;
        let value = stack
            .pop()
            .ok_or_else(|| AssemblerError::at(start, format!("Stack {name} is empty while trying to pop")))?;
        self.constants.insert(value_token.as_str().unwrap_or("").to_string(), ConstantValue::Number(value));
        Ok(())
    }

    // ---- macro / function definitions ----

    fn add_macro(&mut self, tok: &mut Tokenizer) -> Result<()> {
        let name = tok.expect(TokenKind::Id)?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::LBrace)?;
        let content = self.get_raw_macro_block(tok)?;
        let upper = name.as_str().unwrap_or("").to_ascii_uppercase();
        if self.macro_db.add(&upper, params.clone(), content).is_none() {
            self.macro_db.get_mut(&upper, &params);
        }
        let macro_ref = self
            .macro_db
            .get_mut(&upper, &params)
            .ok_or_else(|| AssemblerError::at(&name, "Duplicate macro definition"))?;
        if tok.peek().is_id("end") {
            tok.pop();
            tok.expect(TokenKind::Op(Op::LBrace))?;
            macro_ref.post_contents = self.get_raw_macro_block(tok)?;
        }
        loop {
            if tok.peek().kind != TokenKind::Id {
                break;
            }
            let chain_name = tok.pop();
            tok.expect(TokenKind::Op(Op::LBrace))?;
            let content = self.get_raw_macro_block(tok)?;
            let macro_ref = self
                .macro_db
                .get_mut(&upper, &params)
                .expect("macro was just inserted or already present");
            let chain_key = chain_name.as_str().unwrap_or("").to_string();
            macro_ref.add_chain(chain_key.clone(), content);
            if tok.peek().is_id("end") {
                tok.pop();
                tok.expect(TokenKind::Op(Op::LBrace))?;
                let post = self.get_raw_macro_block(tok)?;
                self.macro_db
                    .get_mut(&upper, &params)
                    .and_then(|m| m.chains.get_mut(&chain_key))
                    .expect("chain was just inserted")
                    .post_contents = post;
            }
        }
        if tok.matches_kind(&TokenKind::Op(Op::Gt)).is_some() {
            let macro_ref = self
                .macro_db
                .get_mut(&upper, &params)
                .expect("macro was just inserted or already present");
            if !macro_ref.post_contents.is_empty() || !macro_ref.chains.is_empty() {
                return Err(AssemblerError::at(&name, "Macros with chains/post actions cannot be linked to other macros"));
            }
            let linked_macro = tok.expect(TokenKind::Id)?;
            let (linked_params, _) = self.fetch_parameters(tok, ParamsEnd::Newline)?;
            macro_ref.linked = Some((linked_macro, linked_params));
        }
        Ok(())
    }

    fn get_raw_macro_block(&mut self, tok: &mut Tokenizer) -> Result<Vec<Token>> {
        let mut content = Vec::new();
        let mut bracket = 0i32;
        loop {
            let token = tok.pop_raw();
            if token.kind == TokenKind::Eof {
                return Err(AssemblerError::at(&token, "Unterminated macro definition"));
            }
            if token.is_op(Op::LBrace) {
                bracket += 1;
            }
            if token.is_op(Op::RBrace) {
                if bracket == 0 {
                    break;
                }
                bracket -= 1;
            }
            content.push(token);
        }
        if !content.last().is_some_and(|t| t.kind == TokenKind::Newline) {
            content.push(Token::new(TokenKind::Newline, TokenValue::None, 0, Rc::from("")));
        }
        Ok(content)
    }

    fn add_function(&mut self, tok: &mut Tokenizer) -> Result<()> {
        let name = tok.expect(TokenKind::Id)?;
        let (params, _) = self.fetch_parameters(tok, ParamsEnd::LBrace)?;
        let mut content = Vec::new();
        loop {
            let token = tok.pop_raw();
            if token.kind == TokenKind::Eof {
                return Err(AssemblerError::at(&token, "Unterminated function definition"));
            }
            if token.is_op(Op::RBrace) {
                break;
            }
            if token.kind == TokenKind::Newline {
                continue;
            }
            content.push(token);
        }
        self.func_db.add(&name.as_str().unwrap_or("").to_ascii_uppercase(), params, content);
        Ok(())
    }

    // ---- plain-statement macro dispatch ----

    fn process_statement_macro(&mut self, start: &Token, tok: &mut Tokenizer) -> Result<()> {
        let (params, end_token) = self.fetch_parameters(tok, ParamsEnd::NewlineOrLBrace)?;
        let name = start.as_str().unwrap_or("").to_ascii_uppercase();
        let (macro_, macro_args) = self
            .macro_db
            .get(&name, &params)
            .map(|(m, args)| (m.clone(), args))
            .ok_or_else(|| {
                AssemblerError::at(start, format!("Syntax error: {} {}", start.as_str().unwrap_or(""), params_to_string(&params)))
            })?;

        let mut prepend = substitute(&macro_.contents, &macro_args);

        if let Some((linked_head, linked_params)) = &macro_.linked {
            prepend.push(linked_head.clone());
            for (i, linked_param) in linked_params.iter().enumerate() {
                prepend.extend(substitute(linked_param, &macro_args));
                if i + 1 != linked_params.len() {
                    prepend.push(Token::new(TokenKind::Op(Op::Comma), TokenValue::None, 0, Rc::from("")));
                }
            }
            prepend.push(end_token);
        } else if end_token.is_op(Op::LBrace) {
            self.block_macro_stack.push(Frame::Macro(macro_, macro_args));
        } else if !macro_.post_contents.is_empty() {
            prepend.extend(substitute(&macro_.post_contents, &macro_args));
        }
        tok.prepend(prepend);
        Ok(())
    }

    fn close_brace(&mut self, tok: &mut Tokenizer) -> Result<()> {
        if let Some(frame) = self.block_macro_stack.pop() {
            match frame {
                Frame::IfBranch => {}
                Frame::Macro(macro_, macro_args) => {
                    let mut macro_contents = &macro_.post_contents;
                    let peeked = tok.peek();
                    if peeked.kind == TokenKind::Id {
                        let chain_name = peeked.as_str().unwrap_or("").to_string();
                        if let Some(chain) = macro_.chains.get(&chain_name) {
                            macro_contents = &chain.contents;
                            let prepend = substitute(macro_contents, &macro_args);
                            tok.pop();
                            tok.expect(TokenKind::Op(Op::LBrace))?;
                            self.block_macro_stack.push(Frame::Macro(chain.clone(), macro_args));
                            tok.prepend(prepend);
                            return Ok(());
                        }
                    }
                    let prepend = substitute(macro_contents, &macro_args);
                    tok.prepend(prepend);
                }
            }
            return Ok(());
        }
        if self.section_stack.pop().is_some() {
            return Ok(());
        }
        Err(AssemblerError::bare("Unexpected }"))
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

fn substitute(contents: &[Token], args: &HashMap<String, Vec<Token>>) -> Vec<Token> {
    let mut out = Vec::with_capacity(contents.len());
    for token in contents {
        if token.kind == TokenKind::Id {
            if let Some(bound) = args.get(token.as_str().unwrap_or("")) {
                out.extend(bound.iter().cloned());
                continue;
            }
        }
        out.push(token.clone());
    }
    out
}

fn tokens_to_string(tokens: &[Token]) -> String {
    let mut result = String::new();
    for t in tokens {
        match t.kind {
            TokenKind::Func => {
                result.push_str(t.as_str().unwrap_or(""));
                result.push('(');
            }
            TokenKind::String => {
                result.push('"');
                result.push_str(t.as_str().unwrap_or(""));
                result.push('"');
            }
            _ => result.push_str(&t.text()),
        }
    }
    result
}

fn params_to_string(params: &[Vec<Token>]) -> String {
    params.iter().map(|p| tokens_to_string(p)).collect::<Vec<_>>().join(", ")
}

fn print_repr(node: &AstNode) -> String {
    match node.token.kind {
        TokenKind::Number => node.token.as_number().unwrap_or(0).to_string(),
        TokenKind::String => node.token.as_str().unwrap_or("").to_string(),
        _ => node.token.text(),
    }
}

fn constant_text(value: &ConstantValue) -> String {
    match value {
        ConstantValue::Number(n) => n.to_string(),
        ConstantValue::Text(s) => s.clone(),
    }
}

impl BuiltinContext for Assembler {
    fn get_constant(&self, name: &str) -> Option<ConstantValue> {
        self.constants.get(name).cloned()
    }

    fn label_address(&self, name: &str) -> Option<i64> {
        let (section_idx, offset) = self.labels.get(name)?;
        let section = &self.sections[*section_idx];
        if section.base_address < 0 {
            return None;
        }
        Some(section.base_address + offset)
    }

    fn label_bank(&self, name: &str) -> Option<Option<i64>> {
        let (section_idx, _) = self.labels.get(name)?;
        Some(self.sections[*section_idx].bank)
    }

    fn linking_section_bank(&self) -> Option<Option<i64>> {
        self.current_link_section.map(|idx| self.sections[idx].bank)
    }

    fn allocation_done(&self) -> bool {
        self.allocation_done
    }

    fn max_bank_for_layout(&self, layout: &str) -> i64 {
        self.sections
            .iter()
            .filter(|s| s.layout == layout)
            .filter_map(|s| s.bank)
            .max()
            .unwrap_or(0)
    }

    fn rom(&self) -> Option<&[u8]> {
        self.rom.as_deref()
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
    fn local_labels_scope_under_the_last_global_label() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { dw label, label.part, __part\n\
             label: ds 1\n.part: ds 0\n__part: }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        assert_eq!(
            asm.sections[0].data,
            vec![0x06, 0x00, 0x07, 0x00, 0x08, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn bank_resolves_against_each_sections_own_bank() {
        let mut asm = build(
            "#LAYOUT ROM[0,$10], AT[0], BANKED[0,10]\n\
             #SECTION \"A\", ROM, BANK[0] { l0: db BANK(l0), BANK(l1) }\n\
             #SECTION \"B\", ROM, BANK[1] { l1: db $23 }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        assert_eq!(asm.sections[0].data, vec![0x00, 0x01]);
    }

    #[test]
    fn macro_lookup_prefers_constant_only_pattern_then_falls_back_to_hole() {
        let mut asm = build(
            "#MACRO T _a { db 0 }\n#MACRO T 1 { db 1 }\n\
             #LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { T 1\nT 2 }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        assert_eq!(asm.sections[0].data, vec![0x01, 0x00]);
    }

    #[test]
    fn for_loop_counts_up_and_down_by_the_sign_of_the_step() {
        let up = build("#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { #FOR n,0,10 { db n } }\n");
        assert_eq!(up.sections[0].data, (0..10).collect::<Vec<u8>>());

        let down = build("#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { #FOR n,10,0 { db n } }\n");
        assert_eq!(down.sections[0].data, (1..=10).rev().collect::<Vec<u8>>());
    }

    #[test]
    fn anonymous_labels_resolve_forward_and_backward() {
        let mut asm = build(
            "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { dw :+\n:\ndw :- }\n",
        );
        crate::link::link(&mut asm, false).unwrap();
        assert_eq!(asm.sections[0].data, vec![0x02, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn duplicate_label_definition_is_rejected() {
        let err = Assembler::new()
            .process_code(
                "#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { a: db 0\na: db 1 }\n",
                "test",
            )
            .unwrap_err();
        assert!(err.message.to_lowercase().contains("duplicate"));
    }

    #[test]
    fn if_directive_plays_back_the_taken_branch_only() {
        let asm = build(
            "X = 1\n#LAYOUT ROM0[$0000,$4000], AT[0]\n#SECTION \"S\", ROM0[0] { #IF X { db 1 } ELSE { db 2 } }\n",
        );
        assert_eq!(asm.sections[0].data, vec![0x01]);
    }
}
