//! The Brainforth dialect: named procedures over the CISC core, plus the
//! cell-stack operators `?` (push the current cell) and `!` (pop into the
//! current cell, 0 when the stack is empty).
//!
//! A program is a sequence of definitions `name [ body ]`. Brackets inside
//! a body are ordinary loops; a name inside a body calls that procedure,
//! forward references included. Bodies are lifted with the full peephole
//! machinery; `main` ends in HALT, every other procedure in RETURN.

use std::collections::{BTreeMap, VecDeque};

use crate::error::Error;
use crate::ir::{OpCode, Program, Record};
use crate::lift::{CodePlanter, Flags};
use crate::scan::Source;

const SYMBOLS: [char; 10] = ['+', '-', '<', '>', '.', ',', '[', ']', '?', '!'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Name(String),
    Symbol(char),
}

/// Split source text into names and command symbols. Anything that is
/// neither alphanumeric nor a command symbol separates tokens.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        if SYMBOLS.contains(&ch) {
            tokens.push(Token::Symbol(ch));
        } else if ch.is_alphanumeric() {
            let mut name = String::from(ch);
            while let Some(&next) = chars.peek() {
                if !next.is_alphanumeric() {
                    break;
                }
                name.push(next);
                chars.next();
            }
            tokens.push(Token::Name(name));
        }
    }
    tokens
}

/// Presents the symbol tokens as a command-character stream. A name token
/// is opaque to the character view: peeks stop short of it and `pop`
/// refuses to cross it, so scans inside the planter end at call sites.
pub struct TokenScanner {
    tokens: VecDeque<Token>,
    consumed: usize,
}

impl TokenScanner {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into(),
            consumed: 0,
        }
    }
    fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
    /// Pop the front token when it is a name.
    fn pop_name(&mut self) -> Option<String> {
        match self.tokens.front() {
            Some(Token::Name(_)) => match self.tokens.pop_front() {
                Some(Token::Name(name)) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Source for TokenScanner {
    fn peek_at(&mut self, n: usize) -> Option<char> {
        if self
            .tokens
            .iter()
            .take(n + 1)
            .any(|token| matches!(token, Token::Name(_)))
        {
            return None;
        }
        match self.tokens.get(n)? {
            Token::Symbol(ch) => Some(*ch),
            Token::Name(_) => None,
        }
    }
    fn pop(&mut self) -> Option<char> {
        match self.tokens.front() {
            Some(Token::Symbol(ch)) => {
                let ch = *ch;
                self.tokens.pop_front();
                self.consumed += 1;
                Some(ch)
            }
            _ => None,
        }
    }
    fn consumed(&self) -> usize {
        self.consumed
    }
    fn skip_opaque(&mut self) -> bool {
        if matches!(self.tokens.front(), Some(Token::Name(_))) {
            self.tokens.pop_front();
            true
        } else {
            false
        }
    }
}

/// Compile Brainforth source into named record sequences, `CALL`s left as
/// `Ref` records for [`crate::image::Image::from_bindings`] to resolve.
pub fn compile(source: &str, flags: Flags) -> Result<BTreeMap<String, Vec<Record>>, Error> {
    let mut scanner = TokenScanner::new(tokenize(source));
    let mut bindings = BTreeMap::new();
    while !scanner.is_empty() {
        let Some(name) = scanner.pop_name() else {
            return Err(Error::StrayCode {
                at: scanner.consumed(),
            });
        };
        if bindings.contains_key(&name) {
            return Err(Error::DuplicateProcedure(name));
        }
        if !scanner.try_consume('[') {
            return Err(Error::ExpectedBody(name));
        }
        let program = plant_body(&mut scanner, &name, flags)?;
        bindings.insert(name, program.into_records());
    }
    Ok(bindings)
}

fn plant_body(scanner: &mut TokenScanner, name: &str, flags: Flags) -> Result<Program, Error> {
    let mut planter = CodePlanter::new(flags);
    if name != "main" {
        planter.assume_unknown_cell();
    }
    loop {
        // The unmatched `]` at loop depth zero closes the definition.
        if planter.open_depth() == 0 && scanner.peek() == Some(']') {
            scanner.pop();
            let terminal = if name == "main" {
                OpCode::Halt
            } else {
                OpCode::Return
            };
            return Ok(planter.into_program(terminal));
        }
        if let Some(callee) = scanner.pop_name() {
            planter.plant_call(&callee);
            continue;
        }
        if scanner.try_consume('?') {
            planter.plant_op(OpCode::Push);
            continue;
        }
        if scanner.try_consume('!') {
            planter.plant_op(OpCode::Pop);
            continue;
        }
        if !planter.plant_expr(scanner)? {
            return Err(Error::UnterminatedBody(name.to_owned()));
        }
    }
}
