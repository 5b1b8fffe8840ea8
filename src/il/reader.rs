//! Reader for the textual listing format
//!
//! A listing is a sequence of method definitions, one instruction per line.
//! The format is what `Display` on `MethodBody` and `Method` produces:
//!
//! ```text
//! ; comment
//! .method add(int, int) -> int
//! .locals int
//!     ldarg 0
//!     ldarg 1
//!     add
//!     ret
//! ```
//!
//! `call` refers to a method by name and only sees methods defined earlier
//! in the same listing.
use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::delegate::Signature;
use crate::il::value::{Value, ValueType};
use crate::il::{BodyError, Instr, Label, MethodBody, MethodRef, OpCode, Operand, OperandKind};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unknown opcode `{name}`")]
    UnknownOpcode { line: usize, name: String },
    #[error("line {line}: unknown method `{name}`")]
    UnknownMethod { line: usize, name: String },
    #[error("method {method}: label `{label}` is never defined")]
    UndefinedLabel { method: String, label: String },
    #[error(transparent)]
    Body(#[from] BodyError),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Token<'a> {
    Directive(&'a str),
    Ident(&'a str),
    Label(&'a str),
    Int(i64),
    Float(f64),
    String(&'a str),
    LParen,
    RParen,
    Comma,
    Arrow,
    Eol,
}

pub struct Reader<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !"(),;\"".contains(c)
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a str) -> Self {
        Reader {
            input,
            pos: 0,
            line: 1,
        }
    }

    /// The line the next token starts on
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn tokens<'b>(&'b mut self) -> TokenStream<'a, 'b>
    where
        'a: 'b,
    {
        TokenStream { reader: self }
    }

    pub fn read(&mut self) -> Result<Option<Token<'a>>, ReadError> {
        let input = self.input;
        let rest = &input[self.pos..];
        let offset = match rest.find(|c: char| c == '\n' || !c.is_whitespace()) {
            Some(offset) => offset,
            None => {
                self.pos = self.input.len();
                return Ok(None);
            }
        };
        let start = self.pos + offset;
        let rest = &input[start..];
        let mut chars = rest.chars();
        let token = match chars.next() {
            Some('\n') => {
                self.pos = start + 1;
                self.line += 1;
                Token::Eol
            }
            Some(';') => {
                // Leave the newline for the next read.
                self.pos = start + rest.find('\n').unwrap_or(rest.len());
                return self.read();
            }
            Some('(') => self.advance(start, 1, Token::LParen),
            Some(')') => self.advance(start, 1, Token::RParen),
            Some(',') => self.advance(start, 1, Token::Comma),
            Some('-') if chars.next() == Some('>') => self.advance(start, 2, Token::Arrow),
            Some('"') => {
                let end = string_end(&rest[1..])
                    .ok_or(ReadError::UnterminatedString { line: self.line })?;
                self.pos = start + end + 2;
                Token::String(&rest[1..end + 1])
            }
            _ => {
                let len = rest.find(|c: char| !is_word_char(c)).unwrap_or(rest.len());
                let word = &rest[..len];
                self.pos = start + len;
                word_token(word)
            }
        };
        Ok(Some(token))
    }

    fn advance(&mut self, start: usize, len: usize, token: Token<'a>) -> Token<'a> {
        self.pos = start + len;
        token
    }
}

// Offset of the closing quote, skipping escaped characters. Strings do not
// span lines.
fn string_end(body: &str) -> Option<usize> {
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some(i),
            '\n' => return None,
            '\\' => {
                chars.next();
            }
            _ => {}
        }
    }
    None
}

/// Resolve the escapes `Display` on a string value produces.
fn unescape(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escaped = match chars.next() {
            Some('n') => '\n',
            Some('r') => '\r',
            Some('t') => '\t',
            Some('0') => '\0',
            Some(c @ ('\\' | '"' | '\'')) => c,
            Some('u') => {
                let rest = chars.as_str();
                let code = rest
                    .strip_prefix('{')
                    .and_then(|rest| rest.split_once('}'))
                    .and_then(|(hex, _)| u32::from_str_radix(hex, 16).ok().map(|n| (hex.len(), n)));
                match code.and_then(|(len, n)| char::from_u32(n).map(|c| (len, c))) {
                    Some((len, c)) => {
                        chars = rest[len + 2..].chars();
                        c
                    }
                    None => return Err(format!("bad unicode escape in \"{}\"", raw)),
                }
            }
            other => return Err(format!("unknown escape {:?} in \"{}\"", other, raw)),
        };
        out.push(escaped);
    }
    Ok(out)
}

fn is_number_start(word: &str) -> bool {
    let digits = word.strip_prefix('-').unwrap_or(word);
    digits.starts_with(|c: char| c.is_ascii_digit())
}

fn word_token(word: &str) -> Token {
    if let Some(label) = word.strip_suffix(':') {
        return Token::Label(label);
    }
    if let Ok(n) = word.parse() {
        return Token::Int(n);
    }
    // Printed floats use exponent notation at large and small magnitudes.
    if is_number_start(word) && word.contains(|c: char| c == '.' || c == 'e' || c == 'E') {
        if let Ok(x) = word.parse() {
            return Token::Float(x);
        }
    }
    match word.strip_prefix('.') {
        Some(directive) => Token::Directive(directive),
        None => Token::Ident(word),
    }
}

pub struct TokenStream<'a, 'b>
where
    'a: 'b,
{
    reader: &'b mut Reader<'a>,
}

impl<'a, 'b> Iterator for TokenStream<'a, 'b> {
    type Item = Result<Token<'a>, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.read().transpose()
    }
}

struct Line<'t, 'a> {
    number: usize,
    tokens: &'t [Token<'a>],
    pos: usize,
}

impl<'t, 'a> Line<'t, 'a> {
    fn syntax(&self, message: impl Into<String>) -> ReadError {
        ReadError::Syntax {
            line: self.number,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token<'a>> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token<'a>) -> Result<(), ReadError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(self.syntax(format!("expected {:?}, found {:?}", expected, other))),
        }
    }

    fn ident(&mut self, what: &str) -> Result<&'a str, ReadError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(self.syntax(format!("expected {}, found {:?}", what, other))),
        }
    }

    fn finish(&self) -> Result<(), ReadError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.syntax(format!("unexpected {:?}", token))),
        }
    }

    fn value_type(&mut self) -> Result<ValueType, ReadError> {
        let name = self.ident("a type")?;
        ValueType::from_name(name).ok_or_else(|| self.syntax(format!("unknown type `{}`", name)))
    }

    // ( type, ... ) -> type
    fn signature(&mut self) -> Result<Signature, ReadError> {
        self.expect(Token::LParen)?;
        let mut params = vec![];
        if self.peek() == Some(Token::RParen) {
            self.next();
        } else {
            loop {
                params.push(self.value_type()?);
                match self.next() {
                    Some(Token::Comma) => {}
                    Some(Token::RParen) => break,
                    other => return Err(self.syntax(format!("unexpected {:?} in parameter list", other))),
                }
            }
        }
        self.expect(Token::Arrow)?;
        let ret = self.value_type()?;
        Ok(Signature::new(params, ret))
    }

    fn index(&mut self) -> Result<u16, ReadError> {
        match self.next() {
            Some(Token::Int(n)) => {
                u16::try_from(n).map_err(|_| self.syntax(format!("index {} out of range", n)))
            }
            other => Err(self.syntax(format!("expected an index, found {:?}", other))),
        }
    }

    fn constant(&mut self) -> Result<Value, ReadError> {
        let value = match self.next() {
            Some(Token::Int(n)) => Value::Int(n),
            Some(Token::Float(x)) => Value::Float(x),
            Some(Token::String(s)) => Value::Str(unescape(s).map_err(|e| self.syntax(e))?.into()),
            Some(Token::Ident("true")) => Value::Bool(true),
            Some(Token::Ident("false")) => Value::Bool(false),
            Some(Token::Ident("inf")) => Value::Float(f64::INFINITY),
            Some(Token::Ident("-inf")) => Value::Float(f64::NEG_INFINITY),
            Some(Token::Ident("NaN")) => Value::Float(f64::NAN),
            other => return Err(self.syntax(format!("expected a constant, found {:?}", other))),
        };
        Ok(value)
    }
}

/// A method being read, with labels by name
struct Pending<'a> {
    body: MethodBody,
    labels: HashMap<&'a str, Label>,
    defined: HashSet<&'a str>,
    marked: Vec<Label>,
}

impl<'a> Pending<'a> {
    fn new(body: MethodBody) -> Self {
        Pending {
            body,
            labels: HashMap::new(),
            defined: HashSet::new(),
            marked: vec![],
        }
    }

    fn label(&mut self, name: &'a str) -> Label {
        let body = &mut self.body;
        self.labels
            .entry(name)
            .or_insert_with(|| body.define_label())
            .clone()
    }

    fn push(&mut self, instr: Instr) {
        for label in self.marked.drain(..) {
            label.set_target(Some(instr.clone()));
        }
        self.body.push(instr);
    }

    fn finish(self) -> Result<MethodRef, ReadError> {
        // Labels still marked point at the end of the stream.
        if let Some(name) = self.labels.keys().find(|name| !self.defined.contains(*name)) {
            return Err(ReadError::UndefinedLabel {
                method: self.body.name.clone(),
                label: name.to_string(),
            });
        }
        Ok(self.body.generate()?)
    }
}

/// Read all methods of a listing, in definition order.
pub fn read_module(input: &str) -> Result<Vec<MethodRef>, ReadError> {
    let mut reader = Reader::new(input);
    let mut lines: Vec<(usize, Vec<Token>)> = vec![];
    let mut current = (reader.line(), vec![]);
    loop {
        let line = reader.line();
        match reader.read()? {
            None => break,
            Some(Token::Eol) => {
                let next = (reader.line(), vec![]);
                lines.push(std::mem::replace(&mut current, next));
            }
            Some(token) => {
                if current.1.is_empty() {
                    current.0 = line;
                }
                current.1.push(token);
            }
        }
    }
    lines.push(current);

    let mut methods: Vec<MethodRef> = vec![];
    let mut by_name: HashMap<String, MethodRef> = HashMap::new();
    let mut pending: Option<Pending> = None;
    for (number, tokens) in lines.iter().filter(|(_, tokens)| !tokens.is_empty()) {
        let mut line = Line {
            number: *number,
            tokens,
            pos: 0,
        };
        match line.peek() {
            Some(Token::Directive("method")) => {
                line.next();
                let name = line.ident("a method name")?;
                let signature = line.signature()?;
                line.finish()?;
                if let Some(done) = pending.take() {
                    let method = done.finish()?;
                    by_name.insert(method.name().into(), method.clone());
                    methods.push(method);
                }
                pending = Some(Pending::new(MethodBody::new(name, signature)));
                continue;
            }
            Some(Token::Directive("locals")) => {
                line.next();
                let current = pending
                    .as_mut()
                    .ok_or_else(|| line.syntax(".locals outside of a method"))?;
                while line.peek().is_some() {
                    let ty = line.value_type()?;
                    current.body.locals.push(ty);
                }
                continue;
            }
            Some(Token::Directive(other)) => {
                return Err(line.syntax(format!("unknown directive .{}", other)));
            }
            _ => {}
        }
        let current = pending
            .as_mut()
            .ok_or_else(|| line.syntax("instruction outside of a method"))?;
        while let Some(Token::Label(name)) = line.peek() {
            line.next();
            let label = current.label(name);
            if !current.defined.insert(name) {
                return Err(line.syntax(format!("label `{}` defined twice", name)));
            }
            current.marked.push(label);
        }
        if line.peek().is_none() {
            continue;
        }
        let name = line.ident("an opcode")?;
        let opcode = OpCode::from_name(name).ok_or_else(|| ReadError::UnknownOpcode {
            line: line.number,
            name: name.into(),
        })?;
        let operand = match opcode.operand_kind() {
            OperandKind::None => Operand::None,
            OperandKind::Const => Operand::Const(line.constant()?),
            OperandKind::Arg | OperandKind::Local => Operand::Index(line.index()?),
            OperandKind::Label => Operand::Label(current.label(line.ident("a label")?)),
            OperandKind::Call => {
                let callee = line.ident("a method name")?;
                let method = by_name.get(callee).ok_or_else(|| ReadError::UnknownMethod {
                    line: line.number,
                    name: callee.into(),
                })?;
                Operand::Method(method.clone())
            }
            OperandKind::Delegate => Operand::Delegate(line.signature()?),
        };
        line.finish()?;
        current.push(Instr::new(opcode, operand));
    }
    if let Some(done) = pending {
        methods.push(done.finish()?);
    }
    Ok(methods)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(input: &str) -> Vec<Token> {
        Reader::new(input).tokens().collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn empty_input() {
        assert_eq!(read_vec(""), vec![]);
    }

    #[test]
    fn header() {
        assert_eq!(
            read_vec(".method add(int, int) -> int ; sum"),
            vec![
                Token::Directive("method"),
                Token::Ident("add"),
                Token::LParen,
                Token::Ident("int"),
                Token::Comma,
                Token::Ident("int"),
                Token::RParen,
                Token::Arrow,
                Token::Ident("int"),
            ]
        );
    }

    #[test]
    fn instructions() {
        assert_eq!(
            read_vec("top:\n  ldc -42\n  ldc 1.5\n  ldc \"a b\"\n"),
            vec![
                Token::Label("top"),
                Token::Eol,
                Token::Ident("ldc"),
                Token::Int(-42),
                Token::Eol,
                Token::Ident("ldc"),
                Token::Float(1.5),
                Token::Eol,
                Token::Ident("ldc"),
                Token::String("a b"),
                Token::Eol,
            ]
        );
    }

    #[test]
    fn unterminated_string() {
        let mut reader = Reader::new("ldc \"abc\nret");
        assert_eq!(reader.read().unwrap(), Some(Token::Ident("ldc")));
        assert!(matches!(
            reader.read(),
            Err(ReadError::UnterminatedString { line: 1 })
        ));
    }

    #[test]
    fn module_with_calls() {
        let methods = read_module(
            r#"
.method double(int) -> int
    ldarg 0
    ldc 2
    mul
    ret

.method quad(int) -> int
    ldarg 0
    call double
    call double
    ret
"#,
        )
        .unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[1].name(), "quad");
        assert_eq!(methods[1].invoke(vec![Value::Int(3)]).unwrap(), Value::Int(12));
    }

    #[test]
    fn listing_round_trips() {
        let source = ".method f(int) -> bool\n.locals int\n    ldarg 0\n    brtrue L0\n    ldc false\n    ret\nL0:\n    ldc true\n    ret\n";
        let methods = read_module(source).unwrap();
        assert_eq!(methods[0].to_string(), source);
    }

    fn reread(source: &str) -> Value {
        let printed = read_module(source).unwrap()[0].to_string();
        let method = read_module(&printed).unwrap().pop().unwrap();
        assert_eq!(method.to_string(), printed);
        method.invoke(vec![]).unwrap()
    }

    #[test]
    fn string_escapes_survive_printing() {
        let value = reread(".method f() -> str\n    ldc \"a\\\\b\\t\\\"c\\\"\"\n    ret\n");
        assert_eq!(value, Value::Str("a\\b\t\"c\"".into()));
        assert_eq!(reread(".method f() -> str\n    ldc \"\\u{7f}\"\n    ret\n"), Value::Str("\u{7f}".into()));
        assert!(matches!(
            read_module(".method f() -> str\n    ldc \"\\q\"\n    ret\n"),
            Err(ReadError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn floats_survive_printing() {
        for source in &["10000000000000000.0", "0.00000001", "-2.5e300", "inf", "-inf"] {
            let listing = format!(".method f() -> float\n    ldc {}\n    ret\n", source);
            let expected: f64 = source.parse().unwrap();
            assert_eq!(reread(&listing), Value::Float(expected));
        }
        match reread(".method f() -> float\n    ldc NaN\n    ret\n") {
            Value::Float(x) => assert!(x.is_nan()),
            other => panic!("expected a float, got {:?}", other),
        }
    }

    #[test]
    fn errors() {
        assert!(matches!(
            read_module(".method f() -> void\n  jmp"),
            Err(ReadError::UnknownOpcode { line: 2, .. })
        ));
        assert!(matches!(
            read_module(".method f() -> void\n  call g\n  ret"),
            Err(ReadError::UnknownMethod { line: 2, .. })
        ));
        assert!(matches!(
            read_module(".method f() -> void\n  br nowhere"),
            Err(ReadError::UndefinedLabel { .. })
        ));
        assert!(matches!(
            read_module("  ret"),
            Err(ReadError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            read_module(".method f() -> int\n  ldarg 0\n  ret"),
            Err(ReadError::Body(BodyError::ArgOutOfRange { .. }))
        ));
    }
}
