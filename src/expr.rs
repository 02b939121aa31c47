//! The bounded expression/statement interpreter.
//!
//! Rather than embedding a JS engine or transpiling at build time (both
//! rejected by the design notes), this is a small hand-rolled tokenizer +
//! precedence-climbing parser + tree-walking evaluator over a grammar that
//! covers literals, member access, arithmetic, comparisons, logical
//! short-circuit, the ternary, assignment (including `++`/`--`/`+=` …),
//! array/object literals, and calls to a fixed helper whitelist
//! (`emit`, `refresh`, `get`/`post`/`put`/`patch`/`del`, plus an `await`
//! prefix for statement-mode handler bodies).
//!
//! `@name` is recognized at the tokenizer level (an `@` immediately
//! followed by `[A-Za-z_][\w$]*`) rather than rewritten textually first —
//! functionally identical to a textual `@foo` → `ctx.$ref("foo")` rewrite,
//! but it lets this implementation skip a source-to-source pass. One
//! consequence worth keeping faithful to the original design: the
//! tokenizer does not special-case `@` inside string literals either (a
//! string is consumed as a unit once its opening quote is seen, so an `@`
//! typed by an author inside a string is never misread as a reference) —
//! the prose in the distilled design note about strings describes the
//! observable end state, not this tokenizer's implementation strategy.

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::error::EvalError;
use crate::refs::Value;

// ---------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    AtIdent(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Colon,
    Question,
    Semi,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}
fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(src: &str) -> Result<Vec<Tok>, crate::error::ExprError> {
    use crate::error::ExprError as E;
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut toks = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '@' => {
                let start = i + 1;
                let mut j = start;
                if j < chars.len() && is_ident_start(chars[j]) {
                    j += 1;
                    while j < chars.len() && is_ident_continue(chars[j]) {
                        j += 1;
                    }
                    toks.push(Tok::AtIdent(chars[start..j].iter().collect()));
                    i = j;
                } else {
                    return Err(E::UnexpectedToken("@".into()));
                }
            }
            '0'..='9' => {
                let start = i;
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                let text: String = chars[start..j].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| E::InvalidNumber(text.clone()))?;
                toks.push(Tok::Num(n));
                i = j;
            }
            '"' | '\'' | '`' => {
                let quote = c;
                let mut j = i + 1;
                let mut s = String::new();
                loop {
                    if j >= chars.len() {
                        return Err(E::UnterminatedString);
                    }
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        s.push(chars[j + 1]);
                        j += 2;
                        continue;
                    }
                    if chars[j] == quote {
                        j += 1;
                        break;
                    }
                    s.push(chars[j]);
                    j += 1;
                }
                toks.push(Tok::Str(s));
                i = j;
            }
            c if is_ident_start(c) => {
                let start = i;
                let mut j = i;
                while j < chars.len() && is_ident_continue(chars[j]) {
                    j += 1;
                }
                let text: String = chars[start..j].iter().collect();
                toks.push(match text.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" | "undefined" => Tok::Null,
                    _ => Tok::Ident(text),
                });
                i = j;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            '{' => {
                toks.push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                toks.push(Tok::RBrace);
                i += 1;
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            '?' => {
                toks.push(Tok::Question);
                i += 1;
            }
            ';' => {
                toks.push(Tok::Semi);
                i += 1;
            }
            '+' => {
                if chars.get(i + 1) == Some(&'+') {
                    toks.push(Tok::PlusPlus);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::PlusEq);
                    i += 2;
                } else {
                    toks.push(Tok::Plus);
                    i += 1;
                }
            }
            '-' => {
                if chars.get(i + 1) == Some(&'-') {
                    toks.push(Tok::MinusMinus);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::MinusEq);
                    i += 2;
                } else {
                    toks.push(Tok::Minus);
                    i += 1;
                }
            }
            '*' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::StarEq);
                    i += 2;
                } else {
                    toks.push(Tok::Star);
                    i += 1;
                }
            }
            '/' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::SlashEq);
                    i += 2;
                } else {
                    toks.push(Tok::Slash);
                    i += 1;
                }
            }
            '%' => {
                toks.push(Tok::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::EqEq);
                    i += 2;
                } else {
                    toks.push(Tok::Eq);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::NotEq);
                    i += 2;
                } else {
                    toks.push(Tok::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    toks.push(Tok::AndAnd);
                    i += 2;
                } else {
                    return Err(E::UnexpectedToken("&".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    toks.push(Tok::OrOr);
                    i += 2;
                } else {
                    return Err(E::UnexpectedToken("|".into()));
                }
            }
            other => return Err(E::UnexpectedToken(other.to_string())),
        }
    }
    toks.push(Tok::Eof);
    Ok(toks)
}

// ---------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MemberKey {
    Dot(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Ident(String),
    Ref(String),
    Member(Box<Expr>, MemberKey),
    Call(Box<Expr>, Vec<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign(Box<Expr>, AssignOp, Box<Expr>),
    PreIncDec(Box<Expr>, i64),
    PostIncDec(Box<Expr>, i64),
    Await(Box<Expr>),
    Sequence(Vec<Expr>),
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Tok) -> Result<(), crate::error::ExprError> {
        if self.peek() == t {
            self.advance();
            Ok(())
        } else {
            Err(crate::error::ExprError::UnexpectedToken(format!("{:?}", self.peek())))
        }
    }

    fn parse_program(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut stmts = Vec::new();
        loop {
            while self.peek() == &Tok::Semi {
                self.advance();
            }
            if self.peek() == &Tok::Eof {
                break;
            }
            stmts.push(self.parse_assignment()?);
            if self.peek() == &Tok::Semi {
                self.advance();
            } else {
                break;
            }
        }
        if self.peek() != &Tok::Eof {
            return Err(crate::error::ExprError::TrailingInput(format!("{:?}", self.peek())));
        }
        if stmts.len() == 1 {
            Ok(stmts.into_iter().next().unwrap())
        } else {
            Ok(Expr::Sequence(stmts))
        }
    }

    fn parse_assignment(&mut self) -> Result<Expr, crate::error::ExprError> {
        let lhs = self.parse_ternary()?;
        let op = match self.peek() {
            Tok::Eq => Some(AssignOp::Set),
            Tok::PlusEq => Some(AssignOp::Add),
            Tok::MinusEq => Some(AssignOp::Sub),
            Tok::StarEq => Some(AssignOp::Mul),
            Tok::SlashEq => Some(AssignOp::Div),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_assignment()?;
            return Ok(Expr::Assign(Box::new(lhs), op, Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_ternary(&mut self) -> Result<Expr, crate::error::ExprError> {
        let cond = self.parse_or()?;
        if self.peek() == &Tok::Question {
            self.advance();
            let then_branch = self.parse_assignment()?;
            self.eat(&Tok::Colon)?;
            let else_branch = self.parse_assignment()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then_branch), Box::new(else_branch)));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == &Tok::OrOr {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut lhs = self.parse_equality()?;
        while self.peek() == &Tok::AndAnd {
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Tok::EqEq => BinOp::Eq,
                Tok::NotEq => BinOp::NotEq,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, crate::error::ExprError> {
        match self.peek() {
            Tok::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Tok::Bang => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Tok::PlusPlus => {
                self.advance();
                Ok(Expr::PreIncDec(Box::new(self.parse_unary()?), 1))
            }
            Tok::MinusMinus => {
                self.advance();
                Ok(Expr::PreIncDec(Box::new(self.parse_unary()?), -1))
            }
            Tok::Ident(name) if name == "await" => {
                self.advance();
                Ok(Expr::Await(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, crate::error::ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Tok::Ident(n) => n,
                        other => return Err(crate::error::ExprError::UnexpectedToken(format!("{:?}", other))),
                    };
                    expr = Expr::Member(Box::new(expr), MemberKey::Dot(name));
                }
                Tok::LBracket => {
                    self.advance();
                    let idx = self.parse_assignment()?;
                    self.eat(&Tok::RBracket)?;
                    expr = Expr::Member(Box::new(expr), MemberKey::Computed(Box::new(idx)));
                }
                Tok::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != &Tok::RParen {
                        args.push(self.parse_assignment()?);
                        while self.peek() == &Tok::Comma {
                            self.advance();
                            args.push(self.parse_assignment()?);
                        }
                    }
                    self.eat(&Tok::RParen)?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                Tok::PlusPlus => {
                    self.advance();
                    expr = Expr::PostIncDec(Box::new(expr), 1);
                }
                Tok::MinusMinus => {
                    self.advance();
                    expr = Expr::PostIncDec(Box::new(expr), -1);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, crate::error::ExprError> {
        match self.advance() {
            Tok::Num(n) => Ok(Expr::Num(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::True => Ok(Expr::Bool(true)),
            Tok::False => Ok(Expr::Bool(false)),
            Tok::Null => Ok(Expr::Null),
            Tok::AtIdent(name) => Ok(Expr::Ref(name)),
            Tok::Ident(name) => Ok(Expr::Ident(name)),
            Tok::LParen => {
                let e = self.parse_assignment()?;
                self.eat(&Tok::RParen)?;
                Ok(e)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if self.peek() != &Tok::RBracket {
                    items.push(self.parse_assignment()?);
                    while self.peek() == &Tok::Comma {
                        self.advance();
                        items.push(self.parse_assignment()?);
                    }
                }
                self.eat(&Tok::RBracket)?;
                Ok(Expr::Array(items))
            }
            Tok::LBrace => {
                let mut fields = Vec::new();
                if self.peek() != &Tok::RBrace {
                    loop {
                        let key = match self.advance() {
                            Tok::Ident(n) => n,
                            Tok::Str(s) => s,
                            other => return Err(crate::error::ExprError::UnexpectedToken(format!("{:?}", other))),
                        };
                        self.eat(&Tok::Colon)?;
                        let value = self.parse_assignment()?;
                        fields.push((key, value));
                        if self.peek() == &Tok::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.eat(&Tok::RBrace)?;
                Ok(Expr::Object(fields))
            }
            other => Err(crate::error::ExprError::UnexpectedToken(format!("{:?}", other))),
        }
    }
}

/// Parse `src` into an AST. Used directly by expression-mode binds and, via
/// [`compile`], wrapped for either calling convention.
pub fn parse(src: &str) -> Result<Expr, crate::error::ExprError> {
    let toks = tokenize(src)?;
    let mut p = Parser { toks, pos: 0 };
    p.parse_program()
}

// ---------------------------------------------------------------------
// Compiled expression + evaluation context
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// Read-only: bindings and key expressions. No assignment side effects
    /// are expected, though the grammar does not forbid them.
    Expression,
    /// Event handler bodies: may contain assignments, `await`, and helper
    /// calls; evaluated for effect, last statement's value is returned.
    Statement,
}

#[derive(Debug, Clone)]
pub struct Compiled {
    pub mode: CompileMode,
    ast: Expr,
}

pub fn compile(src: &str, mode: CompileMode) -> Result<Compiled, crate::error::ExprError> {
    Ok(Compiled {
        mode,
        ast: parse(src)?,
    })
}

/// Resolves `@name` references against whatever scoping rules the caller
/// implements (the DOM-ancestor walk in `scope.rs`, or a flat map in
/// tests). Implementations are expected to call
/// `crate::reactive::record_dependency` themselves when a lookup succeeds
/// against a registered definition.
pub trait RefResolver {
    fn resolve(&mut self, name: &str) -> Result<Value, EvalError>;
}

/// A helper invokable from handler code (`emit`, `refresh`, HTTP verbs).
/// Handler helpers are supplied per-invocation by `bindings::on` so the
/// interpreter core stays decoupled from the DOM/network.
pub trait HelperHost {
    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError>;
}

struct NoHelpers;
impl HelperHost for NoHelpers {
    fn call(&mut self, name: &str, _args: Vec<Value>) -> Result<Value, EvalError> {
        Err(EvalError::UnknownHelper(name.to_string()))
    }
}

pub struct EvalCtx<'a> {
    pub locals: HashMap<String, Value>,
    pub resolver: &'a mut dyn RefResolver,
    pub helpers: &'a mut dyn HelperHost,
}

impl<'a> EvalCtx<'a> {
    pub fn new(resolver: &'a mut dyn RefResolver, helpers: &'a mut dyn HelperHost) -> Self {
        EvalCtx {
            locals: HashMap::new(),
            resolver,
            helpers,
        }
    }

    pub fn with_local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(name.into(), value);
        self
    }
}

/// A resolver with no definitions at all, for compiling/evaluating
/// reference-free expressions (tests, key expressions with no `@name`).
pub struct EmptyResolver;
impl RefResolver for EmptyResolver {
    fn resolve(&mut self, name: &str) -> Result<Value, EvalError> {
        Err(EvalError::UnknownReference(name.to_string()))
    }
}

/// A flat-map resolver for pure-logic tests that don't want to stand up
/// the full registry.
pub struct MapResolver(pub HashMap<String, Value>);
impl RefResolver for MapResolver {
    fn resolve(&mut self, name: &str) -> Result<Value, EvalError> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownReference(name.to_string()))
    }
}

pub fn eval_with_empty(ast: &Expr) -> Result<Value, EvalError> {
    let mut resolver = EmptyResolver;
    let mut helpers = NoHelpers;
    let mut ctx = EvalCtx::new(&mut resolver, &mut helpers);
    eval(ast, &mut ctx)
}

impl Compiled {
    /// Evaluate for a read-only binding. Returns `Value::Json(Null)` under
    /// the error-handling policy's "evaluates to ... yield `undefined`"
    /// rule rather than propagating — callers that need to distinguish
    /// success from fallback should use [`Compiled::eval`] directly and
    /// inspect the `Result`.
    pub fn eval_or_null(&self, ctx: &mut EvalCtx) -> Value {
        eval(&self.ast, ctx).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "expression evaluation failed");
            Value::null()
        })
    }

    pub fn eval(&self, ctx: &mut EvalCtx) -> Result<Value, EvalError> {
        eval(&self.ast, ctx)
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }
}

fn truthy(v: &Value) -> bool {
    v.is_truthy()
}

fn to_number(v: &Value) -> f64 {
    v.as_f64()
}

fn json_eq(a: &Json, b: &Json) -> bool {
    a == b
}

fn eval(e: &Expr, ctx: &mut EvalCtx) -> Result<Value, EvalError> {
    match e {
        Expr::Null => Ok(Value::null()),
        Expr::Bool(b) => Ok(Value::bool(*b)),
        Expr::Num(n) => Ok(Value::number(*n)),
        Expr::Str(s) => Ok(Value::string(s.clone())),
        Expr::Ident(name) => ctx
            .locals
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownReference(name.clone())),
        Expr::Ref(name) => {
            if let Some(local) = ctx.locals.get(name) {
                return Ok(local.clone());
            }
            ctx.resolver.resolve(name)
        }
        Expr::Member(base, key) => {
            let base_v = eval(base, ctx)?;
            let prop = member_key(key, ctx)?;
            base_v.get_prop(&prop)
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for it in items {
                out.push(eval(it, ctx)?.to_json());
            }
            Ok(Value::from_json(Json::Array(out)))
        }
        Expr::Object(fields) => {
            let mut map = serde_json::Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), eval(v, ctx)?.to_json());
            }
            Ok(Value::from_json(Json::Object(map)))
        }
        Expr::Neg(inner) => Ok(Value::number(-to_number(&eval(inner, ctx)?))),
        Expr::Not(inner) => Ok(Value::bool(!truthy(&eval(inner, ctx)?))),
        Expr::And(l, r) => {
            let lv = eval(l, ctx)?;
            if !truthy(&lv) {
                Ok(lv)
            } else {
                eval(r, ctx)
            }
        }
        Expr::Or(l, r) => {
            let lv = eval(l, ctx)?;
            if truthy(&lv) {
                Ok(lv)
            } else {
                eval(r, ctx)
            }
        }
        Expr::Ternary(c, t, f) => {
            if truthy(&eval(c, ctx)?) {
                eval(t, ctx)
            } else {
                eval(f, ctx)
            }
        }
        Expr::Binary(op, l, r) => eval_binary(*op, l, r, ctx),
        Expr::Assign(target, op, rhs) => {
            let rhs_val = eval(rhs, ctx)?;
            let new_val = match op {
                AssignOp::Set => rhs_val,
                AssignOp::Add => arith(BinOp::Add, &eval(target, ctx)?, &rhs_val)?,
                AssignOp::Sub => arith(BinOp::Sub, &eval(target, ctx)?, &rhs_val)?,
                AssignOp::Mul => arith(BinOp::Mul, &eval(target, ctx)?, &rhs_val)?,
                AssignOp::Div => arith(BinOp::Div, &eval(target, ctx)?, &rhs_val)?,
            };
            assign_to(target, new_val.clone(), ctx)?;
            Ok(new_val)
        }
        Expr::PreIncDec(target, delta) => {
            let cur = to_number(&eval(target, ctx)?);
            let next = Value::number(cur + *delta as f64);
            assign_to(target, next.clone(), ctx)?;
            Ok(next)
        }
        Expr::PostIncDec(target, delta) => {
            let cur = eval(target, ctx)?;
            let next = Value::number(to_number(&cur) + *delta as f64);
            assign_to(target, next, ctx)?;
            Ok(cur)
        }
        Expr::Await(inner) => eval(inner, ctx),
        Expr::Sequence(stmts) => {
            let mut last = Value::null();
            for s in stmts {
                last = eval(s, ctx)?;
            }
            Ok(last)
        }
        Expr::Call(callee, args) => eval_call(callee, args, ctx),
    }
}

fn member_key(key: &MemberKey, ctx: &mut EvalCtx) -> Result<String, EvalError> {
    match key {
        MemberKey::Dot(name) => Ok(name.clone()),
        MemberKey::Computed(e) => Ok(eval(e, ctx)?.as_string()),
    }
}

fn eval_binary(op: BinOp, l: &Expr, r: &Expr, ctx: &mut EvalCtx) -> Result<Value, EvalError> {
    let lv = eval(l, ctx)?;
    let rv = eval(r, ctx)?;
    match op {
        BinOp::Eq => Ok(Value::bool(json_eq(&lv.to_json(), &rv.to_json()))),
        BinOp::NotEq => Ok(Value::bool(!json_eq(&lv.to_json(), &rv.to_json()))),
        _ => arith(op, &lv, &rv),
    }
}

fn arith(op: BinOp, lv: &Value, rv: &Value) -> Result<Value, EvalError> {
    // `+` on two strings (or anything coercing to a string on either side)
    // concatenates, matching the host language's operator overload.
    if op == BinOp::Add {
        if let (Json::String(_), _) | (_, Json::String(_)) = (lv.to_json(), rv.to_json()) {
            return Ok(Value::string(format!("{}{}", lv.as_string(), rv.as_string())));
        }
    }
    let a = to_number(lv);
    let b = to_number(rv);
    match op {
        BinOp::Add => Ok(Value::number(a + b)),
        BinOp::Sub => Ok(Value::number(a - b)),
        BinOp::Mul => Ok(Value::number(a * b)),
        BinOp::Div => {
            if b == 0.0 {
                Err(EvalError::DivideByZero)
            } else {
                Ok(Value::number(a / b))
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Err(EvalError::DivideByZero)
            } else {
                Ok(Value::number(a % b))
            }
        }
        BinOp::Lt => Ok(Value::bool(a < b)),
        BinOp::Le => Ok(Value::bool(a <= b)),
        BinOp::Gt => Ok(Value::bool(a > b)),
        BinOp::Ge => Ok(Value::bool(a >= b)),
        BinOp::Eq | BinOp::NotEq => unreachable!("handled in eval_binary"),
    }
}

/// Writes are only legal through a `@name` (or `@name.path...`) chain — a
/// plain local can't be reassigned since locals are per-iteration values,
/// not mutable bindings (`EvalError::NotAssignable`).
fn assign_to(target: &Expr, value: Value, ctx: &mut EvalCtx) -> Result<(), EvalError> {
    match target {
        Expr::Ref(name) => {
            let resolved = ctx.resolver.resolve(name)?;
            match resolved {
                Value::State(h) => {
                    h.set(&[], value.to_json());
                    Ok(())
                }
                _ => Err(EvalError::NotAssignable),
            }
        }
        Expr::Member(base, key) => {
            let path_tail = member_key(key, ctx)?;
            let (handle, mut path) = resolve_state_path(base, ctx)?;
            path.push(crate::util::PathSegment::Key(path_tail));
            handle.set(&path, value.to_json());
            Ok(())
        }
        _ => Err(EvalError::NotAssignable),
    }
}

/// Walk a member-access chain back to its root `@name`, collecting the
/// path segments so `@state.user.email = x` resolves to one `deep_set`
/// call on the state rather than needing a settable intermediate proxy at
/// every level.
fn resolve_state_path(
    e: &Expr,
    ctx: &mut EvalCtx,
) -> Result<(crate::refs::StateHandle, Vec<crate::util::PathSegment>), EvalError> {
    match e {
        Expr::Ref(name) => match ctx.resolver.resolve(name)? {
            Value::State(h) => Ok((h, Vec::new())),
            _ => Err(EvalError::NotAssignable),
        },
        Expr::Member(base, key) => {
            let seg = member_key(key, ctx)?;
            let (h, mut path) = resolve_state_path(base, ctx)?;
            path.push(crate::util::PathSegment::Key(seg));
            Ok((h, path))
        }
        _ => Err(EvalError::NotAssignable),
    }
}

/// Public wrapper over the private assignment walker, for callers (the
/// `model` binding) that need to write through a `@state.path` target
/// without re-evaluating the whole statement — they already have the value
/// in hand (the form control's current, type-coerced contents).
pub fn assign(target: &Expr, value: Value, ctx: &mut EvalCtx) -> Result<(), EvalError> {
    assign_to(target, value, ctx)
}

const HELPER_WHITELIST: [&str; 7] = ["emit", "refresh", "get", "post", "put", "patch", "del"];

fn eval_call(callee: &Expr, args: &[Expr], ctx: &mut EvalCtx) -> Result<Value, EvalError> {
    let name = match callee {
        Expr::Ident(n) => n.clone(),
        _ => return Err(EvalError::UnknownHelper("<expr>".to_string())),
    };
    if !HELPER_WHITELIST.contains(&name.as_str()) {
        return Err(EvalError::UnknownHelper(name));
    }
    let mut values = Vec::with_capacity(args.len());
    for a in args {
        values.push(eval(a, ctx)?);
    }
    ctx.helpers.call(&name, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn eval_str(src: &str, locals: Map<String, Value>) -> Value {
        let compiled = compile(src, CompileMode::Expression).unwrap();
        let mut resolver = MapResolver(Map::new());
        let mut helpers = NoHelpers;
        let mut ctx = EvalCtx::new(&mut resolver, &mut helpers);
        ctx.locals = locals;
        compiled.eval(&mut ctx).unwrap()
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval_str("1 + 2 * 3", Map::new()).to_json(), serde_json::json!(7.0));
        assert_eq!(eval_str("(1 + 2) * 3", Map::new()).to_json(), serde_json::json!(9.0));
    }

    #[test]
    fn string_concat_via_plus() {
        assert_eq!(eval_str(r#"'a' + 'b'"#, Map::new()).to_json(), serde_json::json!("ab"));
    }

    #[test]
    fn ternary_and_logical_short_circuit() {
        assert_eq!(eval_str("true ? 1 : 2", Map::new()).to_json(), serde_json::json!(1.0));
        assert_eq!(eval_str("false || 'x'", Map::new()).to_json(), serde_json::json!("x"));
        assert_eq!(eval_str("0 && 'x'", Map::new()).to_json(), serde_json::json!(0.0));
    }

    #[test]
    fn member_access_on_locals() {
        let mut locals = Map::new();
        locals.insert("item".to_string(), Value::from_json(serde_json::json!({"title": "Hi"})));
        assert_eq!(eval_str("item.title", locals).to_json(), serde_json::json!("Hi"));
    }

    #[test]
    fn computed_member_access() {
        let mut locals = Map::new();
        locals.insert("item".to_string(), Value::from_json(serde_json::json!([10, 20, 30])));
        locals.insert("$index".to_string(), Value::number(1.0));
        assert_eq!(eval_str("item[$index]", locals).to_json(), serde_json::json!(20.0));
    }

    #[test]
    fn division_by_zero_is_an_eval_error() {
        let compiled = compile("1 / 0", CompileMode::Expression).unwrap();
        let mut resolver = MapResolver(Map::new());
        let mut helpers = NoHelpers;
        let mut ctx = EvalCtx::new(&mut resolver, &mut helpers);
        assert!(matches!(compiled.eval(&mut ctx), Err(EvalError::DivideByZero)));
    }

    #[test]
    fn unknown_reference_is_an_eval_error() {
        let compiled = compile("@nope", CompileMode::Expression).unwrap();
        let mut resolver = MapResolver(Map::new());
        let mut helpers = NoHelpers;
        let mut ctx = EvalCtx::new(&mut resolver, &mut helpers);
        assert!(matches!(compiled.eval(&mut ctx), Err(EvalError::UnknownReference(_))));
    }

    #[test]
    fn multi_statement_sequence_returns_last_value() {
        let compiled = compile("1; 2; 3", CompileMode::Statement).unwrap();
        let v = eval_with_empty(compiled.ast()).unwrap();
        assert_eq!(v.to_json(), serde_json::json!(3.0));
    }

    #[test]
    fn unknown_helper_call_is_rejected() {
        let compiled = compile("wipe()", CompileMode::Statement).unwrap();
        let mut resolver = MapResolver(Map::new());
        let mut helpers = NoHelpers;
        let mut ctx = EvalCtx::new(&mut resolver, &mut helpers);
        assert!(matches!(compiled.eval(&mut ctx), Err(EvalError::UnknownHelper(_))));
    }
}
