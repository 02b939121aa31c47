//! Error taxonomy. Every variant here is logged via `tracing` and
//! re-surfaced as a DOM `error` event by the owning subsystem — none of
//! these are allowed to unwind out of a binding update or handler.

use thiserror::Error;

/// Failure compiling an expression or statement body.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("invalid number literal: {0}")]
    InvalidNumber(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("trailing input after expression: {0}")]
    TrailingInput(String),
}

/// Failure evaluating a compiled expression against a context.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("reference to unknown definition '{0}'")]
    UnknownReference(String),
    #[error("assignment target is not a state reference")]
    NotAssignable,
    #[error("call to unknown helper '{0}'")]
    UnknownHelper(String),
    #[error("division by zero")]
    DivideByZero,
}

/// A taxonomized last-error record attached to a source (spec.md §3: `error`
/// field) and carried in the `error` DOM event detail (spec.md §6 table).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SourceError {
    #[serde(rename = "type")]
    pub kind: SourceErrorKindTag,
    pub status: Option<u16>,
    pub message: String,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceErrorKindTag {
    Network,
    Format,
    Connection,
}

impl SourceError {
    pub fn network(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKindTag::Network,
            status,
            message: message.into(),
            raw: None,
        }
    }

    pub fn format(message: impl Into<String>, raw: Option<String>) -> Self {
        Self {
            kind: SourceErrorKindTag::Format,
            status: None,
            message: message.into(),
            raw,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKindTag::Connection,
            status: None,
            message: message.into(),
            raw: None,
        }
    }
}

/// Failure parsing the `on` attribute's `event:code` grammar (spec.md §4.I).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OnParseError {
    #[error("unterminated string literal in handler code")]
    UnterminatedString,
    #[error("unbalanced bracket/brace/paren in handler code")]
    UnbalancedDelimiter,
}

/// Key-derivation failure inside the list engine (spec.md §4.H "Key
/// validation").
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ListError {
    #[error("key expression for item {index} evaluated to null/empty")]
    EmptyKey { index: usize },
    #[error("duplicate key '{key}' in incoming batch")]
    DuplicateKey { key: String },
    #[error("`for` right-hand side requires a key variable to iterate an object")]
    ObjectRequiresKeyVariable,
}
