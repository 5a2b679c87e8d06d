//! Error types for parsing compatibility documents.

use thiserror::Error;

/// Errors raised while parsing a compatibility document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed compatibility document: {0}")]
    Malformed(String),

    #[error("Empty machine family identifier")]
    EmptyFamily,

    #[error("Empty disk type identifier under machine family {family}")]
    EmptyDiskType { family: String },
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;
