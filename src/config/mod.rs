pub mod display;
pub mod parser;
pub mod types;
pub mod validate;

pub use types::{group_by_bind, AppConfig, BindGroup, Location, Method, Redirect, ServerConfig};

use std::fmt;

/// A line/column within the config text, 1-based, pinpointing where a
/// `ConfigError` was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, col {}", self.line, self.col)
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub loc: Loc,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.loc)
    }
}

impl std::error::Error for ConfigError {}

pub use parser::parse;
pub use validate::validate;
