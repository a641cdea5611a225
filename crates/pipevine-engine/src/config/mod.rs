//! Configuration document handling: parsing and validation.

pub mod parser;
pub mod validator;

pub use parser::{load_document, parse_document, substitute_env_vars};
pub use validator::{validate, ValidationReport};
