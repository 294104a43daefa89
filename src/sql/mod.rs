pub mod compiler;
pub mod types;

pub use compiler::{compile, compile_select, escape_like, quote_ident};
pub use types::*;
