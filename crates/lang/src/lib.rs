//! The embedded expression language: a small Lisp whose machine state is the
//! result of folding an evaluator over an append-only input log.
//!
//! The daemon core treats this crate as an opaque collaborator: `State` with
//! an initial empty form and the pure transition `State::apply`, plus a JSON
//! bridge for values crossing the HTTP and pub/sub boundaries.

mod eval;
mod parse;
mod value;

pub use eval::{
    LangError,
    State,
};
pub use parse::parse_one;
pub use value::Value;
