//! Abstract syntax tree. One node kind per concern, mirroring the grammar;
//! `Display` impls give every node its canonical source-like rendering.

mod expression;
mod program;
mod statement;

pub use expression::*;
pub use program::*;
pub use statement::*;
