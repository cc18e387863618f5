//! Built-in tools demonstrating the tool contract.

pub mod fetch;
pub mod shell;
