//! CLI command modules.

pub mod content;
pub mod lookup;
