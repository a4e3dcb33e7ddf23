pub mod codex;
pub mod runner;

pub use codex::*;
pub use runner::*;
