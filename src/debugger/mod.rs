pub mod backend;
pub mod breakpoint;
pub mod disasm;
pub mod error;
pub mod expression;
pub mod pathmap;
pub mod session;
pub mod unwind;
pub mod variable;
pub mod webview;

pub use error::Error;
