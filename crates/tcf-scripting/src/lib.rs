//! Line-oriented command scripts.
//!
//! Provides:
//! - `Parser` - Turns script text into command tokens
//! - `ScriptCache` - Memoises parsed scripts
//! - `ScriptLauncher` - Runs tokens one after another over a dedicated channel
//!
//! A script looks like:
//!
//! ```text
//! # comments and connect lines are ignored
//! connect TCP:10.0.0.2:1534
//! tcf Diagnostics echo "hello world"
//! tcf FileSystem open "/tmp/a.txt" [1,2,3]
//! ```

pub mod cache;
pub mod launcher;
pub mod parser;
pub mod token;

pub use cache::ScriptCache;
pub use launcher::{ScriptCallback, ScriptError, ScriptEvent, ScriptLauncher, TraceDirection};
pub use parser::{ParseError, Parser, is_complete};
pub use token::{Argument, Token};
