//! Parsed-script cache.

use std::sync::Arc;

use parking_lot::Mutex;
use tcf_core::BoundedCache;

use crate::{
    parser::{ParseError, Parser},
    token::Token,
};

/// Memoises `script text -> tokens` for scripts that are run repeatedly.
pub struct ScriptCache {
    parser: Parser,
    scripts: Mutex<BoundedCache<String, Arc<[Token]>>>,
}

impl ScriptCache {
    #[must_use]
    pub fn new(capacity: usize, parser: Parser) -> Self {
        Self {
            parser,
            scripts: Mutex::new(BoundedCache::new(capacity)),
        }
    }

    #[must_use]
    pub const fn parser(&self) -> Parser {
        self.parser
    }

    /// Tokens of `script`, parsing it on first use.
    ///
    /// Scripts that fail to parse are not cached.
    ///
    /// # Errors
    /// Returns the parser's error.
    pub fn tokens(&self, script: &str) -> Result<Arc<[Token]>, ParseError> {
        let key = script.to_string();
        if let Some(tokens) = self.scripts.lock().get(&key) {
            return Ok(Arc::clone(tokens));
        }
        let tokens: Arc<[Token]> = self.parser.parse(script)?.into();
        self.scripts.lock().insert(key, Arc::clone(&tokens));
        Ok(tokens)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scripts.lock().is_empty()
    }

    pub fn clear(&self) {
        self.scripts.lock().clear();
    }
}
