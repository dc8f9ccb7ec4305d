//! Schema/XML context handle.
//!
//! Schema validation and YANG tree construction are external concerns; the
//! session engine only carries a shared handle so every session parsing a
//! message resolves against the same context. Sessions hold the context as
//! `Arc<Context>`, so its lifetime automatically outlives every session
//! using it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A shared schema/XML context.
#[derive(Debug, Default)]
pub struct Context {
    searchpath: Mutex<Option<PathBuf>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory searched for schema files.
    pub fn set_searchpath(&self, path: impl AsRef<Path>) {
        *crate::session::plock(&self.searchpath) = Some(path.as_ref().to_path_buf());
    }

    /// The configured schema search path, if any.
    pub fn searchpath(&self) -> Option<PathBuf> {
        crate::session::plock(&self.searchpath).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_searchpath() {
        let ctx = Context::new();
        assert!(ctx.searchpath().is_none());
        ctx.set_searchpath("/tmp/schemas");
        assert_eq!(ctx.searchpath(), Some(PathBuf::from("/tmp/schemas")));
    }
}
