//! Name -> handler registry for mail replay.

use std::sync::Arc;

use ahash::AHashMap;
use anyhow::Result;

use crate::error::RecoveryError;
use crate::mailbox::MailArg;

/// A replay-side mail handler: reconstructs the mail's effect from its
/// logged `(name, args)`.
pub type MailHandler<C> = Arc<dyn Fn(&mut C, &[MailArg]) -> Result<()> + Send + Sync>;

/// Registry binding every recognized mail name to its handler.
///
/// Binding happens once at startup; the name strings are frozen as part of
/// the log format. A name encountered during replay without a binding is a
/// fatal recovery error.
pub struct MailResolver<C> {
    handlers: AHashMap<String, MailHandler<C>>,
}

impl<C> Default for MailResolver<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MailResolver<C> {
    pub fn new() -> Self {
        Self {
            handlers: AHashMap::new(),
        }
    }

    pub fn bind(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&mut C, &[MailArg]) -> Result<()> + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug_assert!(
            !self.handlers.contains_key(&name),
            "mail name {name:?} bound twice"
        );
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Bind a name whose replayed effect is nothing (wake mails, pings).
    pub fn bind_no_op(&mut self, name: impl Into<String>) {
        self.bind(name, |_, _| Ok(()));
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<MailHandler<C>, RecoveryError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| RecoveryError::UnknownMailName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_dispatches_bound_handler() {
        let mut resolver: MailResolver<Vec<u64>> = MailResolver::new();
        resolver.bind("record id", |ctx, args| {
            ctx.push(args[0].as_u64().unwrap());
            Ok(())
        });

        let mut seen = Vec::new();
        let handler = resolver.resolve("record id").unwrap();
        handler(&mut seen, &[MailArg::U64(17)]).unwrap();
        assert_eq!(seen, vec![17]);
    }

    #[test]
    fn test_unknown_name_is_fatal() {
        let resolver: MailResolver<()> = MailResolver::new();
        let err = match resolver.resolve("nope") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve(\"nope\") to fail"),
        };
        assert_eq!(err, RecoveryError::UnknownMailName("nope".to_string()));
    }
}
