//! Capability interceptor
//!
//! Swaps the guarded capability implementations into a [`CapabilityTable`]
//! for the duration of one plugin execution and puts the originals back
//! afterwards. [`Interceptor::scope`] ties the restore to a drop guard so it
//! also runs when the plugin body fails.

use std::sync::Arc;

use crate::sandbox::capability::{CapabilityTable, Evaluator, FileOpener, ModuleResolver};
use crate::sandbox::error::InterceptorError;
use crate::sandbox::policy::{DenyAllOpener, GuardedEvaluator, GuardedResolver, Policy};

/// The unrestricted implementations that were in the table before `install`
pub struct SavedState {
    resolver: Arc<dyn ModuleResolver>,
    opener: Arc<dyn FileOpener>,
    evaluator: Arc<dyn Evaluator>,
}

pub struct Interceptor {
    table: Arc<CapabilityTable>,
    policy: Arc<Policy>,
}

impl Interceptor {
    pub fn new(table: Arc<CapabilityTable>, policy: Arc<Policy>) -> Self {
        Self { table, policy }
    }

    /// Replace all three capabilities with their guarded versions
    ///
    /// # Errors
    /// Returns [`InterceptorError::AlreadyIntercepted`] if the table is
    /// already intercepted; nested installs are never stacked.
    pub fn install(&self) -> Result<SavedState, InterceptorError> {
        let mut slots = self.table.lock();
        if slots.intercepted {
            return Err(InterceptorError::AlreadyIntercepted);
        }

        let saved = SavedState {
            resolver: Arc::clone(&slots.resolver),
            opener: Arc::clone(&slots.opener),
            evaluator: Arc::clone(&slots.evaluator),
        };

        slots.resolver = Arc::new(GuardedResolver::new(
            Arc::clone(&saved.resolver),
            Arc::clone(&self.policy),
            Arc::downgrade(&self.table),
        ));
        slots.opener = Arc::new(DenyAllOpener);
        slots.evaluator = Arc::new(GuardedEvaluator::new(
            Arc::clone(&saved.evaluator),
            Arc::clone(&self.policy),
        ));
        slots.intercepted = true;

        crate::log_debug!("Capabilities intercepted");
        Ok(saved)
    }

    /// Put the saved implementations back, unconditionally
    pub fn restore(&self, saved: SavedState) {
        let mut slots = self.table.lock();
        slots.resolver = saved.resolver;
        slots.opener = saved.opener;
        slots.evaluator = saved.evaluator;
        slots.intercepted = false;

        crate::log_debug!("Capabilities restored");
    }

    /// Install now and restore when the returned guard is dropped
    pub fn scope(&self) -> Result<InterceptScope<'_>, InterceptorError> {
        let saved = self.install()?;
        Ok(InterceptScope {
            interceptor: self,
            saved: Some(saved),
        })
    }
}

#[must_use = "capabilities are restored as soon as the scope is dropped"]
pub struct InterceptScope<'a> {
    interceptor: &'a Interceptor,
    saved: Option<SavedState>,
}

impl Drop for InterceptScope<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.interceptor.restore(saved);
        }
    }
}
