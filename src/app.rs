//! Process-wide wiring (spec §4's "App / wiring" component, §9's "inject an
//! `App` value explicitly" note).
//!
//! Rather than hidden global state, callers construct exactly one `App` per
//! process and thread it through; the Local context remains a true
//! singleton (spec §5) because every `Context::local()` call returns the
//! same handle regardless of which `App` asked for it, but the task
//! directory and template temp dir are owned by this value.

use std::sync::Arc;

use crate::{context::Context, task::TaskDirectory};

pub struct App {
    pub local_context: Context,
    pub directory: Arc<dyn TaskDirectory>,
}

impl App {
    pub fn new(directory: Arc<dyn TaskDirectory>) -> Self {
        Self { local_context: Context::local(), directory }
    }

    pub fn package(&self) -> crate::task::Package {
        crate::task::Package::new(self.local_context.clone(), Arc::clone(&self.directory))
    }
}

impl Drop for App {
    fn drop(&mut self) {
        crate::template::cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StaticTaskDirectory;

    #[test]
    fn local_context_is_the_process_singleton() {
        let app = App::new(Arc::new(StaticTaskDirectory::new()));
        assert_eq!(app.local_context.descriptor(), Context::local().descriptor());
    }
}
