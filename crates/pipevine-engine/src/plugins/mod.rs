//! Compiled-in plugin set.
//!
//! Deliberately small: `echo` and `delay` cover smoke tests and demo
//! pipelines. Real workloads register their own capabilities on the
//! registry at startup.

mod delay;
mod echo;

use std::sync::Arc;

pub use delay::DelayPlugin;
pub use echo::EchoPlugin;

use crate::plugin::Plugin;

/// The built-in plugin set, ready for registration.
#[must_use]
pub fn builtins() -> Vec<Arc<dyn Plugin>> {
    vec![Arc::new(EchoPlugin), Arc::new(DelayPlugin)]
}
