//! Execution-context checks
use crate::{error::KernelError, Port, Result};

/// If the current context is not a task context, return `Err(BadContext)`.
#[inline]
pub(super) fn expect_task_context<Traits: Port>() -> Result<()> {
    if !Traits::is_task_context() {
        Err(KernelError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context may not block, return `Err(BadContext)`. Only a
/// task context is waitable.
#[inline]
pub(super) fn expect_waitable_context<Traits: Port>() -> Result<()> {
    expect_task_context::<Traits>()
}
