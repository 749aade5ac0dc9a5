//! Small helpers shared across the crate.

use tokio::task::consume_budget;

/// Drops every element of `container`, yielding to the scheduler between
/// elements so that destroying a large container does not stall the
/// worker.
pub(crate) async fn clear_gently<C>(container: C)
where
    C: IntoIterator,
{
    for element in container {
        drop(element);
        consume_budget().await;
    }
}
