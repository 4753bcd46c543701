//! scoped-context — immutable per-request data bound to a task's dynamic extent
//!
//! A [`RequestContext`] is created once per accepted connection and moved into
//! [`scope`]. Anything that runs inside that future, however deep in the call
//! chain, can read it back through [`with`] / [`try_with`] without it being
//! passed as a parameter. Once the future completes the binding is gone, and a
//! lookup fails with [`ContextError::NotBound`] instead of returning a stale value.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Request-scoped data captured at accept time.
///
/// Deliberately not `Clone`: each connection owns exactly one instance.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestContext {
    created_at_millis: u64,
}

impl RequestContext {
    /// Capture the current wall-clock time (Unix epoch milliseconds).
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::at(millis)
    }

    /// Build a context with an explicit timestamp.
    pub fn at(created_at_millis: u64) -> Self {
        RequestContext { created_at_millis }
    }

    pub fn created_at_millis(&self) -> u64 {
        self.created_at_millis
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("request context not bound")]
    NotBound,
}

/// Run `fut` with `ctx` bound for its whole dynamic extent.
///
/// Spawned tasks do not inherit the binding. Nesting shadows the outer
/// context until the inner future completes.
pub async fn scope<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// Synchronous counterpart of [`scope`].
pub fn sync_scope<F, R>(ctx: RequestContext, f: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT.sync_scope(ctx, f)
}

/// Access the bound context, or [`ContextError::NotBound`] outside a scope.
pub fn try_with<F, R>(f: F) -> Result<R, ContextError>
where
    F: FnOnce(&RequestContext) -> R,
{
    CURRENT.try_with(f).map_err(|_| ContextError::NotBound)
}

/// Access the bound context.
///
/// # Panics
///
/// Panics with "request context not bound" when called outside [`scope`].
pub fn with<F, R>(f: F) -> R
where
    F: FnOnce(&RequestContext) -> R,
{
    match try_with(f) {
        Ok(r) => r,
        Err(e) => panic!("{}", e),
    }
}

/// Timestamp of the bound context.
pub fn created_at_millis() -> Result<u64, ContextError> {
    try_with(RequestContext::created_at_millis)
}

pub fn is_bound() -> bool {
    try_with(|_| ()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_lookup() -> u64 {
        with(|ctx| ctx.created_at_millis())
    }

    #[tokio::test]
    async fn test_visible_to_helpers_inside_scope() {
        let seen = scope(RequestContext::at(42), async {
            tokio::task::yield_now().await;
            nested_lookup()
        })
        .await;
        assert_eq!(seen, 42);
    }

    #[tokio::test]
    async fn test_unbound_after_scope_exits() {
        scope(RequestContext::at(1), async {
            assert!(is_bound());
        })
        .await;
        assert!(!is_bound());
        assert_eq!(created_at_millis(), Err(ContextError::NotBound));
    }

    #[test]
    fn test_unbound_outside_any_scope() {
        assert_eq!(try_with(|c| c.created_at_millis()), Err(ContextError::NotBound));
    }

    #[test]
    #[should_panic(expected = "request context not bound")]
    fn test_with_panics_when_unbound() {
        with(|c| c.created_at_millis());
    }

    #[test]
    fn test_sync_scope() {
        let got = sync_scope(RequestContext::at(7), || created_at_millis());
        assert_eq!(got, Ok(7));
        assert!(!is_bound());
    }

    #[tokio::test]
    async fn test_nested_scope_shadows_and_restores() {
        scope(RequestContext::at(1), async {
            let inner = scope(RequestContext::at(2), async { created_at_millis() }).await;
            assert_eq!(inner, Ok(2));
            assert_eq!(created_at_millis(), Ok(1));
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit() {
        let inherited = scope(RequestContext::at(5), async {
            tokio::spawn(async { is_bound() }).await.unwrap()
        })
        .await;
        assert!(!inherited);
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let a = tokio::spawn(scope(RequestContext::at(100), async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            created_at_millis()
        }));
        let b = tokio::spawn(scope(RequestContext::at(200), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            created_at_millis()
        }));
        assert_eq!(a.await.unwrap(), Ok(100));
        assert_eq!(b.await.unwrap(), Ok(200));
    }

    #[test]
    fn test_now_is_after_epoch() {
        assert!(RequestContext::now().created_at_millis() > 1_600_000_000_000);
    }
}
