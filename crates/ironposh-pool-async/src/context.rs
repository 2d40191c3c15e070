use std::{future::Future, time::Duration};

use futures::{
    FutureExt,
    future::{BoxFuture, Either, Fuse},
};
use ironposh_pool_core::PoolError;
use tokio_util::sync::CancellationToken;

/// Caller-side limits for a lease or an invocation.
#[derive(Debug, Clone, Default, typed_builder::TypedBuilder)]
pub struct InvocationContext {
    #[builder(default, setter(strip_option))]
    pub cancel: Option<CancellationToken>,
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            timeout: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: None,
            timeout: Some(timeout),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// The shorter of the context timeout and `other`.
    pub fn effective_timeout(&self, other: Option<Duration>) -> Option<Duration> {
        match (self.timeout, other) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// A future resolving with the reason the operation must stop: the token
    /// was cancelled, or the effective timeout elapsed. Pending forever when
    /// the context sets neither.
    pub fn interrupt(&self, extra_timeout: Option<Duration>) -> Fuse<BoxFuture<'static, PoolError>> {
        let cancelled = match self.cancel.clone() {
            Some(token) => token.cancelled_owned().map(|()| PoolError::Cancelled).boxed(),
            None => futures::future::pending().boxed(),
        };

        let elapsed = match self.effective_timeout(extra_timeout) {
            Some(dur) => futures_timer::Delay::new(dur)
                .map(move |()| PoolError::Timeout(dur))
                .boxed(),
            None => futures::future::pending().boxed(),
        };

        futures::future::select(cancelled, elapsed)
            .map(|either| either.factor_first().0)
            .boxed()
            .fuse()
    }
}

/// Races `fut` against a timer.
pub async fn with_timeout<F, T>(fut: F, dur: Duration) -> Result<T, PoolError>
where
    F: Future<Output = T>,
{
    let timeout = futures_timer::Delay::new(dur);

    futures::pin_mut!(timeout);
    futures::pin_mut!(fut);

    match futures::future::select(fut, timeout).await {
        Either::Left((val, _sleep)) => Ok(val),
        Either::Right(((), _fut)) => Err(PoolError::Timeout(dur)),
    }
}
