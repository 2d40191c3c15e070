use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use ironposh_pool_core::{ErrorRecord, PoolError, PsItem};
use tracing::debug;

use crate::PsItemStream;

/// Decides whether an error record triggers the policy.
pub type ErrorPredicate = Arc<dyn Fn(&ErrorRecord) -> bool + Send + Sync>;

/// How embedded error records affect a result stream.
#[derive(Clone, Default)]
pub enum ErrorPolicy {
    /// Values and error records both reach the caller.
    #[default]
    PassThrough,
    /// End the stream gracefully at the first matching error, dropping it.
    TerminateOnError(ErrorPredicate),
    /// Raise the first matching error as the stream's terminal failure.
    FailOnError(ErrorPredicate),
}

fn any_error() -> ErrorPredicate {
    Arc::new(|_| true)
}

impl ErrorPolicy {
    pub fn terminate_on_error() -> Self {
        Self::TerminateOnError(any_error())
    }

    pub fn terminate_on<P>(predicate: P) -> Self
    where
        P: Fn(&ErrorRecord) -> bool + Send + Sync + 'static,
    {
        Self::TerminateOnError(Arc::new(predicate))
    }

    pub fn fail_on_error() -> Self {
        Self::FailOnError(any_error())
    }

    pub fn fail_on<P>(predicate: P) -> Self
    where
        P: Fn(&ErrorRecord) -> bool + Send + Sync + 'static,
    {
        Self::FailOnError(Arc::new(predicate))
    }

    pub fn apply(self, items: PsItemStream) -> PsItemStream {
        match self {
            ErrorPolicy::PassThrough => items,
            ErrorPolicy::TerminateOnError(predicate) => items.until_error(predicate),
            ErrorPolicy::FailOnError(predicate) => items.throw_on_error(predicate),
        }
    }
}

impl std::fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPolicy::PassThrough => write!(f, "PassThrough"),
            ErrorPolicy::TerminateOnError(_) => write!(f, "TerminateOnError(..)"),
            ErrorPolicy::FailOnError(_) => write!(f, "FailOnError(..)"),
        }
    }
}

/// Error policy operators on a result stream.
///
/// Neither operator awaits anything besides its upstream. Ending early drops
/// the upstream, which runs the execution's cleanup.
pub trait PsItemStreamExt {
    fn until_error(self, predicate: ErrorPredicate) -> PsItemStream;

    fn throw_on_error(self, predicate: ErrorPredicate) -> PsItemStream;
}

impl PsItemStreamExt for PsItemStream {
    fn until_error(self, predicate: ErrorPredicate) -> PsItemStream {
        Box::pin(stream! {
            let mut items = self;
            while let Some(item) = items.next().await {
                if let Ok(PsItem::Error(record)) = &item {
                    if predicate(record) {
                        debug!(target: "pipeline", error = %record, "terminating stream on error");
                        break;
                    }
                }
                yield item;
            }
        })
    }

    fn throw_on_error(self, predicate: ErrorPredicate) -> PsItemStream {
        Box::pin(stream! {
            let mut items = self;
            while let Some(item) = items.next().await {
                match item {
                    Ok(PsItem::Error(record)) if predicate(&record) => {
                        drop(items);
                        let error = if record.is_dirty_pipeline() {
                            PoolError::DirtyPipeline(record.message)
                        } else {
                            PoolError::Remote(record)
                        };
                        yield Err(error);
                        break;
                    }
                    other => yield other,
                }
            }
        })
    }
}
