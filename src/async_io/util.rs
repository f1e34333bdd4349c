use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;


/// Shared by a [`TaskGroup`] and its tokens. Dropping the last strong
/// reference wakes whoever waits for the group.
#[derive(Default)]
struct Shared {
    waiter: AtomicWaker,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.waiter.wake();
    }
}

/// Counts running tasks, so that they can be awaited at shutdown.
///
/// Every task holds a [`TaskToken`]. Awaiting the group itself completes once
/// all tokens are gone.
#[derive(Default)]
pub(crate) struct TaskGroup(Arc<Shared>);

impl TaskGroup {
    /// Registers a new task.
    #[inline]
    pub(crate) fn token(&self) -> TaskToken {
        TaskToken(Arc::clone(&self.0))
    }

    /// Returns the number of tokens alive.
    #[inline]
    #[must_use]
    pub(crate) fn active(&self) -> usize {
        Arc::strong_count(&self.0) - 1
    }
}

impl IntoFuture for TaskGroup {
    type Output = ();
    type IntoFuture = Drained;

    fn into_future(self) -> Drained {
        Drained(Arc::downgrade(&self.0))
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskGroup").field("active", &self.active()).finish()
    }
}


/// Marks a task of a [`TaskGroup`] as running until dropped.
#[must_use = "the task counts as finished once its token is dropped"]
pub(crate) struct TaskToken(Arc<Shared>);

impl fmt::Debug for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TaskToken")
    }
}


/// Completes once every [`TaskToken`] of a [`TaskGroup`] was dropped.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub(crate) struct Drained(Weak<Shared>);

impl Future for Drained {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let Some(shared) = self.0.upgrade() else {
            return Poll::Ready(());
        };
        shared.waiter.register(cx.waker());
        // Our own upgrade may have been the last strong reference
        drop(shared);
        if self.0.strong_count() == 0 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl fmt::Debug for Drained {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Drained").field("active", &self.0.strong_count()).finish()
    }
}


#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;

    #[test]
    fn drains_after_last_token() {
        let group = TaskGroup::default();
        let a = group.token();
        let b = group.token();
        assert_eq!(group.active(), 2);
        drop(a);
        assert_eq!(group.active(), 1);

        let mut drained = group.into_future();
        assert!((&mut drained).now_or_never().is_none());
        drop(b);
        assert!(drained.now_or_never().is_some());
    }

    #[test]
    fn empty_group() {
        assert!(TaskGroup::default().into_future().now_or_never().is_some());
    }
}
