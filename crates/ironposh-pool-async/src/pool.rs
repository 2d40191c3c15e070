use std::{
    collections::{HashMap, VecDeque},
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{
    FutureExt,
    channel::oneshot,
    future::{BoxFuture, Fuse},
};
use ironposh_pool_core::{PoolConfig, PoolError, RunspaceId, RunspaceState, is_reusable};
use tracing::{debug, info, instrument, warn};

use crate::{InvocationContext, Runspace, RunspaceFactory};

/// What a waiting lease receives from the runspace that frees up.
enum Handoff<R> {
    /// An idle runspace, already marked rented on the waiter's behalf.
    Runspace(Idle<R>),
    /// A reserved slot the waiter may fill with a newly created runspace.
    Vacancy,
}

struct Idle<R> {
    runspace: Arc<R>,
    /// Returned through `Drop` without a reset; reset on the next lease.
    needs_reset: bool,
}

#[derive(Debug, Default)]
struct Entry {
    rent_count: u32,
    rented: bool,
    retiring: bool,
}

struct PoolState<R> {
    entries: HashMap<RunspaceId, Entry>,
    idle: VecDeque<Idle<R>>,
    /// Runspaces alive plus slots reserved for runspaces being created.
    live: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<R>>>,
    closed: bool,
}

impl<R: Runspace> PoolState<R> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            idle: VecDeque::new(),
            live: 0,
            waiters: VecDeque::new(),
            closed: false,
        }
    }

    /// A runspace went away. Its slot goes to the first waiter still listening.
    fn free_slot(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(Handoff::Vacancy).is_ok() {
                return;
            }
        }
        self.live = self.live.saturating_sub(1);
    }

    /// Hands an idle runspace to the longest waiting lease, or parks it.
    fn dispatch(&mut self, mut idle: Idle<R>) {
        let id = idle.runspace.id();
        while let Some(waiter) = self.waiters.pop_front() {
            self.set_rented(id, true);
            match waiter.send(Handoff::Runspace(idle)) {
                Ok(()) => return,
                Err(Handoff::Runspace(back)) => {
                    self.set_rented(id, false);
                    idle = back;
                }
                Err(Handoff::Vacancy) => return,
            }
        }
        self.idle.push_back(idle);
    }

    fn set_rented(&mut self, id: RunspaceId, rented: bool) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.rented = rented;
        }
    }

    fn remove(&mut self, id: RunspaceId) {
        self.entries.remove(&id);
        if self.closed {
            self.live = self.live.saturating_sub(1);
        } else {
            self.free_slot();
        }
    }

    /// Drops idle runspaces that broke or closed while parked.
    fn sweep(&mut self) -> Vec<Arc<R>> {
        let mut stale = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        while let Some(idle) = self.idle.pop_front() {
            let runspace = &idle.runspace;
            if is_reusable(runspace.state().state, runspace.availability()) {
                kept.push_back(idle);
            } else {
                stale.push(idle.runspace);
            }
        }
        self.idle = kept;

        for runspace in &stale {
            self.remove(runspace.id());
        }
        stale
    }
}

/// A snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub live: usize,
    pub idle: usize,
    pub rented: usize,
    pub waiters: usize,
    pub closed: bool,
}

/// Returns a lease's runspace to whichever pool it came from.
trait ReturnToPool<R>: Send + Sync {
    /// Returns `true` when the runspace went back into circulation.
    fn give_back(&self, runspace: Arc<R>, retire: bool, needs_reset: bool) -> bool;
}

struct PoolInner<F: RunspaceFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Runspace>>,
}

impl<F: RunspaceFactory> PoolInner<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Runspace>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a runspace rented and counts the lease against its rent limit.
    fn checkout(self: &Arc<Self>, runspace: Arc<F::Runspace>) -> LeasedRunspace<F::Runspace> {
        let id = runspace.id();
        let max_rent_count = self.config.max_rent_count;

        let (rent_count, retiring) = {
            let mut state = self.lock();
            let entry = state.entries.entry(id).or_default();
            entry.rented = true;
            entry.rent_count += 1;
            if entry.rent_count >= max_rent_count {
                entry.retiring = true;
            }
            (entry.rent_count, entry.retiring)
        };

        debug!(target: "pool", runspace_id = %id, rent_count, retiring, "runspace leased");

        let pool: Arc<dyn ReturnToPool<F::Runspace>> = Arc::<Self>::clone(self);
        LeasedRunspace {
            runspace,
            pool,
            rent_count,
            retiring,
            returned: false,
        }
    }

    /// Fills a reserved slot with a new, unopened runspace.
    fn create_in_slot(self: &Arc<Self>) -> Result<LeasedRunspace<F::Runspace>, PoolError> {
        match self.factory.create(&self.config.connection) {
            Ok(runspace) => {
                let runspace = Arc::new(runspace);
                info!(target: "pool", runspace_id = %runspace.id(), connection = self.config.connection.target(), "runspace created");
                self.lock().entries.insert(runspace.id(), Entry::default());
                Ok(self.checkout(runspace))
            }
            Err(e) => {
                warn!(target: "pool", error = %e, "failed to create runspace");
                let mut state = self.lock();
                if state.closed {
                    state.live = state.live.saturating_sub(1);
                } else {
                    state.free_slot();
                }
                Err(e)
            }
        }
    }

    fn fill_to_min(&self) -> Result<(), PoolError> {
        let min_size = self.config.min_size;
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(PoolError::PoolClosed);
                }
                if state.live >= min_size {
                    return Ok(());
                }
                state.live += 1;
            }

            match self.factory.create(&self.config.connection) {
                Ok(runspace) => {
                    let runspace = Arc::new(runspace);
                    debug!(target: "pool", runspace_id = %runspace.id(), "pre-created runspace");
                    let mut state = self.lock();
                    state.entries.insert(runspace.id(), Entry::default());
                    state.dispatch(Idle {
                        runspace,
                        needs_reset: false,
                    });
                }
                Err(e) => {
                    self.lock().free_slot();
                    return Err(e);
                }
            }
        }
    }

    /// Tops the pool back up to `min_size` after a runspace left it.
    fn replenish(&self) {
        if self.config.min_size == 0 {
            return;
        }
        match self.fill_to_min() {
            Ok(()) | Err(PoolError::PoolClosed) => {}
            Err(e) => warn!(target: "pool", error = %e, "failed to refill pool to min_size"),
        }
    }

    /// Puts back a handoff that reached a waiter which gave up.
    fn recover(&self, handoff: Handoff<F::Runspace>) {
        let disposed = {
            let mut state = self.lock();
            match handoff {
                Handoff::Vacancy if state.closed => {
                    state.live = state.live.saturating_sub(1);
                    None
                }
                Handoff::Vacancy => {
                    state.free_slot();
                    None
                }
                Handoff::Runspace(idle) if state.closed => {
                    state.remove(idle.runspace.id());
                    Some(idle.runspace)
                }
                Handoff::Runspace(idle) => {
                    state.set_rented(idle.runspace.id(), false);
                    state.dispatch(idle);
                    None
                }
            }
        };

        if let Some(runspace) = disposed {
            runspace.close();
        }
    }
}

impl<F: RunspaceFactory> ReturnToPool<F::Runspace> for PoolInner<F> {
    fn give_back(&self, runspace: Arc<F::Runspace>, retire: bool, needs_reset: bool) -> bool {
        let id = runspace.id();
        let info = runspace.state();
        let reusable = is_reusable(info.state, runspace.availability());

        let disposed = {
            let mut state = self.lock();
            let retiring = retire || state.entries.get(&id).is_some_and(|e| e.retiring);
            if state.closed || retiring || !reusable {
                state.remove(id);
                Some(runspace)
            } else {
                state.set_rented(id, false);
                state.dispatch(Idle {
                    runspace,
                    needs_reset,
                });
                None
            }
        };

        match disposed {
            Some(runspace) => {
                debug!(target: "pool", runspace_id = %id, state = ?info.state, retire, "runspace disposed");
                runspace.close();
                self.replenish();
                false
            }
            None => {
                debug!(target: "pool", runspace_id = %id, needs_reset, "runspace returned");
                true
            }
        }
    }
}

impl<F: RunspaceFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for idle in state.idle.drain(..) {
            idle.runspace.close();
        }
    }
}

/// A pending lease parked in the waiter queue.
struct Waiter<'a, F: RunspaceFactory> {
    rx: oneshot::Receiver<Handoff<F::Runspace>>,
    pool: &'a PoolInner<F>,
}

impl<F: RunspaceFactory> Drop for Waiter<'_, F> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Some(handoff)) = self.rx.try_recv() {
            self.pool.recover(handoff);
        }
    }
}

enum Acquire<R> {
    Existing(Idle<R>),
    Slot,
    Wait(oneshot::Receiver<Handoff<R>>),
}

/// A bounded set of reusable runspaces.
///
/// At most `max_size` runspaces exist at once, counting rented and idle ones.
/// Leases that find the pool exhausted wait in arrival order.
pub struct RunspacePool<F: RunspaceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: RunspaceFactory> Clone for RunspacePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: RunspaceFactory> RunspacePool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        info!(
            target: "pool",
            max_size = config.max_size,
            min_size = config.min_size,
            max_rent_count = config.max_rent_count,
            "creating runspace pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState::new()),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Obtains exclusive use of a runspace, waiting while the pool is exhausted.
    #[instrument(skip_all)]
    pub async fn lease(
        &self,
        ctx: &InvocationContext,
    ) -> Result<LeasedRunspace<F::Runspace>, PoolError> {
        let mut interrupt = ctx.interrupt(None);
        self.lease_until(&mut interrupt).await
    }

    pub(crate) async fn lease_until(
        &self,
        interrupt: &mut Fuse<BoxFuture<'static, PoolError>>,
    ) -> Result<LeasedRunspace<F::Runspace>, PoolError> {
        if let Some(reason) = (&mut *interrupt).now_or_never() {
            return Err(reason);
        }

        loop {
            let (acquire, stale) = {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(PoolError::PoolClosed);
                }

                let stale = state.sweep();
                let acquire = if let Some(idle) = state.idle.pop_back() {
                    state.set_rented(idle.runspace.id(), true);
                    Acquire::Existing(idle)
                } else if state.live < self.inner.config.max_size {
                    state.live += 1;
                    Acquire::Slot
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Acquire::Wait(rx)
                };
                (acquire, stale)
            };

            let swept = !stale.is_empty();
            for runspace in stale {
                debug!(target: "pool", runspace_id = %runspace.id(), "disposing stale idle runspace");
                runspace.close();
            }
            if swept {
                self.inner.replenish();
            }

            let idle = match acquire {
                Acquire::Existing(idle) => idle,
                Acquire::Slot => return self.inner.create_in_slot(),
                Acquire::Wait(rx) => {
                    debug!(target: "pool", "pool exhausted, waiting for a runspace");
                    let mut waiter = Waiter {
                        rx,
                        pool: &self.inner,
                    };

                    let handoff = futures::select! {
                        handoff = &mut waiter.rx => handoff,
                        reason = &mut *interrupt => return Err(reason),
                    };
                    drop(waiter);

                    match handoff {
                        Err(oneshot::Canceled) => return Err(PoolError::PoolClosed),
                        Ok(Handoff::Vacancy) => {
                            if self.is_closed() {
                                self.inner.recover(Handoff::Vacancy);
                                return Err(PoolError::PoolClosed);
                            }
                            return self.inner.create_in_slot();
                        }
                        Ok(Handoff::Runspace(idle)) => {
                            if self.is_closed() {
                                self.inner.recover(Handoff::Runspace(idle));
                                return Err(PoolError::PoolClosed);
                            }
                            idle
                        }
                    }
                }
            };

            let needs_reset = idle.needs_reset;
            let mut lease = self.inner.checkout(idle.runspace);
            if !needs_reset {
                return Ok(lease);
            }

            let reset = futures::select! {
                reset = lease.runspace().reset().fuse() => reset,
                reason = &mut *interrupt => return Err(reason),
            };

            match reset {
                Ok(()) => return Ok(lease),
                Err(e) => {
                    warn!(target: "pool", runspace_id = %lease.id(), error = %e, "deferred reset failed, discarding runspace");
                    lease.retire();
                }
            }
        }
    }

    /// Creates unopened runspaces until `min_size` are alive. Runs again by
    /// itself whenever a runspace is disposed or swept.
    pub fn ensure_min_size(&self) -> Result<(), PoolError> {
        self.inner.fill_to_min()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            live: state.live,
            idle: state.idle.len(),
            rented: state.entries.values().filter(|e| e.rented).count(),
            waiters: state.waiters.iter().filter(|w| !w.is_canceled()).count(),
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes every idle runspace and fails pending leases. Rented runspaces
    /// are closed when their lease ends.
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            let idle: Vec<_> = state.idle.drain(..).collect();
            for entry in &idle {
                state.entries.remove(&entry.runspace.id());
                state.live = state.live.saturating_sub(1);
            }
            (idle, std::mem::take(&mut state.waiters))
        };

        info!(target: "pool", idle = idle.len(), waiters = waiters.len(), "closing runspace pool");

        // dropping the senders wakes every waiter with `PoolClosed`
        drop(waiters);
        for entry in idle {
            entry.runspace.close();
        }
    }
}

/// Exclusive use of one pooled runspace.
///
/// Dropping the lease returns the runspace to the pool; its reset then runs on
/// the next lease. [`LeasedRunspace::release`] resets it right away instead.
pub struct LeasedRunspace<R: Runspace> {
    runspace: Arc<R>,
    pool: Arc<dyn ReturnToPool<R>>,
    rent_count: u32,
    retiring: bool,
    returned: bool,
}

impl<R: Runspace> LeasedRunspace<R> {
    pub fn runspace(&self) -> &R {
        &self.runspace
    }

    /// How many times this runspace has been leased, this lease included.
    pub fn rent_count(&self) -> u32 {
        self.rent_count
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    /// Disposes the runspace instead of reusing it when the lease ends.
    pub fn retire(&mut self) {
        self.retiring = true;
    }

    /// Resets the runspace and returns it to the pool. Returns `false` when
    /// it was disposed instead.
    pub async fn release(mut self) -> bool {
        let runspace = Arc::clone(&self.runspace);
        let state = runspace.state().state;

        if !self.retiring
            && state == RunspaceState::Opened
            && is_reusable(state, runspace.availability())
        {
            if let Err(e) = runspace.reset().await {
                warn!(target: "pool", runspace_id = %runspace.id(), error = %e, "reset failed, retiring runspace");
                self.retiring = true;
            }
        }

        self.returned = true;
        self.pool.give_back(runspace, self.retiring, false)
    }
}

impl<R: Runspace> Deref for LeasedRunspace<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        &self.runspace
    }
}

impl<R: Runspace> Drop for LeasedRunspace<R> {
    fn drop(&mut self) {
        if self.returned {
            return;
        }

        let runspace = Arc::clone(&self.runspace);
        let needs_reset = runspace.state().state == RunspaceState::Opened;
        self.pool.give_back(runspace, self.retiring, needs_reset);
    }
}

impl<R: Runspace> std::fmt::Debug for LeasedRunspace<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedRunspace")
            .field("runspace_id", &self.runspace.id())
            .field("rent_count", &self.rent_count)
            .field("retiring", &self.retiring)
            .finish()
    }
}
