use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared result slot of one in-flight computation.
///
/// `Abandoned` marks a leader that went away without resolving (panicked, or
/// its future was dropped at a cancellation point). Waiters seeing it return
/// to the admission loop and race for leadership instead of hanging.
#[derive(Debug)]
pub(crate) enum TicketState<V, E> {
    Pending,
    Done(Result<V, E>),
    Abandoned,
}

/// Abandon hook shared by both ticket flavors so the leader guard can be
/// written once.
pub(crate) trait Abandon {
    fn abandon_if_pending(&self);
}

/// Tracks keys whose computation is currently running, so concurrent
/// identical calls share one execution.
///
/// The registry is keyed like the cache itself. Joining is atomic: the first
/// caller for a key becomes the leader and gets a fresh ticket, every later
/// caller gets a clone of the same ticket to wait on. The map entry lives
/// exactly as long as the computation; resolution removes it.
#[derive(Debug)]
pub(crate) struct InFlightRegistry<T> {
    tickets: DashMap<String, Arc<T>>,
}

/// Outcome of joining the registry for a key.
pub(crate) enum Flight<T> {
    /// This caller starts the computation.
    Leader(Arc<T>),
    /// Someone else is already computing; wait on their ticket.
    Waiter(Arc<T>),
}

impl<T> InFlightRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            tickets: DashMap::new(),
        }
    }

    /// Atomically joins the in-flight computation for `key`, creating the
    /// ticket if none is running.
    pub(crate) fn join_or_create(&self, key: &str, make: impl FnOnce() -> T) -> Flight<T> {
        match self.tickets.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Flight::Waiter(Arc::clone(occupied.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let ticket = Arc::new(make());
                vacant.insert(Arc::clone(&ticket));
                Flight::Leader(ticket)
            }
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        self.tickets.remove(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.tickets.len()
    }
}

/// Removes the leader's ticket from the registry when the computation ends,
/// however it ends. A leader that unwinds or is cancelled before resolving
/// leaves the ticket `Abandoned` so waiters can take over.
pub(crate) struct LeaderGuard<'a, T: Abandon> {
    registry: &'a InFlightRegistry<T>,
    ticket: Arc<T>,
    key: String,
}

impl<'a, T: Abandon> LeaderGuard<'a, T> {
    pub(crate) fn new(registry: &'a InFlightRegistry<T>, ticket: Arc<T>, key: String) -> Self {
        Self {
            registry,
            ticket,
            key,
        }
    }
}

impl<T: Abandon> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        self.ticket.abandon_if_pending();
        self.registry.remove(&self.key);
    }
}

/// Ticket for thread-blocking callers. Waiters park on a condvar until the
/// leader resolves.
#[derive(Debug)]
pub(crate) struct SyncTicket<V, E> {
    state: Mutex<TicketState<V, E>>,
    resolved: Condvar,
    waiters: AtomicUsize,
}

impl<V: Clone, E: Clone> SyncTicket<V, E> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TicketState::Pending),
            resolved: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Blocks until the leader resolves. `None` means the leader abandoned
    /// the ticket; the caller should retry admission.
    pub(crate) fn wait(&self) -> Option<Result<V, E>> {
        self.waiters.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.resolved
            .wait_while(&mut state, |s| matches!(s, TicketState::Pending));
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        match &*state {
            TicketState::Done(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Publishes the result and releases every waiter exactly once.
    pub(crate) fn resolve(&self, result: Result<V, E>) {
        let mut state = self.state.lock();
        if matches!(*state, TicketState::Pending) {
            *state = TicketState::Done(result);
            drop(state);
            self.resolved.notify_all();
        }
    }

    pub(crate) fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl<V, E> Abandon for SyncTicket<V, E> {
    fn abandon_if_pending(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TicketState::Pending) {
            *state = TicketState::Abandoned;
            drop(state);
            self.resolved.notify_all();
        }
    }
}

/// Ticket for task-suspending callers. Waiters suspend on a `Notify` and
/// re-check the slot, so a resolution between the check and the await cannot
/// be missed.
#[derive(Debug)]
pub(crate) struct AsyncTicket<V, E> {
    state: Mutex<TicketState<V, E>>,
    resolved: Notify,
    waiters: AtomicUsize,
}

impl<V: Clone, E: Clone> AsyncTicket<V, E> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TicketState::Pending),
            resolved: Notify::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Suspends until the leader resolves. `None` means the ticket was
    /// abandoned and admission should be retried. Dropping the returned
    /// future (caller cancellation) just leaves the waiter set.
    pub(crate) async fn wait(&self) -> Option<Result<V, E>> {
        struct WaiterCount<'a>(&'a AtomicUsize);
        impl Drop for WaiterCount<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let _count = WaiterCount(&self.waiters);
        loop {
            let notified = self.resolved.notified();
            match &*self.state.lock() {
                TicketState::Done(result) => return Some(result.clone()),
                TicketState::Abandoned => return None,
                TicketState::Pending => {}
            }
            notified.await;
        }
    }

    /// Publishes the result and wakes every waiter.
    pub(crate) fn resolve(&self, result: Result<V, E>) {
        let mut state = self.state.lock();
        if matches!(*state, TicketState::Pending) {
            *state = TicketState::Done(result);
            drop(state);
            self.resolved.notify_waiters();
        }
    }

    pub(crate) fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl<V, E> Abandon for AsyncTicket<V, E> {
    fn abandon_if_pending(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TicketState::Pending) {
            *state = TicketState::Abandoned;
            drop(state);
            self.resolved.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::thread;
    use std::time::Duration;

    type TestTicket = SyncTicket<i32, Infallible>;

    #[test]
    fn first_joiner_leads_later_joiners_wait() {
        let registry: InFlightRegistry<TestTicket> = InFlightRegistry::new();
        let first = registry.join_or_create("k", TestTicket::new);
        assert!(matches!(first, Flight::Leader(_)));
        let second = registry.join_or_create("k", TestTicket::new);
        assert!(matches!(second, Flight::Waiter(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn waiters_receive_resolved_value() {
        let ticket = Arc::new(TestTicket::new());
        let waiter = {
            let ticket = Arc::clone(&ticket);
            thread::spawn(move || ticket.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticket.waiters(), 1);
        ticket.resolve(Ok(7));
        assert_eq!(waiter.join().unwrap(), Some(Ok(7)));
    }

    #[test]
    fn abandoned_ticket_releases_waiters_empty_handed() {
        let ticket = Arc::new(TestTicket::new());
        let waiter = {
            let ticket = Arc::clone(&ticket);
            thread::spawn(move || ticket.wait())
        };
        thread::sleep(Duration::from_millis(20));
        ticket.abandon_if_pending();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn leader_guard_removes_ticket_on_drop() {
        let registry: InFlightRegistry<TestTicket> = InFlightRegistry::new();
        if let Flight::Leader(ticket) = registry.join_or_create("k", TestTicket::new) {
            let guard = LeaderGuard::new(&registry, Arc::clone(&ticket), "k".to_string());
            ticket.resolve(Ok(1));
            drop(guard);
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn resolve_wins_over_later_abandon() {
        let ticket = TestTicket::new();
        ticket.resolve(Ok(5));
        ticket.abandon_if_pending();
        assert_eq!(ticket.wait(), Some(Ok(5)));
    }

    #[tokio::test]
    async fn async_waiters_receive_resolved_value() {
        let ticket: Arc<AsyncTicket<i32, Infallible>> = Arc::new(AsyncTicket::new());
        let waiter = {
            let ticket = Arc::clone(&ticket);
            tokio::spawn(async move { ticket.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ticket.resolve(Ok(9));
        assert_eq!(waiter.await.unwrap(), Some(Ok(9)));
    }

    #[tokio::test]
    async fn async_abandon_releases_waiters() {
        let ticket: Arc<AsyncTicket<i32, Infallible>> = Arc::new(AsyncTicket::new());
        let waiter = {
            let ticket = Arc::clone(&ticket);
            tokio::spawn(async move { ticket.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ticket.abandon_if_pending();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_async_waiter_leaves_quietly() {
        let ticket: Arc<AsyncTicket<i32, Infallible>> = Arc::new(AsyncTicket::new());
        let waiter = {
            let ticket = Arc::clone(&ticket);
            tokio::spawn(async move { ticket.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ticket.waiters(), 0);
        ticket.resolve(Ok(1));
        assert_eq!(ticket.wait().await, Some(Ok(1)));
    }
}
