use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug)]
enum State<T> {
    Pending,
    Fulfilled(T),
    Closed,
}

/// Single-value cell shared between concurrent tasks.
///
/// The value is delivered at most once and then cached: every reader,
/// including one that subscribes after the fact, observes the same value.
/// Closing the cell without a value releases all readers with [`None`].
///
/// Sending twice, or sending after the cell has been closed, is a bug in the
/// calling code and panics.
#[derive(Debug)]
pub struct Oneshot<T> {
    tx: Arc<watch::Sender<State<T>>>,
}

impl<T> Oneshot<T> {
    pub fn new() -> Self {
        let (tx, ..) = watch::channel(State::Pending);

        Self { tx: Arc::new(tx) }
    }

    /// Delivers the value to all current and future readers.
    ///
    /// # Panics
    ///
    /// Panics if a value has already been sent or the cell is closed.
    pub fn send(&self, value: T) {
        if !self.try_send(value) {
            panic!("oneshot value sent to a settled cell");
        }
    }

    /// Delivers the value unless the cell has already settled.
    ///
    /// Returns whether the value was delivered.
    pub fn try_send(&self, value: T) -> bool {
        self.tx.send_if_modified(move |state| {
            if let State::Pending = state {
                *state = State::Fulfilled(value);
                true
            } else {
                false
            }
        })
    }

    /// Releases all readers without a value.
    ///
    /// Does nothing if the cell is already settled.
    pub fn close(&self) {
        self.tx.send_if_modified(|state| {
            if let State::Pending = state {
                *state = State::Closed;
                true
            } else {
                false
            }
        });
    }

    /// Returns a guard that closes this cell when dropped.
    ///
    /// Tasks that are supposed to fulfill the cell hold it, so that readers
    /// are never left waiting when the task bails out early.
    pub fn close_on_drop(&self) -> CloseGuard<T> {
        CloseGuard { cell: self.clone() }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.tx.borrow(), State::Pending)
    }
}

impl<T: Clone> Oneshot<T> {
    /// Waits until the cell settles.
    ///
    /// Returns the delivered value, or [`None`] if the cell was closed
    /// without one.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so waiting can not observe a dropped
        // channel.
        let state = rx.wait_for(|state| !matches!(state, State::Pending)).await.ok()?;

        match &*state {
            State::Fulfilled(v) => Some(v.clone()),
            State::Pending | State::Closed => None,
        }
    }

    /// Returns the value if it has already been delivered.
    pub fn get(&self) -> Option<T> {
        match &*self.tx.borrow() {
            State::Fulfilled(v) => Some(v.clone()),
            State::Pending | State::Closed => None,
        }
    }
}

impl<T> Default for Oneshot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Oneshot<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

/// Closes the owning [`Oneshot`] on drop.
#[derive(Debug)]
pub struct CloseGuard<T> {
    cell: Oneshot<T>,
}

impl<T> Drop for CloseGuard<T> {
    fn drop(&mut self) {
        self.cell.close();
    }
}
