//! In-flight transactions and the table that keeps track of them.
//!
//! Every query creates a [`Transaction`] and registers it under the ID of
//! its request in the connection's [`Transactions`] table. The reader task
//! looks up the table by the ID of every response it receives and resolves
//! the matching transaction. The query itself waits for the resolution on
//! the receiving end of a oneshot channel, which guarantees that a
//! transaction is resolved at most once.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::vec::Vec;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Error;
use crate::message::Message;

/// The result a transaction is resolved with.
pub(crate) type Reply = Result<Message, Error>;

//------------ Transaction ----------------------------------------------------

/// A single query in flight.
#[derive(Debug)]
pub(crate) struct Transaction {
    /// The ID of the request and expected response.
    id: u16,

    /// The mutable part of the transaction.
    state: Mutex<State>,
}

/// The mutable part of a transaction.
#[derive(Debug)]
struct State {
    /// Sender for the reply, taken when the transaction is resolved.
    reply: Option<oneshot::Sender<Reply>>,

    /// Time from sending the request to receiving the response.
    timer: Timer,
}

/// The elapsed time timer of a transaction.
#[derive(Clone, Copy, Debug)]
enum Timer {
    /// The request has not been sent yet.
    Idle,

    /// The request was sent at the given instant.
    Running(Instant),

    /// The transaction has finished after the given time.
    Stopped(Duration),
}

impl Transaction {
    /// Creates a new transaction for the given ID.
    ///
    /// Returns the transaction and the receiver its reply will arrive on.
    pub fn new(id: u16) -> (Arc<Self>, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let txn = Transaction {
            id,
            state: Mutex::new(State {
                reply: Some(tx),
                timer: Timer::Idle,
            }),
        };
        (Arc::new(txn), rx)
    }

    /// Returns the ID of the transaction.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Starts the elapsed time timer.
    pub fn start_timer(&self) {
        let mut state = self.state.lock();
        if let Timer::Idle = state.timer {
            state.timer = Timer::Running(Instant::now());
        }
    }

    /// Stops the timer and returns the elapsed time.
    ///
    /// If the timer was never started, the elapsed time is zero.
    pub fn stop_timer(&self) -> Duration {
        Self::stop(&mut self.state.lock())
    }

    /// Returns the elapsed time if the timer has been started.
    #[cfg(test)]
    pub fn elapsed(&self) -> Option<Duration> {
        match self.state.lock().timer {
            Timer::Idle => None,
            Timer::Running(start) => Some(start.elapsed()),
            Timer::Stopped(elapsed) => Some(elapsed),
        }
    }

    /// Resolves the transaction with the given reply.
    ///
    /// Returns whether this was the first resolution. Later resolutions
    /// are dropped.
    pub fn resolve(&self, reply: Reply) -> bool {
        let mut state = self.state.lock();
        Self::stop(&mut state);
        match state.reply.take() {
            Some(tx) => {
                // The waiting side may have given up already.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Returns whether the transaction is still waiting for its reply.
    pub fn is_pending(&self) -> bool {
        self.state.lock().reply.is_some()
    }

    /// Cancels the transaction if it is still pending.
    ///
    /// Returns whether the transaction was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        Self::stop(&mut state);
        state.reply.take().is_some()
    }

    /// Stops the timer of a locked state.
    fn stop(state: &mut State) -> Duration {
        let elapsed = match state.timer {
            Timer::Idle => Duration::ZERO,
            Timer::Running(start) => start.elapsed(),
            Timer::Stopped(elapsed) => elapsed,
        };
        state.timer = Timer::Stopped(elapsed);
        elapsed
    }
}

//------------ Transactions ---------------------------------------------------

/// Mapping outstanding transactions to their ID.
#[derive(Debug, Default)]
pub(crate) struct Transactions {
    /// The pending transactions.
    map: Mutex<HashMap<u16, Arc<Transaction>>>,
}

impl Transactions {
    /// Creates a new, empty table.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the number of pending transactions.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Inserts a transaction unless its ID is already in use.
    ///
    /// Returns whether the transaction was inserted. An existing entry is
    /// never replaced.
    pub fn insert(&self, txn: Arc<Transaction>) -> bool {
        let mut map = self.map.lock();
        if map.contains_key(&txn.id()) {
            return false;
        }
        map.insert(txn.id(), txn);
        true
    }

    /// Removes and returns the transaction with the given ID.
    pub fn remove(&self, id: u16) -> Option<Arc<Transaction>> {
        self.map.lock().remove(&id)
    }

    /// Removes the given transaction if it is still in the table.
    ///
    /// An entry under the same ID that belongs to a different transaction
    /// is left alone.
    pub fn remove_entry(&self, txn: &Arc<Transaction>) -> bool {
        let mut map = self.map.lock();
        match map.get(&txn.id()) {
            Some(found) if Arc::ptr_eq(found, txn) => {
                map.remove(&txn.id());
                true
            }
            _ => false,
        }
    }

    /// Removes all transactions and returns them.
    pub fn drain(&self) -> Vec<Arc<Transaction>> {
        self.map.lock().drain().map(|(_, txn)| txn).collect()
    }

    /// Creates and inserts a transaction for a request.
    ///
    /// If the ID of the request is already in use, the request gets a new
    /// random ID until an unused one is found.
    pub fn register(
        &self,
        request: &mut Message,
    ) -> Result<(Arc<Transaction>, oneshot::Receiver<Reply>), Error> {
        loop {
            let (txn, rx) = Transaction::new(request.id());
            if self.insert(txn.clone()) {
                return Ok((txn, rx));
            }
            if self.len() > usize::from(u16::MAX) {
                return Err(Error::StreamTooManyOutstandingQueries);
            }
            trace!("ID {} already in use, picking a new one", request.id());
            request.set_random_id();
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::HEADER_LEN;

    fn request(id: u16) -> Message {
        let mut msg = Message::from_slice(&[0; HEADER_LEN]).unwrap();
        msg.set_id(id);
        msg
    }

    #[test]
    fn insert_does_not_overwrite() {
        let table = Transactions::new();
        let (first, _rx1) = Transaction::new(42);
        let (second, _rx2) = Transaction::new(42);
        assert!(table.insert(first.clone()));
        assert!(!table.insert(second));
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&table.remove(42).unwrap(), &first));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn register_picks_fresh_id_on_collision() {
        let table = Transactions::new();
        let mut req = request(7);
        let (first, _rx1) = table.register(&mut req).unwrap();
        assert_eq!(first.id(), 7);
        assert_eq!(req.id(), 7);

        let mut req = request(7);
        let (second, _rx2) = table.register(&mut req).unwrap();
        assert_ne!(second.id(), 7);
        assert_eq!(second.id(), req.id());
        assert_eq!(table.len(), 2);
        assert!(Arc::ptr_eq(&table.remove(second.id()).unwrap(), &second));
    }

    #[test]
    fn register_finds_last_free_id() {
        let table = Transactions::new();
        let mut receivers = Vec::new();
        for id in 0..u16::MAX {
            let (txn, rx) = Transaction::new(id);
            assert!(table.insert(txn));
            receivers.push(rx);
        }
        let mut req = request(0);
        let (txn, _rx) = table.register(&mut req).unwrap();
        assert_eq!(txn.id(), u16::MAX);

        let mut req = request(0);
        assert!(matches!(
            table.register(&mut req),
            Err(Error::StreamTooManyOutstandingQueries)
        ));
    }

    #[test]
    fn remove_entry_leaves_other_transaction() {
        let table = Transactions::new();
        let (old, _rx1) = Transaction::new(9);
        assert!(table.insert(old.clone()));
        assert_eq!(table.drain().len(), 1);

        let (new, _rx2) = Transaction::new(9);
        assert!(table.insert(new.clone()));
        assert!(!table.remove_entry(&old));
        assert!(table.remove_entry(&new));
        assert_eq!(table.len(), 0);
        assert!(table.remove(9).is_none());
    }

    #[tokio::test]
    async fn resolve_exactly_once() {
        let (txn, rx) = Transaction::new(1);
        assert!(txn.resolve(Ok(request(1))));
        assert!(!txn.resolve(Err(Error::ConnectionClosed)));
        assert!(!txn.cancel());
        assert_eq!(rx.await.unwrap().unwrap().id(), 1);
    }

    #[tokio::test]
    async fn cancel_drops_reply() {
        let (txn, rx) = Transaction::new(1);
        assert!(txn.is_pending());
        assert!(txn.cancel());
        assert!(!txn.is_pending());
        assert!(!txn.resolve(Ok(request(1))));
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timer() {
        let (txn, _rx) = Transaction::new(1);
        assert!(txn.elapsed().is_none());
        txn.start_timer();
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(txn.stop_timer(), Duration::from_millis(30));
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(txn.elapsed(), Some(Duration::from_millis(30)));

        let (txn, _rx) = Transaction::new(2);
        assert!(txn.cancel());
        assert_eq!(txn.elapsed(), Some(Duration::ZERO));
    }
}
