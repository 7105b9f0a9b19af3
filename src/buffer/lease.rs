//! Outstanding-item accounting for leased rows.
//!
//! Every row handed out by [`RingBufferFile::lease`](super::RingBufferFile::lease)
//! carries a [`LeaseTicket`]. The ticket is released exactly once, when it is
//! dropped, whether the row was delivered or discarded. Shutdown waits on
//! [`Outstanding::wait_idle`] to know no leased row is still in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::Row;

/// Count of leased rows that have not yet been delivered or discarded.
#[derive(Debug, Default)]
pub struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of tickets currently alive.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Issue a ticket, incrementing the count until it is dropped.
    pub fn acquire(self: &Arc<Self>) -> LeaseTicket {
        self.count.fetch_add(1, Ordering::AcqRel);
        LeaseTicket {
            owner: Arc::clone(self),
        }
    }

    /// Resolve once the count reaches zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not missed.
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Single-fire completion signal for one leased row.
#[derive(Debug)]
pub struct LeaseTicket {
    owner: Arc<Outstanding>,
}

impl LeaseTicket {
    /// Mark the row as delivered or discarded.
    pub fn complete(self) {}
}

impl Drop for LeaseTicket {
    fn drop(&mut self) {
        self.owner.release();
    }
}

/// A row read out of the spool file, paired with its ticket.
#[derive(Debug)]
pub struct Leased {
    row: Row,
    ticket: LeaseTicket,
}

impl Leased {
    pub(crate) fn new(row: Row, ticket: LeaseTicket) -> Self {
        Self { row, ticket }
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    /// Split into the row and its ticket. Keep the ticket alive until the
    /// row has been handed off.
    pub fn into_parts(self) -> (Row, LeaseTicket) {
        (self.row, self.ticket)
    }
}
