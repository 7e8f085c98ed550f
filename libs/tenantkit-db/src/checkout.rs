use sqlx::Database;
use sqlx::pool::PoolConnection;

/// Exclusive hold on one pooled connection for the length of a unit of work.
///
/// The connection goes back to the pool only through [`Checkout::release`].
/// Dropping the guard any other way (early return, panic, the caller dropping
/// the unit-of-work future) closes the physical connection instead, because
/// its marker state is unknown at that point.
pub(crate) struct Checkout<DB: Database> {
    conn: PoolConnection<DB>,
    armed: bool,
}

impl<DB: Database> Checkout<DB> {
    pub(crate) fn new(conn: PoolConnection<DB>) -> Self {
        Self { conn, armed: true }
    }

    pub(crate) fn conn(&mut self) -> &mut DB::Connection {
        &mut self.conn
    }

    /// Return a connection known to carry no marker.
    pub(crate) fn release(mut self) {
        self.armed = false;
    }

    /// Close the physical connection instead of pooling it.
    pub(crate) fn discard(mut self, reason: &'static str) {
        tracing::warn!(target: "security", reason, "discarding pooled connection");
        self.conn.close_on_drop();
        self.armed = false;
    }
}

impl<DB: Database> Drop for Checkout<DB> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                target: "security",
                reason = "unit of work abandoned before cleanup",
                "discarding pooled connection"
            );
            self.conn.close_on_drop();
        }
    }
}
