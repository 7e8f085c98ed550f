//! Applying [`PoolCfg`] to a sqlx pool builder.

use sqlx::Database;
use sqlx::pool::PoolOptions;

use crate::config::PoolCfg;

/// Apply configured pool limits to a pool builder.
pub trait ApplyPoolOpts {
    #[must_use]
    fn apply(self, cfg: &PoolCfg) -> Self;
}

impl<DB: Database> ApplyPoolOpts for PoolOptions<DB> {
    fn apply(mut self, cfg: &PoolCfg) -> Self {
        if let Some(n) = cfg.max_conns {
            self = self.max_connections(n);
        }
        if let Some(n) = cfg.min_conns {
            self = self.min_connections(n);
        }
        if let Some(t) = cfg.acquire_timeout {
            self = self.acquire_timeout(t);
        }
        if let Some(t) = cfg.idle_timeout {
            self = self.idle_timeout(t);
        }
        if let Some(t) = cfg.max_lifetime {
            self = self.max_lifetime(t);
        }
        self
    }
}
