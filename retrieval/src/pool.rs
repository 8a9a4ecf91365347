//! Bounded pool of record store connections.
//!
//! `acquire` never waits: at capacity it fails with
//! [`RagError::ResourceExhausted`]. A [`PoolHandle`] gives exclusive use of
//! one connection and returns it to the idle list when dropped.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RagError, Result};

type Factory<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

struct PoolState<C> {
    idle: Vec<C>,
    /// Checked-out handle ids and when they were acquired.
    active: HashMap<u64, Instant>,
    next_id: u64,
    total_acquired: u64,
    total_released: u64,
}

struct PoolInner<C> {
    factory: Factory<C>,
    max_connections: usize,
    state: Mutex<PoolState<C>>,
}

impl<C> PoolInner<C> {
    fn release(&self, id: u64, conn: Option<C>) {
        let mut state = self.state.lock();
        if state.active.remove(&id).is_some() {
            state.total_released += 1;
        }
        if let Some(conn) = conn {
            state.idle.push(conn);
        }
    }
}

/// Thread-safe, fixed-capacity connection pool.
pub struct ResourcePool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ResourcePool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + 'static> ResourcePool<C> {
    /// Create a pool that opens connections with `factory`, at most
    /// `max_connections` at a time.
    pub fn new<F>(max_connections: usize, factory: F) -> Result<Self>
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        if max_connections == 0 {
            return Err(RagError::Validation(
                "max_connections must be positive".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                factory: Box::new(factory),
                max_connections,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    active: HashMap::new(),
                    next_id: 1,
                    total_acquired: 0,
                    total_released: 0,
                }),
            }),
        })
    }

    /// Check out a connection.
    pub fn acquire(&self) -> Result<PoolHandle<C>> {
        let (id, reused) = {
            let mut state = self.inner.state.lock();
            if state.active.len() >= self.inner.max_connections {
                return Err(RagError::ResourceExhausted(format!(
                    "all {} store connections are in use",
                    self.inner.max_connections
                )));
            }

            let id = state.next_id;
            state.next_id += 1;
            state.total_acquired += 1;
            state.active.insert(id, Instant::now());
            (id, state.idle.pop())
        };

        // The slot is reserved, so the factory runs outside the lock.
        let conn = match reused {
            Some(conn) => conn,
            None => match (self.inner.factory)() {
                Ok(conn) => {
                    debug!("Opened store connection for handle {id}");
                    conn
                }
                Err(e) => {
                    self.inner.release(id, None);
                    return Err(e);
                }
            },
        };

        Ok(PoolHandle {
            id,
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return a connection. Equivalent to dropping the handle.
    pub fn release(&self, handle: PoolHandle<C>) {
        drop(handle);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let active = state.active.len();
        PoolStats {
            active,
            idle: state.idle.len(),
            max: self.inner.max_connections,
            utilization: active as f64 / self.inner.max_connections as f64,
            total_acquired: state.total_acquired,
            total_released: state.total_released,
        }
    }

    /// Count handles held longer than `max_idle`, logging each one.
    pub fn detect_stale(&self, max_idle: Duration) -> usize {
        let state = self.inner.state.lock();
        let mut stale = 0;
        for (id, acquired_at) in &state.active {
            let held = acquired_at.elapsed();
            if held > max_idle {
                warn!("Store connection handle {id} has been held for {held:?}");
                stale += 1;
            }
        }
        stale
    }
}

/// Exclusive use of one pooled connection.
pub struct PoolHandle<C> {
    id: u64,
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C> PoolHandle<C> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<C> Deref for PoolHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `Drop` takes the connection out.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pool handle used after release"),
        }
    }
}

impl<C> DerefMut for PoolHandle<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pool handle used after release"),
        }
    }
}

impl<C> Drop for PoolHandle<C> {
    fn drop(&mut self) {
        self.pool.release(self.id, self.conn.take());
    }
}

/// Pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Handles currently checked out.
    pub active: usize,
    /// Connections ready for reuse.
    pub idle: usize,
    pub max: usize,
    /// `active / max`.
    pub utilization: f64,
    pub total_acquired: u64,
    pub total_released: u64,
}
