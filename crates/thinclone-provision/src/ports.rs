//! Host port bookkeeping for sessions.
//!
//! The pool is a fixed bitmap over `[from, to]`. A port marked free is still
//! probed on the host before it is handed out, since a process outside this
//! bookkeeping may hold it.

use std::fmt::Debug;
use std::net::TcpListener;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thinclone_common::{ThincloneError, ThincloneResult};

use crate::config::PortPoolConfig;

/// Candidates probed by one allocation before giving up.
pub const MAX_PROBED_PORTS: usize = 16;

/// Checks whether a host port can be bound.
pub trait PortProber: Debug + Send + Sync {
    /// Whether `port` is free on the host.
    fn is_available(&self, port: u16) -> bool;
}

/// Probe by binding a TCP listener on all interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl PortProber for TcpProber {
    fn is_available(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRevision {
    /// Ports found busy that were marked free.
    pub bound: usize,
    /// Ports found free that were marked bound.
    pub freed: usize,
}

#[derive(Debug)]
struct PortState {
    bound: Vec<bool>,
    next: usize,
}

/// Fixed-size pool of host ports.
#[derive(Debug)]
pub struct PortPool {
    from: u16,
    to: u16,
    state: Mutex<PortState>,
    prober: Arc<dyn PortProber>,
}

impl PortPool {
    /// Create a pool over `range` probing with `prober`.
    #[must_use]
    pub fn new(range: PortPoolConfig, prober: Arc<dyn PortProber>) -> Self {
        Self {
            from: range.from,
            to: range.to,
            state: Mutex::new(PortState {
                bound: vec![false; range.size()],
                next: 0,
            }),
            prober,
        }
    }

    /// First and last port of the pool.
    #[must_use]
    pub const fn range(&self) -> (u16, u16) {
        (self.from, self.to)
    }

    /// Reserve a free port.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::NoRoom`] when none of the probed candidates
    /// is available.
    pub fn allocate(&self) -> ThincloneResult<u16> {
        let mut state = self.state.lock();
        let size = state.bound.len();
        let mut probed = 0;

        for step in 0..size {
            let index = (state.next + step) % size;
            if state.bound[index] {
                continue;
            }
            if probed == MAX_PROBED_PORTS {
                break;
            }
            probed += 1;

            let port = self.port_at(index);
            if self.prober.is_available(port) {
                state.bound[index] = true;
                state.next = (index + 1) % size;
                tracing::debug!(port, "Port allocated");
                return Ok(port);
            }
            tracing::debug!(port, "Port is busy on the host, skipping");
        }

        Err(ThincloneError::NoRoom {
            resource: "port pool".to_string(),
        })
    }

    /// Release a port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `port` is outside the pool.
    pub fn free(&self, port: u16) -> ThincloneResult<()> {
        let index = self.index_of(port)?;
        self.state.lock().bound[index] = false;
        tracing::debug!(port, "Port freed");
        Ok(())
    }

    /// Mark a port as bound without probing it.
    ///
    /// Used when an instance found on the host already owns the port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `port` is outside the pool.
    pub fn reserve(&self, port: u16) -> ThincloneResult<()> {
        let index = self.index_of(port)?;
        self.state.lock().bound[index] = true;
        Ok(())
    }

    /// Whether `port` is marked bound.
    #[must_use]
    pub fn is_bound(&self, port: u16) -> bool {
        self.index_of(port)
            .is_ok_and(|index| self.state.lock().bound[index])
    }

    /// Number of ports marked bound.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.state.lock().bound.iter().filter(|b| **b).count()
    }

    /// Re-probe every port and align the bitmap with the host.
    pub fn revise(&self) -> PortRevision {
        let mut state = self.state.lock();
        let mut revision = PortRevision::default();

        for index in 0..state.bound.len() {
            let port = self.port_at(index);
            let available = self.prober.is_available(port);
            match (state.bound[index], available) {
                (false, false) => {
                    state.bound[index] = true;
                    revision.bound += 1;
                    tracing::debug!(port, "Port taken outside the pool, marking bound");
                }
                (true, true) => {
                    state.bound[index] = false;
                    revision.freed += 1;
                    tracing::debug!(port, "Port released outside the pool, marking free");
                }
                _ => {}
            }
        }

        revision
    }

    #[allow(clippy::cast_possible_truncation)]
    fn port_at(&self, index: usize) -> u16 {
        self.from + index as u16
    }

    fn index_of(&self, port: u16) -> ThincloneResult<usize> {
        if port < self.from || port > self.to {
            return Err(ThincloneError::Config {
                message: format!(
                    "port {port} is outside the pool [{}, {}]",
                    self.from, self.to
                ),
            });
        }
        Ok(usize::from(port - self.from))
    }
}
