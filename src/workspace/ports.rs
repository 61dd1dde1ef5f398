//! Port pair allocation for concurrent trials.
//!
//! Every trial gets a service port and a dev-server port. Pairs are carved
//! from a contiguous range as `(base + 2i, base + 2i + 1)`; a pair stays
//! reserved until the owning task id releases it.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PortError;

/// Default first port of the allocation range.
pub const DEFAULT_BASE_PORT: u16 = 4100;

/// Default number of pairs in the allocation range.
pub const DEFAULT_PORT_PAIRS: u16 = 64;

/// Ports reserved for one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    /// Port the backend service listens on.
    pub service: u16,
    /// Port the dev server (UI preview) listens on.
    pub dev: u16,
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.dev)
    }
}

/// Hands out disjoint port pairs keyed by task id.
///
/// Allocation is idempotent per task id: asking twice before a release
/// returns the same pair.
pub struct PortAllocator {
    base: u16,
    max_pairs: u16,
    check_bindable: bool,
    // slot index -> owning task id
    table: Mutex<HashMap<u16, String>>,
}

impl PortAllocator {
    /// Creates an allocator over `max_pairs` pairs starting at `base`.
    pub fn new(base: u16, max_pairs: u16) -> Result<Self, PortError> {
        let span = u32::from(max_pairs) * 2;
        if max_pairs == 0 || u32::from(base) + span > u32::from(u16::MAX) + 1 {
            return Err(PortError::InvalidRange {
                base,
                pairs: max_pairs,
            });
        }
        Ok(Self {
            base,
            max_pairs,
            check_bindable: true,
            table: Mutex::new(HashMap::new()),
        })
    }

    /// Enables or disables the bind probe performed before handing out a pair.
    pub fn with_bind_check(mut self, check_bindable: bool) -> Self {
        self.check_bindable = check_bindable;
        self
    }

    /// Reserves a pair for `task_id`, or returns the pair it already holds.
    pub fn allocate(&self, task_id: &str) -> Result<PortPair, PortError> {
        let mut table = self.lock();

        if let Some((&slot, _)) = table.iter().find(|(_, owner)| owner.as_str() == task_id) {
            return Ok(self.pair_for(slot));
        }

        for slot in 0..self.max_pairs {
            if table.contains_key(&slot) {
                continue;
            }
            let pair = self.pair_for(slot);
            if self.check_bindable && !(is_bindable(pair.service) && is_bindable(pair.dev)) {
                debug!(service = pair.service, dev = pair.dev, "Skipping busy port pair");
                continue;
            }
            table.insert(slot, task_id.to_string());
            debug!(task_id = %task_id, ports = %pair, "Allocated port pair");
            return Ok(pair);
        }

        Err(PortError::Exhausted {
            base: self.base,
            pairs: self.max_pairs,
        })
    }

    /// Frees the pair held by `task_id`. Unknown ids are ignored.
    pub fn release(&self, task_id: &str) {
        let mut table = self.lock();
        let before = table.len();
        table.retain(|_, owner| owner.as_str() != task_id);
        if table.len() != before {
            debug!(task_id = %task_id, "Released port pair");
        }
    }

    /// Returns the pair currently held by `task_id`.
    pub fn get(&self, task_id: &str) -> Option<PortPair> {
        let table = self.lock();
        table
            .iter()
            .find(|(_, owner)| owner.as_str() == task_id)
            .map(|(&slot, _)| self.pair_for(slot))
    }

    /// Returns every reserved pair with its owner, ordered by port.
    pub fn in_use(&self) -> Vec<(String, PortPair)> {
        let table = self.lock();
        let mut pairs: Vec<_> = table
            .iter()
            .map(|(&slot, owner)| (owner.clone(), self.pair_for(slot)))
            .collect();
        pairs.sort_by_key(|(_, pair)| pair.service);
        pairs
    }

    /// Total number of pairs this allocator manages.
    pub fn capacity(&self) -> u16 {
        self.max_pairs
    }

    fn pair_for(&self, slot: u16) -> PortPair {
        let service = self.base + slot * 2;
        PortPair {
            service,
            dev: service + 1,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, String>> {
        // A poisoned table is still structurally valid.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_PORT,
            max_pairs: DEFAULT_PORT_PAIRS,
            check_bindable: true,
            table: Mutex::new(HashMap::new()),
        }
    }
}

/// Returns true when `port` can currently be bound on the loopback interface.
pub fn is_bindable(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}
