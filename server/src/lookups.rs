//! Lookup tables (queues, states, priorities, types, system addresses),
//! loaded once and cached as an immutable snapshot.
//!
//! The snapshot is immutable for the lifetime of a ticket save; admin
//! mutations call [`LookupCache::invalidate`] and the next reader reloads.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::db::{self, DbPool};
use crate::error::{Error, Result};
use crate::models::{
    Queue, Service, Sla, StateType, SystemAddress, TicketPriority, TicketState, TicketType,
};

/// Immutable view of all lookup tables.
pub struct LookupSnapshot {
    queues: HashMap<i64, Queue>,
    states: HashMap<i64, TicketState>,
    priorities: Vec<TicketPriority>,
    ticket_types: HashMap<i64, TicketType>,
    services: HashMap<i64, Service>,
    slas: HashMap<i64, Sla>,
    system_addresses: HashMap<i64, SystemAddress>,
}

impl LookupSnapshot {
    pub fn from_parts(
        queues: Vec<Queue>,
        states: Vec<TicketState>,
        mut priorities: Vec<TicketPriority>,
        ticket_types: Vec<TicketType>,
        services: Vec<Service>,
        slas: Vec<Sla>,
        system_addresses: Vec<SystemAddress>,
    ) -> Self {
        priorities.sort_by_key(|p| p.id);
        Self {
            queues: queues.into_iter().map(|q| (q.id, q)).collect(),
            states: states.into_iter().map(|s| (s.id, s)).collect(),
            priorities,
            ticket_types: ticket_types.into_iter().map(|t| (t.id, t)).collect(),
            services: services.into_iter().map(|s| (s.id, s)).collect(),
            slas: slas.into_iter().map(|s| (s.id, s)).collect(),
            system_addresses: system_addresses.into_iter().map(|a| (a.id, a)).collect(),
        }
    }

    pub fn queue(&self, id: i64) -> Option<&Queue> {
        self.queues.get(&id)
    }

    /// A valid, addressable queue; deactivated queues are rejected for new
    /// routing but their existing tickets stay readable.
    pub fn valid_queue(&self, id: i64) -> Result<&Queue> {
        let queue = self.queues.get(&id).ok_or(Error::not_found("queue"))?;
        if !queue.is_valid() {
            return Err(Error::precondition("queue is deactivated"));
        }
        Ok(queue)
    }

    pub fn state(&self, id: i64) -> Option<&TicketState> {
        self.states.get(&id)
    }

    /// The state's type; a state row with an unknown type name is a
    /// configuration error surfaced as Internal.
    pub fn state_type_of(&self, state_id: i64) -> Result<StateType> {
        let state = self.states.get(&state_id).ok_or(Error::not_found("ticket state"))?;
        state
            .state_type()
            .ok_or_else(|| Error::internal("state row has unknown state type"))
    }

    fn valid_states_of_type(&self, ty: StateType) -> Vec<&TicketState> {
        let mut states: Vec<&TicketState> = self
            .states
            .values()
            .filter(|s| s.valid_id == 1 && s.state_type() == Some(ty))
            .collect();
        states.sort_by_key(|s| s.id);
        states
    }

    /// Initial state for tickets created in `queue`: the queue's configured
    /// default when set, otherwise the system-wide new state.
    pub fn initial_state_for_queue(&self, queue: &Queue) -> Result<&TicketState> {
        if let Some(state_id) = queue.default_state_id {
            return self
                .states
                .get(&state_id)
                .ok_or_else(|| Error::internal("queue default state does not exist"));
        }
        self.valid_states_of_type(StateType::New)
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("no valid state of type new is configured"))
    }

    /// Default reopen target: the first valid open state.
    pub fn default_open_state(&self) -> Result<&TicketState> {
        self.valid_states_of_type(StateType::Open)
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("no valid state of type open is configured"))
    }

    /// The merged state sources transition into.
    pub fn merged_state(&self) -> Result<&TicketState> {
        self.valid_states_of_type(StateType::Merged)
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("no valid state of type merged is configured"))
    }

    /// Auto-close target for an elapsed pending-auto-close state. Prefers
    /// the conventional state name for the +/- variant, falling back to the
    /// first valid closed state.
    pub fn auto_close_target(&self, pending_type: StateType) -> Result<&TicketState> {
        let preferred = match pending_type {
            StateType::PendingAutoClosePlus => "closed successful",
            StateType::PendingAutoCloseMinus => "closed unsuccessful",
            _ => return Err(Error::internal("auto-close target requested for non-auto state")),
        };
        let closed = self.valid_states_of_type(StateType::Closed);
        closed
            .iter()
            .find(|s| s.name == preferred)
            .or_else(|| closed.first())
            .copied()
            .ok_or_else(|| Error::internal("no valid state of type closed is configured"))
    }

    pub fn priority(&self, id: i64) -> Option<&TicketPriority> {
        self.priorities.iter().find(|p| p.id == id)
    }

    /// Default priority: the median of the valid priorities ordered by id.
    /// Avoids depending on priority display names.
    pub fn default_priority(&self) -> Result<&TicketPriority> {
        let valid: Vec<&TicketPriority> =
            self.priorities.iter().filter(|p| p.valid_id == 1).collect();
        if valid.is_empty() {
            return Err(Error::internal("no valid ticket priority is configured"));
        }
        Ok(valid[valid.len() / 2])
    }

    pub fn ticket_type(&self, id: i64) -> Option<&TicketType> {
        self.ticket_types.get(&id)
    }

    pub fn service(&self, id: i64) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn sla(&self, id: i64) -> Option<&Sla> {
        self.slas.get(&id)
    }

    /// Reply-from identity for a queue: its system address when configured
    /// and valid, otherwise the lowest-id valid system address.
    pub fn sender_address_for_queue(&self, queue: &Queue) -> Result<&SystemAddress> {
        if let Some(addr_id) = queue.system_address_id {
            if let Some(addr) = self.system_addresses.get(&addr_id) {
                if addr.valid_id == 1 {
                    return Ok(addr);
                }
            }
        }
        let mut valid: Vec<&SystemAddress> = self
            .system_addresses
            .values()
            .filter(|a| a.valid_id == 1)
            .collect();
        valid.sort_by_key(|a| a.id);
        valid
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("no valid system address is configured"))
    }
}

/// Process-wide lookup cache with explicit invalidation.
pub struct LookupCache {
    pool: DbPool,
    snapshot: RwLock<Option<Arc<LookupSnapshot>>>,
}

impl LookupCache {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            snapshot: RwLock::new(None),
        }
    }

    /// Current snapshot, loading lazily on first use or after invalidation.
    pub async fn snapshot(&self) -> Result<Arc<LookupSnapshot>> {
        if let Some(snap) = self.snapshot.read().await.as_ref() {
            return Ok(Arc::clone(snap));
        }

        let mut guard = self.snapshot.write().await;
        // Another task may have loaded while we waited for the write lock.
        if let Some(snap) = guard.as_ref() {
            return Ok(Arc::clone(snap));
        }

        let snap = Arc::new(self.load().await?);
        *guard = Some(Arc::clone(&snap));
        info!("Lookup tables loaded");
        Ok(snap)
    }

    /// Drop the cached snapshot; the next reader reloads from the store.
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
        info!("Lookup cache invalidated");
    }

    async fn load(&self) -> Result<LookupSnapshot> {
        let queues = db::list_queues(&self.pool).await?;
        let states = db::list_states(&self.pool).await?;
        let priorities = db::list_priorities(&self.pool).await?;
        let ticket_types = db::list_ticket_types(&self.pool).await?;
        let services = db::list_services(&self.pool).await?;
        let slas = db::list_slas(&self.pool).await?;
        let system_addresses = db::list_system_addresses(&self.pool).await?;
        Ok(LookupSnapshot::from_parts(
            queues,
            states,
            priorities,
            ticket_types,
            services,
            slas,
            system_addresses,
        ))
    }
}
