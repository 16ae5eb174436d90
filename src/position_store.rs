// =============================================================================
// Position Store — authoritative ticket/group state, reconciled against the
// broker
// =============================================================================
//
// `reconcile()` is the only source of truth for whether a Position exists:
// nothing in this crate invents or destroys a Position outside of a
// reconcile pass pulling the broker's own position list. Groups are a local
// concept the store layers on top (a scaling plan's set of tickets); a
// ticket the broker stops reporting is removed from its group the same way
// it is removed from the ticket map.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::BrokerGateway;
use crate::error::GatewayError;
use crate::event_bus::{Event, EventBus};
use crate::types::{Group, Position, Side};

/// Configurable caps enforced by `can_open`.
#[derive(Debug, Clone, Copy)]
pub struct PositionLimits {
    pub max_total: usize,
    pub max_per_symbol: usize,
    pub max_per_group: usize,
}

struct Inner {
    positions: HashMap<u64, Position>,
    groups: HashMap<Uuid, Group>,
}

pub struct PositionStore {
    gateway: Arc<BrokerGateway>,
    events: EventBus,
    limits: PositionLimits,
    inner: RwLock<Inner>,
}

impl PositionStore {
    pub fn new(gateway: Arc<BrokerGateway>, events: EventBus, limits: PositionLimits) -> Self {
        Self {
            gateway,
            events,
            limits,
            inner: RwLock::new(Inner {
                positions: HashMap::new(),
                groups: HashMap::new(),
            }),
        }
    }

    /// Pull the broker's current position list and diff it against what is
    /// locally known. Takes the write lock for the whole diff so a
    /// concurrent reader never observes a half-applied reconcile.
    pub async fn reconcile(&self) -> Result<(), GatewayError> {
        let broker_positions = self.gateway.get_positions(None).await?;
        let broker_tickets: std::collections::HashSet<u64> =
            broker_positions.iter().map(|p| p.ticket).collect();

        let mut inner = self.inner.write();

        for mut broker_pos in broker_positions {
            match inner.positions.get(&broker_pos.ticket) {
                None => {
                    info!(ticket = broker_pos.ticket, symbol = %broker_pos.symbol, "position opened");
                    self.events.publish(Event::PositionOpened {
                        ticket: broker_pos.ticket,
                        symbol: broker_pos.symbol.clone(),
                    });
                    inner.positions.insert(broker_pos.ticket, broker_pos);
                }
                Some(existing) => {
                    let sl_tp_changed =
                        existing.stop_loss != broker_pos.stop_loss || existing.take_profit != broker_pos.take_profit;
                    broker_pos.group_id = existing.group_id;
                    if sl_tp_changed {
                        self.events.publish(Event::PositionModified {
                            ticket: broker_pos.ticket,
                        });
                    }
                    inner.positions.insert(broker_pos.ticket, broker_pos);
                }
            }
        }

        let vanished: Vec<u64> = inner
            .positions
            .keys()
            .filter(|t| !broker_tickets.contains(t))
            .copied()
            .collect();

        for ticket in vanished {
            if let Some(pos) = inner.positions.remove(&ticket) {
                info!(ticket, profit = pos.profit, "position closed (no longer reported by broker)");
                if let Some(group_id) = pos.group_id {
                    let mut empty = false;
                    if let Some(group) = inner.groups.get_mut(&group_id) {
                        group.tickets.remove(&ticket);
                        empty = group.tickets.is_empty();
                    }
                    if empty {
                        inner.groups.remove(&group_id);
                    }
                }
                self.events.publish(Event::PositionClosed {
                    ticket,
                    profit: pos.profit,
                });
            }
        }

        Ok(())
    }

    /// Create an empty, unattached scaling group.
    pub fn create_group(&self, symbol: impl Into<String>, side: Side, anchor_price: f64) -> Uuid {
        let group = Group::new(symbol, side, anchor_price);
        let id = group.id;
        self.inner.write().groups.insert(id, group);
        id
    }

    /// Attach `ticket` to `group_id`. Returns `false` if the ticket is
    /// unknown or already attached to a (possibly different) group.
    pub fn attach(&self, ticket: u64, group_id: Uuid) -> bool {
        let mut inner = self.inner.write();
        if !inner.groups.contains_key(&group_id) {
            return false;
        }
        let attached = match inner.positions.get(&ticket) {
            Some(pos) if pos.group_id.is_none() => true,
            _ => false,
        };
        if !attached {
            return false;
        }
        inner.positions.get_mut(&ticket).unwrap().group_id = Some(group_id);
        inner.groups.get_mut(&group_id).unwrap().tickets.insert(ticket);
        self.events.publish(Event::PositionGrouped { ticket, group_id });
        true
    }

    /// Detach `ticket` from whatever group it belongs to. Idempotent: a
    /// ticket with no group (or that doesn't exist) is a no-op.
    pub fn detach(&self, ticket: u64) {
        let mut inner = self.inner.write();
        let group_id = match inner.positions.get_mut(&ticket) {
            Some(pos) => pos.group_id.take(),
            None => None,
        };
        if let Some(group_id) = group_id {
            if let Some(group) = inner.groups.get_mut(&group_id) {
                group.tickets.remove(&ticket);
            }
        }
    }

    /// Whether a new position may be opened for `symbol`, optionally scoped
    /// to an existing `group_id`. Checks total/per-symbol/per-group caps in
    /// that order and returns the first one tripped.
    pub fn can_open(&self, symbol: &str, group_id: Option<Uuid>) -> (bool, Option<&'static str>) {
        let inner = self.inner.read();

        if inner.positions.len() >= self.limits.max_total {
            return (false, Some("max_total exceeded"));
        }

        let per_symbol = inner.positions.values().filter(|p| p.symbol == symbol).count();
        if per_symbol >= self.limits.max_per_symbol {
            return (false, Some("max_per_symbol exceeded"));
        }

        if let Some(group_id) = group_id {
            if let Some(group) = inner.groups.get(&group_id) {
                if group.tickets.len() >= self.limits.max_per_group {
                    return (false, Some("max_per_group exceeded"));
                }
            }
        }

        (true, None)
    }

    /// Consistent snapshot of every tracked position.
    pub fn positions(&self) -> Vec<Position> {
        self.inner.read().positions.values().cloned().collect()
    }

    pub fn positions_for_symbol(&self, symbol: &str) -> Vec<Position> {
        self.inner
            .read()
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn group(&self, group_id: Uuid) -> Option<Group> {
        self.inner.read().groups.get(&group_id).cloned()
    }

    pub fn groups_for_symbol(&self, symbol: &str) -> Vec<Group> {
        self.inner
            .read()
            .groups
            .values()
            .filter(|g| g.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Total profit across every tracked position, read under a single lock
    /// acquisition so the figure reflects one consistent instant.
    pub fn total_profit(&self) -> f64 {
        self.inner.read().positions.values().map(|p| p.profit).sum()
    }

    pub fn profit_for_symbol(&self, symbol: &str) -> f64 {
        self.inner
            .read()
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.profit)
            .sum()
    }

    pub fn profit_for_group(&self, group_id: Uuid) -> f64 {
        let inner = self.inner.read();
        let Some(group) = inner.groups.get(&group_id) else {
            return 0.0;
        };
        group
            .tickets
            .iter()
            .filter_map(|t| inner.positions.get(t))
            .map(|p| p.profit)
            .sum()
    }

    /// Directly mark a group completed. Used by the scaling strategy once
    /// its completion precondition is met.
    pub fn complete_group(&self, group_id: Uuid) {
        if let Some(group) = self.inner.write().groups.get_mut(&group_id) {
            group.completed = true;
        } else {
            warn!(%group_id, "complete_group called for unknown group");
        }
    }

    pub fn advance_group_level(&self, group_id: Uuid) {
        if let Some(group) = self.inner.write().groups.get_mut(&group_id) {
            group.level += 1;
        }
    }
}
