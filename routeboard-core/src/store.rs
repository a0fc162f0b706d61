//! Authoritative courier assignment state as an immutable, serializable snapshot.
//!
//! Every transition takes `&self` and returns a new [`RouteBoard`], leaving the old snapshot
//! untouched. Order numbers are only ever permuted: a container's renumbering draws from the
//! numbers its orders already hold, so no value is invented or discarded.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::mem;

use serde::{Deserialize, Serialize};

use crate::model::{AssignmentUpdate, ContainerKey, Courier, Order, OrderId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Validation failures of board transitions. A failed transition leaves the board unchanged.
pub enum StoreError {
    /// The order is not on the board.
    #[error("Unknown order {0}")]
    UnknownOrder(OrderId),
    /// The container does not exist.
    #[error("Unknown container {0}")]
    UnknownContainer(ContainerKey),
    /// A position lies outside the container.
    #[error("Index {index} out of range for {container} ({len} orders)")]
    IndexOutOfRange {
        /// Container addressed.
        container: ContainerKey,
        /// Requested position.
        index: usize,
        /// Number of orders in the container.
        len: usize,
    },
    /// No other loaded order holds the requested number.
    #[error("No other loaded order has number {0}")]
    NumberNotFound(u32),
    /// Several orders in other containers hold the requested number.
    #[error("Number {0} is used by several orders in other containers")]
    AmbiguousNumber(u32),
    /// The order already holds the requested number.
    #[error("Order {0} already has number {1}")]
    SameNumber(OrderId, u32),
    /// A cross-container swap would give a container the same number twice.
    #[error("Number {number} is already used in {container}")]
    NumberTaken {
        /// Number that would be duplicated.
        number: u32,
        /// Container already holding it.
        container: ContainerKey,
    },
    /// A replacement sequence is not a permutation of the container's orders.
    #[error("New order for {0} does not match its current orders")]
    NotAPermutation(ContainerKey),
    /// Board consistency check failed.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Ordered queue of orders for one courier or the unassigned bucket.
pub struct Container {
    /// Owner of the queue.
    pub key: ContainerKey,
    /// Orders in visiting order.
    pub order_ids: Vec<OrderId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Snapshot of all containers and order numbers.
pub struct RouteBoard {
    containers: Vec<Container>,
    numbers: BTreeMap<OrderId, u32>,
}

impl RouteBoard {
    /// Group orders by courier, each group ascending by order number.
    ///
    /// The unassigned bucket comes first, then every known courier (even without orders),
    /// then couriers only referenced by orders.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invariant`] when an order id appears twice.
    pub fn initialize(orders: &[Order], couriers: &[Courier]) -> Result<Self, StoreError> {
        let mut board = RouteBoard::default();
        board.ensure_container(&ContainerKey::Unassigned);
        for courier in couriers {
            board.ensure_container(&ContainerKey::Courier(courier.id.clone()));
        }

        let mut sorted: Vec<&Order> = orders.iter().collect();
        sorted.sort_by(|left, right| {
            left.order_number
                .cmp(&right.order_number)
                .then_with(|| left.id.cmp(&right.id))
        });

        for order in sorted {
            if board
                .numbers
                .insert(order.id.clone(), order.order_number)
                .is_some()
            {
                return Err(StoreError::Invariant(format!("duplicate order {}", order.id)));
            }
            let key = ContainerKey::from(order.courier_id.clone());
            let slot = board.ensure_container(&key);
            if let Some(container) = board.containers.get_mut(slot) {
                container.order_ids.push(order.id.clone());
            }
        }

        board.check_invariants()?;
        Ok(board)
    }

    /// All containers in display order.
    #[must_use]
    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    /// Look up a container by key.
    #[must_use]
    pub fn container(&self, key: &ContainerKey) -> Option<&Container> {
        self.containers.iter().find(|container| &container.key == key)
    }

    /// Current number of an order.
    #[must_use]
    pub fn number_of(&self, order_id: &OrderId) -> Option<u32> {
        self.numbers.get(order_id).copied()
    }

    /// Container currently holding an order.
    #[must_use]
    pub fn container_of(&self, order_id: &OrderId) -> Option<&ContainerKey> {
        self.containers
            .iter()
            .find(|container| container.order_ids.contains(order_id))
            .map(|container| &container.key)
    }

    /// Number of orders on the board.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.numbers.len()
    }

    /// Move an order to `target`, inserting it at `target_index` (clamped to the end),
    /// then renumber the source and target containers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownOrder`] or [`StoreError::UnknownContainer`].
    pub fn move_item(
        &self,
        order_id: &OrderId,
        target: &ContainerKey,
        target_index: usize,
    ) -> Result<Self, StoreError> {
        let source_slot = self
            .slot_of_order(order_id)
            .ok_or_else(|| StoreError::UnknownOrder(order_id.clone()))?;
        let target_slot = self
            .slot(target)
            .ok_or_else(|| StoreError::UnknownContainer(target.clone()))?;

        let mut next = self.clone();
        if let Some(source) = next.containers.get_mut(source_slot) {
            source.order_ids.retain(|id| id != order_id);
        }
        if let Some(destination) = next.containers.get_mut(target_slot) {
            let index = target_index.min(destination.order_ids.len());
            destination.order_ids.insert(index, order_id.clone());
        }

        next.renumber_slot(source_slot);
        if target_slot != source_slot {
            next.renumber_slot(target_slot);
        }
        next.check_invariants()?;
        Ok(next)
    }

    /// Move the order at `from` to position `to` inside one container, then renumber it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownContainer`] or [`StoreError::IndexOutOfRange`].
    pub fn reorder_within_container(
        &self,
        key: &ContainerKey,
        from: usize,
        to: usize,
    ) -> Result<Self, StoreError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| StoreError::UnknownContainer(key.clone()))?;
        let mut next = self.clone();
        let container = next
            .containers
            .get_mut(slot)
            .ok_or_else(|| StoreError::UnknownContainer(key.clone()))?;
        let len = container.order_ids.len();
        for index in [from, to] {
            if index >= len {
                return Err(StoreError::IndexOutOfRange {
                    container: key.clone(),
                    index,
                    len,
                });
            }
        }
        let moved = container.order_ids.remove(from);
        container.order_ids.insert(to, moved);

        next.renumber_slot(slot);
        next.check_invariants()?;
        Ok(next)
    }

    /// Reassign the container's own numbers, sorted ascending, to its current sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownContainer`].
    pub fn renumber(&self, key: &ContainerKey) -> Result<Self, StoreError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| StoreError::UnknownContainer(key.clone()))?;
        let mut next = self.clone();
        next.renumber_slot(slot);
        Ok(next)
    }

    /// Replace a container's sequence with a permutation of its orders, then renumber it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotAPermutation`] when `ordered_ids` adds, drops or repeats orders.
    pub fn replace_order(
        &self,
        key: &ContainerKey,
        ordered_ids: &[OrderId],
    ) -> Result<Self, StoreError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| StoreError::UnknownContainer(key.clone()))?;
        let current = self
            .containers
            .get(slot)
            .map(|container| container.order_ids.as_slice())
            .unwrap_or_default();

        let mut expected: Vec<&OrderId> = current.iter().collect();
        let mut proposed: Vec<&OrderId> = ordered_ids.iter().collect();
        expected.sort();
        proposed.sort();
        if expected != proposed {
            return Err(StoreError::NotAPermutation(key.clone()));
        }

        let mut next = self.clone();
        if let Some(container) = next.containers.get_mut(slot) {
            container.order_ids = ordered_ids.to_vec();
        }
        next.renumber_slot(slot);
        next.check_invariants()?;
        Ok(next)
    }

    /// Swap the order's number with the loaded order currently holding `requested`, then
    /// re-sort the affected containers by number.
    ///
    /// A holder in the same container wins; otherwise exactly one holder elsewhere must exist,
    /// and neither container may already use the number it receives.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NumberNotFound`], [`StoreError::AmbiguousNumber`],
    /// [`StoreError::NumberTaken`], [`StoreError::SameNumber`] or
    /// [`StoreError::UnknownOrder`]; the board is unchanged.
    pub fn swap_numbers(&self, order_id: &OrderId, requested: u32) -> Result<Self, StoreError> {
        let own = self
            .number_of(order_id)
            .ok_or_else(|| StoreError::UnknownOrder(order_id.clone()))?;
        if own == requested {
            return Err(StoreError::SameNumber(order_id.clone(), requested));
        }

        let holders: Vec<&OrderId> = self
            .numbers
            .iter()
            .filter(|(id, number)| **number == requested && *id != order_id)
            .map(|(id, _)| id)
            .collect();
        let own_container = self.container_of(order_id);
        let same_container = holders
            .iter()
            .find(|holder| self.container_of(holder) == own_container);

        let partner = match (same_container, holders.as_slice()) {
            (Some(holder), _) => (*holder).clone(),
            (None, [only]) => (*only).clone(),
            (None, []) => return Err(StoreError::NumberNotFound(requested)),
            (None, _) => return Err(StoreError::AmbiguousNumber(requested)),
        };

        let partner_container = self.container_of(&partner);
        if partner_container != own_container {
            // Numbers stay unique per container, so each side must be free to take the other's.
            for (container, number, except) in [
                (partner_container, own, &partner),
                (own_container, requested, order_id),
            ] {
                if let Some(container) = container
                    && self.holds_number(container, number, except)
                {
                    return Err(StoreError::NumberTaken {
                        number,
                        container: container.clone(),
                    });
                }
            }
        }

        let mut next = self.clone();
        next.numbers.insert(order_id.clone(), requested);
        next.numbers.insert(partner.clone(), own);
        // Numbers define the visiting order, so both containers follow their new numbers.
        for id in [order_id, &partner] {
            if let Some(slot) = next.slot_of_order(id) {
                next.sort_slot_by_number(slot);
            }
        }
        next.check_invariants()?;
        Ok(next)
    }

    /// Verify that every order sits in exactly one container and has a number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invariant`] describing the first violation.
    pub fn check_invariants(&self) -> Result<(), StoreError> {
        let mut seen: HashSet<&OrderId> = HashSet::with_capacity(self.numbers.len());
        for container in &self.containers {
            for id in &container.order_ids {
                if !seen.insert(id) {
                    return Err(StoreError::Invariant(format!(
                        "order {id} appears in more than one place"
                    )));
                }
                if !self.numbers.contains_key(id) {
                    return Err(StoreError::Invariant(format!("order {id} has no number")));
                }
            }
        }
        if seen.len() != self.numbers.len() {
            return Err(StoreError::Invariant(format!(
                "{} numbered orders but {} placed",
                self.numbers.len(),
                seen.len()
            )));
        }
        Ok(())
    }

    /// Save payload: one entry per order, courier `None` for the unassigned bucket.
    #[must_use]
    pub fn assignment_updates(&self) -> Vec<AssignmentUpdate> {
        self.containers
            .iter()
            .flat_map(|container| {
                container.order_ids.iter().filter_map(|id| {
                    Some(AssignmentUpdate {
                        order_id: id.clone(),
                        order_number: self.number_of(id)?,
                        courier_id: container.key.courier_id().cloned(),
                    })
                })
            })
            .collect()
    }

    fn slot(&self, key: &ContainerKey) -> Option<usize> {
        self.containers.iter().position(|container| &container.key == key)
    }

    fn holds_number(&self, key: &ContainerKey, number: u32, except: &OrderId) -> bool {
        self.container(key).is_some_and(|container| {
            container
                .order_ids
                .iter()
                .any(|id| id != except && self.number_of(id) == Some(number))
        })
    }

    fn slot_of_order(&self, order_id: &OrderId) -> Option<usize> {
        self.containers
            .iter()
            .position(|container| container.order_ids.contains(order_id))
    }

    fn ensure_container(&mut self, key: &ContainerKey) -> usize {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        self.containers.push(Container {
            key: key.clone(),
            order_ids: Vec::new(),
        });
        self.containers.len() - 1
    }

    fn sort_slot_by_number(&mut self, slot: usize) {
        let numbers = &self.numbers;
        if let Some(container) = self.containers.get_mut(slot) {
            container
                .order_ids
                .sort_by_key(|id| numbers.get(id).copied().unwrap_or(u32::MAX));
        }
    }

    fn renumber_slot(&mut self, slot: usize) {
        let Some(container) = self.containers.get(slot) else {
            return;
        };
        let mut pool: Vec<u32> = container
            .order_ids
            .iter()
            .filter_map(|id| self.numbers.get(id).copied())
            .collect();
        pool.sort_unstable();
        let assignments: Vec<(OrderId, u32)> = container.order_ids.iter().cloned().zip(pool).collect();
        self.numbers.extend(assignments);
    }
}

/// Bounded undo/redo history over board snapshots.
#[derive(Debug, Clone)]
pub struct History {
    current: RouteBoard,
    past: VecDeque<RouteBoard>,
    future: Vec<RouteBoard>,
    limit: usize,
}

impl History {
    /// Start a history at `initial`, keeping at most `limit` undo steps.
    #[must_use]
    pub fn new(initial: RouteBoard, limit: usize) -> Self {
        Self {
            current: initial,
            past: VecDeque::new(),
            future: Vec::new(),
            limit,
        }
    }

    /// Snapshot currently in effect.
    #[must_use]
    pub fn current(&self) -> &RouteBoard {
        &self.current
    }

    /// Make `next` current, remembering the previous snapshot and clearing redo.
    pub fn commit(&mut self, next: RouteBoard) {
        let previous = mem::replace(&mut self.current, next);
        self.past.push_back(previous);
        while self.past.len() > self.limit {
            self.past.pop_front();
        }
        self.future.clear();
    }

    /// Step back one snapshot. Returns false when there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        let Some(previous) = self.past.pop_back() else {
            return false;
        };
        let undone = mem::replace(&mut self.current, previous);
        self.future.push(undone);
        true
    }

    /// Re-apply the last undone snapshot. Returns false when there is nothing to redo.
    pub fn redo(&mut self) -> bool {
        let Some(next) = self.future.pop() else {
            return false;
        };
        let replaced = mem::replace(&mut self.current, next);
        self.past.push_back(replaced);
        true
    }
}
