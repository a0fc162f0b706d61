//! Translates board gestures into store transitions.

use crate::model::{ContainerKey, OrderId};
use crate::store::{RouteBoard, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A completed drag or keyboard gesture on the board.
pub enum DragGesture {
    /// Drop an order into a container at a position.
    Move {
        /// Order being dragged.
        order_id: OrderId,
        /// Container it was dropped on.
        target: ContainerKey,
        /// Drop position; past-the-end appends.
        index: usize,
    },
    /// Move an order within its container.
    Reorder {
        /// Container being reordered.
        container: ContainerKey,
        /// Current position.
        from: usize,
        /// New position.
        to: usize,
    },
    /// Give an order the number another loaded order holds.
    SwapNumber {
        /// Order being edited.
        order_id: OrderId,
        /// Number typed by the dispatcher.
        number: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Board after a gesture plus the containers whose sequence or numbers changed.
pub struct DragOutcome {
    /// New snapshot.
    pub board: RouteBoard,
    /// Containers whose stored route is now stale.
    pub touched: Vec<ContainerKey>,
}

/// Apply `gesture` to `board`, renumbering every affected container.
///
/// # Errors
///
/// Returns the [`StoreError`] of the rejected transition; `board` stays as it was.
pub fn apply_gesture(board: &RouteBoard, gesture: &DragGesture) -> Result<DragOutcome, StoreError> {
    match gesture {
        DragGesture::Move {
            order_id,
            target,
            index,
        } => {
            let source = board
                .container_of(order_id)
                .cloned()
                .ok_or_else(|| StoreError::UnknownOrder(order_id.clone()))?;
            let next = board.move_item(order_id, target, *index)?;
            let mut touched = vec![source];
            push_unique(&mut touched, target.clone());
            Ok(DragOutcome {
                board: next,
                touched,
            })
        }
        DragGesture::Reorder {
            container,
            from,
            to,
        } => Ok(DragOutcome {
            board: board.reorder_within_container(container, *from, *to)?,
            touched: vec![container.clone()],
        }),
        DragGesture::SwapNumber { order_id, number } => {
            let next = board.swap_numbers(order_id, *number)?;
            let mut touched = Vec::new();
            for container in next.containers() {
                let before = board.container(&container.key);
                let numbers_changed = container
                    .order_ids
                    .iter()
                    .any(|id| board.number_of(id) != next.number_of(id));
                if numbers_changed || before.map(|old| &old.order_ids) != Some(&container.order_ids) {
                    push_unique(&mut touched, container.key.clone());
                }
            }
            Ok(DragOutcome {
                board: next,
                touched,
            })
        }
    }
}

fn push_unique(keys: &mut Vec<ContainerKey>, key: ContainerKey) {
    if !keys.contains(&key) {
        keys.push(key);
    }
}
