use std::sync::Arc;

use routeboard_core::{
    drag::DragGesture,
    live::{LiveSyncClient, SyncStatus},
    model::{ContainerKey, LiveSnapshot, OrderId},
    session::DispatchSession,
};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Board,
    /// Typing the number to swap the selected order to.
    NumberPrompt,
}

/// Running live sync plus the receivers the board reads from.
pub(crate) struct LiveView {
    pub client: LiveSyncClient,
    pub positions: watch::Receiver<Option<Arc<LiveSnapshot>>>,
    pub status: watch::Receiver<SyncStatus>,
}

impl LiveView {
    pub(crate) fn new(client: LiveSyncClient) -> Self {
        let positions = client.positions();
        let status = client.status();
        Self {
            client,
            positions,
            status,
        }
    }
}

pub(crate) struct App {
    pub session: DispatchSession,
    pub live: Option<LiveView>,
    pub positions: Option<Arc<LiveSnapshot>>,
    pub sync: SyncStatus,

    pub mode: Mode,
    pub column: usize,
    pub row: usize,
    pub number_input: String,

    pub busy: Option<&'static str>,
    pub error_message: Option<String>,
    pub info_message: Option<String>,
}

impl App {
    pub(crate) fn new(session: DispatchSession) -> Self {
        Self {
            session,
            live: None,
            positions: None,
            sync: SyncStatus::default(),
            mode: Mode::Board,
            column: 0,
            row: 0,
            number_input: String::new(),
            busy: None,
            error_message: None,
            info_message: None,
        }
    }

    pub(crate) fn column_count(&self) -> usize {
        self.session
            .board()
            .map_or(0, |board| board.containers().len())
    }

    pub(crate) fn selected_container(&self) -> Option<&ContainerKey> {
        self.session
            .board()?
            .containers()
            .get(self.column)
            .map(|container| &container.key)
    }

    pub(crate) fn column_len(&self, column: usize) -> usize {
        self.session
            .board()
            .and_then(|board| board.containers().get(column))
            .map_or(0, |container| container.order_ids.len())
    }

    pub(crate) fn selected_order(&self) -> Option<&OrderId> {
        self.session
            .board()?
            .containers()
            .get(self.column)?
            .order_ids
            .get(self.row)
    }

    /// Keep the cursor on an existing cell after the board changed shape.
    pub(crate) fn clamp_cursor(&mut self) {
        let columns = self.column_count();
        self.column = self.column.min(columns.saturating_sub(1));
        self.row = self.row.min(self.column_len(self.column).saturating_sub(1));
    }

    /// Put the cursor on `order_id`, wherever it now lives.
    pub(crate) fn follow(&mut self, order_id: &OrderId) {
        let Some(board) = self.session.board() else {
            return;
        };
        let found = board
            .containers()
            .iter()
            .enumerate()
            .find_map(|(column, container)| {
                container
                    .order_ids
                    .iter()
                    .position(|id| id == order_id)
                    .map(|row| (column, row))
            });
        if let Some((column, row)) = found {
            self.column = column;
            self.row = row;
        }
    }

    /// Gesture moving the selected order to the neighbouring container.
    pub(crate) fn move_gesture(&self, step: isize) -> Option<DragGesture> {
        let order_id = self.selected_order()?.clone();
        let target_column = self.column.checked_add_signed(step)?;
        let target = self
            .session
            .board()?
            .containers()
            .get(target_column)?
            .key
            .clone();
        Some(DragGesture::Move {
            order_id,
            target,
            index: self.row,
        })
    }

    /// Gesture shifting the selected order one place up or down in its container.
    pub(crate) fn reorder_gesture(&self, step: isize) -> Option<DragGesture> {
        let container = self.selected_container()?.clone();
        let to = self.row.checked_add_signed(step)?;
        if to >= self.column_len(self.column) {
            return None;
        }
        Some(DragGesture::Reorder {
            container,
            from: self.row,
            to,
        })
    }

    pub(crate) fn set_error(&mut self, message: impl Into<String>) {
        self.info_message = None;
        self.error_message = Some(message.into());
    }

    pub(crate) fn set_info(&mut self, message: impl Into<String>) {
        self.error_message = None;
        self.info_message = Some(message.into());
    }
}
