use chrono::{DateTime, Local, Utc};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Cell, List, ListItem, ListState, Paragraph, Row, Table, Wrap},
};
use routeboard_core::{
    live::SyncPhase,
    model::{ContainerKey, OrderId, ResolvedCoordinate, RouteOrigin, RouteResult},
    session::{RouteStats, SessionPhase},
    store::Container,
};

use crate::app::{App, Mode};

const LIVE_PANEL_WIDTH: u16 = 34;

pub(crate) fn draw(frame: &mut Frame<'_>, app: &App) {
    let area = frame.area();

    // Outer layout: title, board, status line
    let layout_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(area);

    let chunks = layout_chunks.as_ref();
    let [header_area, content_area, status_area] = chunks else {
        return;
    };

    let header = Paragraph::new(header_text(app))
        .block(Block::default().borders(Borders::ALL).title("Routeboard"));
    frame.render_widget(header, *header_area);

    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(0), Constraint::Length(LIVE_PANEL_WIDTH)])
        .split(*content_area);
    let [board_area, live_area] = content_chunks.as_ref() else {
        return;
    };
    draw_board(frame, app, *board_area);
    draw_live_panel(frame, app, *live_area);

    let nav_hint = match app.mode {
        Mode::Board => {
            "←/→ ↑/↓ select · Shift+arrows drag · n number · o optimize · s save · r sync · u/Ctrl-R undo/redo · q quit"
        }
        Mode::NumberPrompt => "Type number · Enter swap · Esc cancel",
    };

    let status_text = if app.mode == Mode::NumberPrompt {
        format!("Swap to number: {} · {nav_hint}", app.number_input)
    } else if let Some(busy) = app.busy {
        format!("{busy}… · {nav_hint}")
    } else if let Some(msg) = &app.error_message {
        format!("{msg} · {nav_hint}")
    } else if let Some(msg) = &app.info_message {
        format!("{msg} · {nav_hint}")
    } else {
        nav_hint.to_owned()
    };

    let status_style = if app.error_message.is_some() {
        Style::default().fg(Color::Red)
    } else if app.busy.is_some() || app.mode == Mode::NumberPrompt {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };

    let status = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(status_style)
        .wrap(Wrap { trim: true });

    frame.render_widget(status, *status_area);
}

fn header_text(app: &App) -> String {
    let session = &app.session;
    let phase = match session.phase() {
        SessionPhase::Closed => "closed",
        SessionPhase::Opening => "loading",
        SessionPhase::Ready => "saved",
        SessionPhase::Editing => "unsaved changes",
        SessionPhase::Optimizing => "optimizing",
        SessionPhase::Saving => "saving",
        SessionPhase::Error => "save failed",
    };
    let orders = session.board().map_or(0, |board| board.order_count());
    let queued = match session.queued_edits() {
        0 => String::new(),
        count => format!(" · {count} edits queued"),
    };
    format!(
        "{orders} orders · {} couriers · {phase}{queued}",
        session.couriers().len()
    )
}

fn draw_board(frame: &mut Frame<'_>, app: &App, area: Rect) {
    let Some(board) = app.session.board() else {
        let paragraph = Paragraph::new("No dispatch view open.")
            .block(Block::default().borders(Borders::ALL).title("Board"));
        frame.render_widget(paragraph, area);
        return;
    };

    let containers = board.containers();
    let Ok(count) = u32::try_from(containers.len()) else {
        return;
    };
    if count == 0 {
        return;
    }
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(containers.iter().map(|_| Constraint::Ratio(1, count)))
        .split(area);

    for (index, (container, column_area)) in containers.iter().zip(columns.iter()).enumerate() {
        draw_container(frame, app, container, index == app.column, *column_area);
    }
}

fn draw_container(frame: &mut Frame<'_>, app: &App, container: &Container, focused: bool, area: Rect) {
    let session = &app.session;
    let route = session.route(&container.key);

    let items = if container.order_ids.is_empty() {
        vec![ListItem::new("(drop orders here)").style(Style::default().fg(Color::DarkGray))]
    } else {
        container
            .order_ids
            .iter()
            .map(|order_id| order_item(app, order_id))
            .collect()
    };

    let title = container_title(app, &container.key, route, session.route_stats(&container.key));
    let border_style = if focused {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(border_style)
                .title(title),
        )
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        );

    let mut state = ListState::default();
    if focused && !container.order_ids.is_empty() {
        state.select(Some(app.row));
    }
    frame.render_stateful_widget(list, area, &mut state);
}

fn order_item(app: &App, order_id: &OrderId) -> ListItem<'static> {
    let session = &app.session;
    let number = session
        .board()
        .and_then(|board| board.number_of(order_id))
        .map_or_else(|| "?".to_owned(), |number| number.to_string());
    let name = session
        .order(order_id)
        .map_or_else(|| order_id.to_string(), |order| order.display_name.clone());
    let (marker, color) = match session.coordinate(order_id) {
        ResolvedCoordinate::Located(_) => ("●", Color::Green),
        ResolvedCoordinate::Pending => ("…", Color::Yellow),
        ResolvedCoordinate::Unresolved => ("?", Color::Red),
    };
    ListItem::new(Line::from(vec![
        Span::styled(format!("{marker} "), Style::default().fg(color)),
        Span::raw(format!("#{number} {name}")),
    ]))
}

fn container_title(
    app: &App,
    key: &ContainerKey,
    route: Option<&RouteResult>,
    stats: Option<RouteStats>,
) -> String {
    let owner = match key {
        ContainerKey::Unassigned => "Unassigned".to_owned(),
        ContainerKey::Courier(id) => app
            .session
            .couriers()
            .iter()
            .find(|courier| &courier.id == id)
            .map_or_else(|| id.to_string(), |courier| courier.name.clone()),
    };
    let figures = stats.map_or_else(String::new, |stats| {
        format!(" {}/{} · {:.1} km", stats.located, stats.stops, stats.distance_km)
    });
    let label = route.map_or_else(String::new, route_label);
    format!("{owner}{figures}{label}")
}

fn route_label(route: &RouteResult) -> String {
    let source = match route.origin {
        RouteOrigin::Remote => "routed",
        RouteOrigin::Heuristic => "estimated",
        RouteOrigin::None => return String::new(),
    };
    match route.duration {
        Some(duration) => {
            let minutes = duration.seconds.div_ceil(60);
            let prefix = if duration.approximate { "~" } else { "" };
            format!(" · {source} {prefix}{minutes} min")
        }
        None => format!(" · {source}"),
    }
}

fn draw_live_panel(frame: &mut Frame<'_>, app: &App, area: Rect) {
    let sync = &app.sync;
    let state = match (sync.visible, sync.phase) {
        (false, _) => "paused".to_owned(),
        (true, SyncPhase::Fetching) => "syncing".to_owned(),
        (true, SyncPhase::Idle) => sync
            .last_synced
            .map_or_else(|| "waiting".to_owned(), synced_label),
    };
    let title = format!("Live · {state}");

    let Some(snapshot) = &app.positions else {
        let text = sync
            .last_error
            .clone()
            .unwrap_or_else(|| "No positions yet.".to_owned());
        let paragraph = Paragraph::new(text)
            .block(Block::default().borders(Borders::ALL).title(title))
            .wrap(Wrap { trim: true });
        frame.render_widget(paragraph, area);
        return;
    };

    let couriers = snapshot.couriers.iter().map(|position| (position, Color::Cyan));
    let clients = snapshot.clients.iter().map(|position| (position, Color::Magenta));
    let rows = couriers.chain(clients).map(|(position, color)| {
        Row::new(vec![
            Cell::from(position.name.clone()),
            Cell::from(format!("{:.4}", position.lat)),
            Cell::from(format!("{:.4}", position.lng)),
        ])
        .style(Style::default().fg(color))
    });

    let border_style = if sync.last_error.is_some() {
        Style::default().fg(Color::Red)
    } else {
        Style::default()
    };

    let column_widths = [
        Constraint::Min(10),
        Constraint::Length(9),
        Constraint::Length(9),
    ];
    let table = Table::new(rows, column_widths)
        .header(
            Row::new(vec!["Name", "Lat", "Lng"])
                .style(Style::default().add_modifier(Modifier::BOLD)),
        )
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(border_style)
                .title(title),
        )
        .column_spacing(1);

    frame.render_widget(table, area);
}

fn synced_label(at: DateTime<Utc>) -> String {
    format!("synced {}", at.with_timezone(&Local).format("%H:%M:%S"))
}
