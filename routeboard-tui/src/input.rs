use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use routeboard_core::drag::DragGesture;

use crate::app::{App, Mode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    Quit,
    /// Run `session.apply_edit`(...) and follow the moved order
    Edit(DragGesture),
    Optimize,
    Save,
    SyncNow,
    Undo,
    Redo,
}

pub(crate) fn handle_key_event(key: KeyEvent, app: &mut App) -> Action {
    use KeyCode::{Backspace, Char, Down, Enter, Esc, Left, Right, Up};

    // Global quit shortcut
    if key.code == Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return Action::Quit;
    }

    let shifted = key.modifiers.contains(KeyModifiers::SHIFT);
    let mut action = Action::None;

    match app.mode {
        Mode::Board => match key.code {
            Char('q') => action = Action::Quit,
            Left | Char('H') if shifted => action = gesture(app.move_gesture(-1)),
            Right | Char('L') if shifted => action = gesture(app.move_gesture(1)),
            Up | Char('K') if shifted => action = gesture(app.reorder_gesture(-1)),
            Down | Char('J') if shifted => action = gesture(app.reorder_gesture(1)),
            Left | Char('h') => {
                if app.column > 0 {
                    app.column -= 1;
                    app.clamp_cursor();
                }
            }
            Right | Char('l') => {
                if app.column + 1 < app.column_count() {
                    app.column += 1;
                    app.clamp_cursor();
                }
            }
            Up | Char('k') => {
                if app.row > 0 {
                    app.row -= 1;
                }
            }
            Down | Char('j') => {
                if app.row + 1 < app.column_len(app.column) {
                    app.row += 1;
                }
            }
            Char('n') => {
                if app.selected_order().is_some() {
                    app.mode = Mode::NumberPrompt;
                    app.number_input.clear();
                }
            }
            Char('o') => action = Action::Optimize,
            Char('s') => action = Action::Save,
            Char('r') if key.modifiers.contains(KeyModifiers::CONTROL) => action = Action::Redo,
            Char('r') => action = Action::SyncNow,
            Char('u') => action = Action::Undo,
            _ => {}
        },

        Mode::NumberPrompt => match key.code {
            Char(digit) if digit.is_ascii_digit() => {
                if app.number_input.len() < 9 {
                    app.number_input.push(digit);
                }
            }
            Backspace => {
                app.number_input.pop();
            }
            Enter => {
                app.mode = Mode::Board;
                let number = app.number_input.parse::<u32>().ok();
                match (app.selected_order().cloned(), number) {
                    (Some(order_id), Some(number)) => {
                        action = Action::Edit(DragGesture::SwapNumber { order_id, number });
                    }
                    _ => app.set_error("Type the number to swap with, then press Enter"),
                }
            }
            Esc => {
                app.mode = Mode::Board;
                app.number_input.clear();
            }
            _ => {}
        },
    }
    action
}

fn gesture(gesture: Option<DragGesture>) -> Action {
    gesture.map_or(Action::None, Action::Edit)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use routeboard_core::{
        backend::DispatchBackend,
        config::DispatchConfig,
        model::{ContainerKey, Courier, CourierId, Order, OrderId},
        session::DispatchSession,
        testing::{
            FeedReply, RecordingAssignments, ScriptedLiveFeed, StaticDispatchData, StaticExpander,
        },
    };

    use super::*;

    fn order(id: &str, number: u32, courier: Option<&str>) -> Order {
        Order {
            id: OrderId::from(id),
            order_number: number,
            delivery_address: String::new(),
            latitude: None,
            longitude: None,
            courier_id: courier.map(CourierId::from),
            status: String::new(),
            display_name: id.to_owned(),
        }
    }

    async fn app() -> App {
        let data = StaticDispatchData {
            orders: vec![
                order("a", 1, Some("c1")),
                order("b", 2, Some("c1")),
                order("u", 3, None),
            ],
            couriers: vec![Courier {
                id: CourierId::from("c1"),
                name: "Aru".to_owned(),
                latitude: None,
                longitude: None,
            }],
            depot: None,
        };
        let backend = DispatchBackend {
            data: Arc::new(data),
            assignments: Arc::new(RecordingAssignments::default()),
            expander: Arc::new(StaticExpander::default()),
            optimizer: None,
            live: Arc::new(ScriptedLiveFeed::new(vec![FeedReply::NotModified])),
        };
        let mut session = DispatchSession::new(backend, DispatchConfig::default());
        session.open().await.expect("open");
        App::new(session)
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn shift(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::SHIFT)
    }

    #[tokio::test]
    async fn cursor_stays_on_the_board() {
        let mut app = app().await;
        assert_eq!(handle_key_event(press(KeyCode::Left), &mut app), Action::None);
        assert_eq!(app.column, 0);

        handle_key_event(press(KeyCode::Right), &mut app);
        handle_key_event(press(KeyCode::Right), &mut app);
        assert_eq!(app.column, 1);

        handle_key_event(press(KeyCode::Down), &mut app);
        handle_key_event(press(KeyCode::Down), &mut app);
        assert_eq!(app.row, 1);
    }

    #[tokio::test]
    async fn shift_arrows_produce_gestures() {
        let mut app = app().await;
        handle_key_event(press(KeyCode::Right), &mut app);

        let reorder = handle_key_event(shift(KeyCode::Down), &mut app);
        assert_eq!(
            reorder,
            Action::Edit(DragGesture::Reorder {
                container: ContainerKey::Courier(CourierId::from("c1")),
                from: 0,
                to: 1,
            })
        );

        let moved = handle_key_event(shift(KeyCode::Left), &mut app);
        assert_eq!(
            moved,
            Action::Edit(DragGesture::Move {
                order_id: OrderId::from("a"),
                target: ContainerKey::Unassigned,
                index: 0,
            })
        );

        assert_eq!(handle_key_event(shift(KeyCode::Right), &mut app), Action::None);
        assert_eq!(handle_key_event(shift(KeyCode::Up), &mut app), Action::None);
    }

    #[tokio::test]
    async fn number_prompt_builds_swap() {
        let mut app = app().await;
        handle_key_event(press(KeyCode::Char('n')), &mut app);
        assert_eq!(app.mode, Mode::NumberPrompt);

        handle_key_event(press(KeyCode::Char('2')), &mut app);
        handle_key_event(press(KeyCode::Char('x')), &mut app);
        handle_key_event(press(KeyCode::Char('7')), &mut app);
        handle_key_event(press(KeyCode::Backspace), &mut app);
        let action = handle_key_event(press(KeyCode::Enter), &mut app);

        assert_eq!(app.mode, Mode::Board);
        assert_eq!(
            action,
            Action::Edit(DragGesture::SwapNumber {
                order_id: OrderId::from("u"),
                number: 2,
            })
        );
    }

    #[tokio::test]
    async fn empty_prompt_reports_error() {
        let mut app = app().await;
        handle_key_event(press(KeyCode::Char('n')), &mut app);
        assert_eq!(handle_key_event(press(KeyCode::Enter), &mut app), Action::None);
        assert!(app.error_message.is_some());
    }

    #[tokio::test]
    async fn command_keys() {
        let mut app = app().await;
        assert_eq!(handle_key_event(press(KeyCode::Char('o')), &mut app), Action::Optimize);
        assert_eq!(handle_key_event(press(KeyCode::Char('s')), &mut app), Action::Save);
        assert_eq!(handle_key_event(press(KeyCode::Char('r')), &mut app), Action::SyncNow);
        assert_eq!(
            handle_key_event(
                KeyEvent::new(KeyCode::Char('r'), KeyModifiers::CONTROL),
                &mut app
            ),
            Action::Redo
        );
        assert_eq!(handle_key_event(press(KeyCode::Char('u')), &mut app), Action::Undo);
        assert_eq!(handle_key_event(press(KeyCode::Char('q')), &mut app), Action::Quit);
    }
}
