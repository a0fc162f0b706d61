//! Terminal dispatch board for routeboard: drag orders between couriers, optimize routes,
//! save assignments and watch live positions.

mod app;
mod input;
mod settings;
mod ui;

use std::{fs::File, io, sync::Mutex, time::Duration as StdDuration};

use anyhow::{Context, Result};
use crossterm::{
    event::{self, DisableFocusChange, EnableFocusChange, Event as CEvent},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use routeboard_core::{
    drag::DragGesture,
    ports::PortError,
    session::{DispatchSession, EditOutcome, OptimizeResult, SaveOutcome, SaveTicket, SessionPhase},
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::app::{App, LiveView};
use crate::input::Action;
use crate::settings::Settings;

type Term = Terminal<CrosstermBackend<io::Stdout>>;

#[derive(Default)]
struct Jobs {
    optimize: Option<JoinHandle<OptimizeResult>>,
    save: Option<(SaveTicket, JoinHandle<Result<(), PortError>>)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings)?;

    // HTTP + session setup
    let client = settings.http.client()?;
    let backend = routeboard_provider_http::backend(client, &settings.http);
    let session = DispatchSession::new(backend, settings.dispatch.clone());
    info!(base_url = %settings.http.base_url, "Starting routeboard");

    // App state
    let app = App::new(session);

    // Terminal init
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run event loop
    let res = run(&mut terminal, app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableFocusChange)?;
    terminal.show_cursor()?;

    if let Err(err) = &res {
        error!(error = %err, "Routeboard exited with an error");
    }
    res
}

fn init_tracing(settings: &Settings) -> Result<()> {
    let path = settings.log_path();
    let file = File::create(&path).with_context(|| format!("creating log file {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

async fn run(terminal: &mut Term, mut app: App) -> Result<()> {
    let mut jobs = Jobs::default();
    open_view(terminal, &mut app).await?;

    loop {
        // Draw current UI
        terminal.draw(|frame| ui::draw(frame, &app))?;

        collect_jobs(terminal, &mut app, &mut jobs).await?;
        refresh_background(&mut app, &mut jobs);

        // Poll for input (non-blocking, small timeout to keep CPU low)
        if !event::poll(StdDuration::from_millis(100))? {
            continue;
        }
        let key = match event::read()? {
            CEvent::Key(key) => key,
            CEvent::FocusGained => {
                if let Some(live) = &app.live {
                    live.client.set_visible(true);
                }
                continue;
            }
            CEvent::FocusLost => {
                if let Some(live) = &app.live {
                    live.client.set_visible(false);
                }
                continue;
            }
            _ => continue,
        };

        match input::handle_key_event(key, &mut app) {
            Action::Quit => break,
            Action::None => {}
            Action::Edit(gesture) => {
                let followed = match &gesture {
                    DragGesture::Move { order_id, .. } | DragGesture::SwapNumber { order_id, .. } => {
                        Some(order_id.clone())
                    }
                    DragGesture::Reorder { .. } => app.selected_order().cloned(),
                };
                match app.session.apply_edit(gesture) {
                    Ok(EditOutcome::Applied(_)) => {
                        app.error_message = None;
                        if let Some(order_id) = followed {
                            app.follow(&order_id);
                        }
                    }
                    Ok(EditOutcome::Queued) => app.set_info("Save in progress, edit queued"),
                    Err(err) => app.set_error(err.to_string()),
                }
            }
            Action::Optimize => start_optimize(&mut app, &mut jobs),
            Action::Save => match app.session.begin_save() {
                Ok(ticket) => {
                    let request = ticket.clone();
                    let handle = tokio::spawn(async move { request.send().await });
                    jobs.save = Some((ticket, handle));
                    app.busy = Some("Saving");
                }
                Err(err) => app.set_error(err.to_string()),
            },
            Action::SyncNow => {
                if let Some(live) = &app.live {
                    live.client.sync_now();
                }
            }
            Action::Undo => match app.session.undo() {
                Ok(true) => app.clamp_cursor(),
                Ok(false) => app.set_info("Nothing to undo"),
                Err(err) => app.set_error(err.to_string()),
            },
            Action::Redo => match app.session.redo() {
                Ok(true) => app.clamp_cursor(),
                Ok(false) => app.set_info("Nothing to redo"),
                Err(err) => app.set_error(err.to_string()),
            },
        }
    }

    app.session.close();
    Ok(())
}

async fn open_view(terminal: &mut Term, app: &mut App) -> Result<()> {
    app.busy = Some("Loading orders");
    terminal.draw(|frame| ui::draw(frame, app))?;

    let res = app.session.open().await;
    app.busy = None;
    match res {
        Ok(()) => {
            app.live = Some(LiveView::new(app.session.start_live_sync()?));
            app.positions = None;
            app.clamp_cursor();
        }
        Err(err) => app.set_error(format!("Failed to load dispatch view: {err}")),
    }
    Ok(())
}

fn start_optimize(app: &mut App, jobs: &mut Jobs) {
    match app.session.begin_optimize() {
        Ok(job) => {
            jobs.optimize = Some(tokio::spawn(job.run()));
            app.busy = Some("Optimizing routes");
        }
        Err(err) => app.set_error(err.to_string()),
    }
}

async fn collect_jobs(terminal: &mut Term, app: &mut App, jobs: &mut Jobs) -> Result<()> {
    if jobs.optimize.as_ref().is_some_and(JoinHandle::is_finished)
        && let Some(handle) = jobs.optimize.take()
    {
        app.busy = None;
        match handle.await {
            Ok(result) => {
                let applied = app.session.complete_optimize(result);
                app.clamp_cursor();
                app.set_info(format!("Routes updated for {applied} containers"));
            }
            Err(err) => app.set_error(format!("Optimization task failed: {err}")),
        }
    }

    if jobs
        .save
        .as_ref()
        .is_some_and(|(_, handle)| handle.is_finished())
        && let Some((ticket, handle)) = jobs.save.take()
    {
        app.busy = None;
        let result = handle
            .await
            .unwrap_or_else(|err| Err(PortError::Internal(err.to_string())));
        match app.session.complete_save(&ticket, result) {
            SaveOutcome::Saved => app.set_info("Assignments saved"),
            SaveOutcome::Failed(message) => app.set_error(format!("Save failed: {message}")),
            SaveOutcome::Discarded => {}
        }
        app.clamp_cursor();
        if app.session.phase() == SessionPhase::Closed {
            // A completed save closes the view; reload what the backend now holds.
            app.live = None;
            open_view(terminal, app).await?;
        }
    }
    Ok(())
}

fn refresh_background(app: &mut App, jobs: &mut Jobs) {
    let now = Instant::now();
    app.session.poll_resolutions(now);
    if jobs.optimize.is_none() && app.session.reoptimize_due(now) {
        start_optimize(app, jobs);
    }

    let Some(live) = app.live.as_mut() else {
        return;
    };
    if live.positions.has_changed().unwrap_or(false) {
        let snapshot = live.positions.borrow_and_update().clone();
        if let Some(snapshot) = &snapshot {
            app.session.apply_live_positions(snapshot);
        }
        app.positions = snapshot;
    }
    app.sync = live.status.borrow_and_update().clone();
}
