use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Wrap};

use crate::domain::JobState;
use crate::error::PullError;
use crate::pipeline::Job;

const EVENTS_MAX: usize = 8;

struct PanelState {
    job: Job,
    events: VecDeque<String>,
    started: Instant,
    cancel_requested: bool,
}

impl PanelState {
    fn apply(&mut self, job: Job) {
        if !job.status.is_empty() && job.status != self.job.status {
            push_event(&mut self.events, format!("{} {}", timestamp(), job.status));
        }
        self.job = job;
    }
}

/// Full-screen status panel for one pipeline command.
pub struct Tui {
    title: String,
    state: PanelState,
}

enum KeyAction {
    None,
    Cancel,
    Quit,
}

impl Tui {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            state: PanelState {
                job: Job::default(),
                events: VecDeque::new(),
                started: Instant::now(),
                cancel_requested: false,
            },
        }
    }

    /// Runs `work` on a worker thread and renders the snapshots arriving on
    /// `updates` until it returns. `cancel` is invoked for `c`/`Esc`, and
    /// also for `q` before the panel closes.
    pub fn run<F, C, R>(&mut self, updates: Receiver<Job>, cancel: C, work: F) -> miette::Result<R>
    where
        F: FnOnce() -> Result<R, PullError> + Send + 'static,
        C: Fn() -> bool,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || tx.send(work()));

        let mut tick = 0usize;
        let outcome = loop {
            while let Ok(job) = updates.try_recv() {
                self.state.apply(job);
            }
            terminal
                .draw(|frame| draw_ui(frame, &self.title, &self.state, tick))
                .into_diagnostic()?;

            if let Ok(result) = rx.try_recv() {
                handle.join().ok();
                break Some(result);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    match handle_key(key) {
                        KeyAction::Cancel => {
                            self.state.cancel_requested = cancel();
                        }
                        KeyAction::Quit => {
                            cancel();
                            break None;
                        }
                        KeyAction::None => {}
                    }
                }
            }

            tick = tick.wrapping_add(1);
        };

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;

        match outcome {
            Some(result) => result.map_err(miette::Report::new),
            None => Err(miette::Report::msg("aborted")),
        }
    }
}

fn handle_key(key: KeyEvent) -> KeyAction {
    if key.kind != KeyEventKind::Press {
        return KeyAction::None;
    }
    match key.code {
        KeyCode::Char('c') | KeyCode::Esc => KeyAction::Cancel,
        KeyCode::Char('q') => KeyAction::Quit,
        _ => KeyAction::None,
    }
}

fn draw_ui(frame: &mut ratatui::Frame, title: &str, state: &PanelState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(title, state, tick), chunks[0]);
    frame.render_widget(draw_gauge(&state.job), chunks[1]);
    frame.render_widget(draw_status_panel(state), chunks[2]);

    let keys = Paragraph::new(Line::from(Span::styled(
        "c/Esc cancel   q quit",
        Style::default().fg(Color::Gray),
    )));
    frame.render_widget(keys, chunks[3]);
}

fn draw_header(title: &str, state: &PanelState, tick: usize) -> Paragraph<'static> {
    let hb = if state.job.state.is_running() && tick % 2 == 0 {
        "*"
    } else {
        " "
    };
    let line = Line::from(vec![
        Span::styled(
            "FRAMEPULL",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!("   Op: {title}   Elapsed: {}s   ", state.started.elapsed().as_secs())),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    Paragraph::new(line)
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_gauge(job: &Job) -> Gauge<'static> {
    let (label, ratio) = match job.state {
        JobState::Uploading => ("Upload", job.upload_progress),
        JobState::AwaitingDownload => ("Upload", 1.0),
        JobState::Idle => ("Upload", job.upload_progress),
        _ => ("Download", job.download_progress),
    };
    let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
    Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(label))
        .gauge_style(Style::default().fg(state_color(job.state)))
        .ratio(ratio)
        .label(format!("{:>3}%", (ratio * 100.0) as u32))
}

fn draw_status_panel(state: &PanelState) -> Paragraph<'static> {
    let job = &state.job;
    let mut lines = vec![
        Line::from(vec![
            Span::styled("State: ", Style::default().fg(Color::Gray)),
            Span::styled(
                job.state.label().to_string(),
                Style::default()
                    .fg(state_color(job.state))
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled("   Retries: ", Style::default().fg(Color::Gray)),
            Span::raw(job.retries.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::raw(job.status.clone()),
        ]),
    ];
    if let Some(locator) = &job.locator {
        lines.push(Line::from(vec![
            Span::styled("Result: ", Style::default().fg(Color::Gray)),
            Span::raw(locator.to_string()),
        ]));
    }
    if state.cancel_requested && !job.state.is_terminal() {
        lines.push(Line::from(Span::styled(
            "Cancelling...",
            Style::default().fg(Color::Yellow),
        )));
    }
    lines.push(Line::from(Span::styled(
        "Recent events:",
        Style::default().fg(Color::Gray),
    )));
    for event in state.events.iter().rev() {
        lines.push(Line::from(format!("- {event}")));
    }

    Paragraph::new(lines)
        .block(Block::default().borders(Borders::TOP))
        .wrap(Wrap { trim: true })
}

fn state_color(state: JobState) -> Color {
    match state {
        JobState::Complete => Color::Green,
        JobState::Failed => Color::Red,
        JobState::Cancelled => Color::Yellow,
        _ => Color::Cyan,
    }
}

fn push_event(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > EVENTS_MAX {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
