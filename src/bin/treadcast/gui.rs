use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    prelude::*,
    widgets::{block::Title, Block, Borders, Paragraph},
    Terminal,
};
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use treadcast::{
    dispatch::{DisplaySink, SinkError, StatusLines},
    frame::Frame,
    mode_controller::CommandHandle,
};

/// How much one +/- press changes the delay.
const DELAY_STEP_SECONDS: f64 = 0.5;

/// How often the screen is redrawn while no key is pressed.
const REDRAW_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Error)]
pub enum GuiError {
    #[error("terminal io: {0}")]
    Io(#[from] io::Error),
}

/// What the display sink last received, for the UI loop to draw.
#[derive(Debug, Default)]
pub struct Screen {
    status: StatusLines,
    sequence: Option<u64>,
    camera_a: Option<(u32, u32)>,
    camera_b: Option<(u32, u32)>,
    pressure: Option<PressureSummary>,
    updates: u64,
}

#[derive(Debug, Clone, Copy)]
struct PressureSummary {
    total: u64,
    peak: u16,
    peak_at: (usize, usize),
}

/// A [`DisplaySink`] that only records what it was given. The UI loop
/// reads it back on its own schedule.
pub struct TerminalDisplay {
    screen: Arc<Mutex<Screen>>,
}

impl TerminalDisplay {
    pub fn new(screen: Arc<Mutex<Screen>>) -> Self {
        Self { screen }
    }
}

impl DisplaySink for TerminalDisplay {
    fn update_frames(&mut self, frame: &Frame, status: &StatusLines) -> Result<(), SinkError> {
        let mut screen = self.screen.lock().unwrap_or_else(PoisonError::into_inner);
        screen.status = status.clone();
        screen.sequence = Some(frame.sequence);
        screen.camera_a = frame.camera_a.as_ref().map(|i| (i.width, i.height));
        screen.camera_b = frame.camera_b.as_ref().map(|i| (i.width, i.height));
        // Frames between pad reads carry no map; keep showing the last one
        if let Some(map) = &frame.pressure {
            let size = map.size();
            let (at, peak) = map
                .cells()
                .iter()
                .enumerate()
                .max_by_key(|&(_, &v)| v)
                .map_or((0, 0), |(at, &v)| (at, v));
            screen.pressure = Some(PressureSummary {
                total: map.total(),
                peak,
                peak_at: (at / size.max(1), at % size.max(1)),
            });
        }
        screen.updates += 1;
        Ok(())
    }
}

/// Runs the terminal UI until the user quits, translating keys into
/// commands.
pub fn run(
    screen: &Mutex<Screen>,
    commands: &CommandHandle,
    scrub_step: i64,
    initial_delay: f64,
    armed: bool,
) -> Result<(), GuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    terminal.clear()?;

    let res = run_app(&mut terminal, screen, commands, scrub_step, initial_delay, armed);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    res
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    screen: &Mutex<Screen>,
    commands: &CommandHandle,
    scrub_step: i64,
    initial_delay: f64,
    mut armed: bool,
) -> Result<(), GuiError> {
    let mut delay = initial_delay;
    loop {
        terminal.draw(|f| {
            let screen = screen.lock().unwrap_or_else(PoisonError::into_inner);
            ui(f, &screen, armed)
        })?;

        if !event::poll(REDRAW_INTERVAL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
            KeyCode::Char(' ') => {
                // Play always starts from the configured delay
                delay = initial_delay;
                commands.toggle_play();
            }
            KeyCode::Char('p') => commands.toggle_pause(),
            KeyCode::Left => commands.scrub(-scrub_step),
            KeyCode::Right => commands.scrub(scrub_step),
            KeyCode::Char('s') => commands.cycle_slow_level(),
            KeyCode::Char('+') | KeyCode::Char('=') => {
                delay += DELAY_STEP_SECONDS;
                commands.set_delay_seconds(delay);
            }
            KeyCode::Char('-') => {
                delay = (delay - DELAY_STEP_SECONDS).max(0.0);
                commands.set_delay_seconds(delay);
            }
            KeyCode::Char('r') => {
                armed = !armed;
                commands.arm_recording(armed);
            }
            _ => {}
        }
    }
}

fn ui(f: &mut ratatui::Frame, screen: &Screen, armed: bool) {
    let title = Title::from(" TreadCast ".magenta().bold());
    let block = Block::default()
        .title(title.alignment(Alignment::Center))
        .borders(Borders::ALL);

    let camera = |name: &str, dims: Option<(u32, u32)>| match dims {
        Some((w, h)) => format!("Camera {}: {}x{}", name, w, h),
        None => format!("Camera {}: -", name),
    };
    let pressure = match screen.pressure {
        Some(p) => format!(
            "Pressure: total {}, peak {} at ({}, {})",
            p.total, p.peak, p.peak_at.0, p.peak_at.1
        ),
        None => "Pressure: -".to_owned(),
    };
    let sequence = screen
        .sequence
        .map_or("-".to_owned(), |seq| seq.to_string());

    let mut lines: Vec<Line> = screen
        .status
        .iter()
        .map(|s| Line::from(Span::styled(s.clone(), Style::new().add_modifier(Modifier::BOLD))))
        .collect();
    lines.extend([
        Line::from(""),
        Line::from(format!("Tick {}  ({} updates)", sequence, screen.updates)),
        Line::from(camera("A", screen.camera_a)),
        Line::from(camera("B", screen.camera_b)),
        Line::from(pressure),
        Line::from(""),
        Line::from(if armed { "Recording armed".red() } else { "Recording off".into() }),
        Line::from(
            " space play/idle  p pause  \u{2190}/\u{2192} scrub  s slow  +/- delay  r record  q quit "
                .dark_gray(),
        ),
    ]);

    f.render_widget(Paragraph::new(lines).block(block), f.size());
}
