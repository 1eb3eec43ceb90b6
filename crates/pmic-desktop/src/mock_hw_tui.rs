use std::io;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use log::{Level, LevelFilter, Metadata, Record};
use pmic_core::board::Line as BoardLine;
use pmic_core::i2c_slave::{BusEvent, I2cSlave};
use pmic_core::registers::{HostPort, Register, UNKNOWN};
use pmic_core::rtc::{DateTime, TimeService};
use pmic_core::scheduler::{TaskId, Timebase};
use pmic_core::state::SystemState;
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph},
};

use crate::sim_board::{SimInputs, SimOutputs, SimRtc, lock};

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
}

trait LevelExt {
    fn color(&self) -> Color;
    fn prefix(&self) -> &str;
}

impl LevelExt for Level {
    fn color(&self) -> Color {
        match *self {
            Level::Error => Color::Red,
            Level::Warn => Color::Yellow,
            Level::Info => Color::Cyan,
            Level::Debug => Color::Gray,
            Level::Trace => Color::DarkGray,
        }
    }

    fn prefix(&self) -> &str {
        match *self {
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN] ",
            Level::Info => "[INFO] ",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        }
    }
}

/// Registers polled for display. IRQ_STATUS is left out, reading it acks.
const POLLED: [Register; 11] = [
    Register::Status,
    Register::BatVoltage,
    Register::BatTemp,
    Register::BatPct,
    Register::DcinVoltage,
    Register::CpuTemp,
    Register::BatMinTemp,
    Register::BatMaxTemp,
    Register::MinBatVoltage,
    Register::MaxBatVoltage,
    Register::RtcTime,
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Knob {
    Vbat,
    Dcin,
    BatTemp,
}

const KNOBS: [Knob; 3] = [Knob::Vbat, Knob::Dcin, Knob::BatTemp];

/// What the simulated interrupt lines wake.
#[derive(Clone, Copy)]
pub struct LineTasks {
    pub pwr_key: TaskId,
    pub charger_status: TaskId,
    pub dcin: TaskId,
}

impl LineTasks {
    pub fn task(&self, line: BoardLine) -> TaskId {
        match line {
            BoardLine::PwrKey => self.pwr_key,
            BoardLine::ChargerStatus => self.charger_status,
            BoardLine::Dcin | BoardLine::Bat => self.dcin,
        }
    }
}

/// Address the host's kernel driver is bound to.
const DRIVER_ADDRESS: u8 = 0x34;

/// The panel's view of the host bus: an I2C master talking to the slave
/// state machine. Transfers to any address but the slave's are not
/// acknowledged.
struct HostBus {
    port: HostPort<'static, SimRtc>,
    slave: I2cSlave,
    address: u8,
}

impl HostBus {
    fn read(&mut self, target: u8, reg: Register) -> Option<u32> {
        if target != self.address {
            return None;
        }
        let port = &self.port;
        self.slave.handle_event(BusEvent::StartWrite, port);
        self.slave.handle_event(BusEvent::Rx(reg as u8), port);
        self.slave.handle_event(BusEvent::StartRead, port);
        let mut bytes = [0u8; 4];
        for byte in &mut bytes {
            *byte = self.slave.handle_event(BusEvent::Tx, port).unwrap_or(0xFF);
        }
        self.slave.handle_event(BusEvent::Stop, port);
        Some(u32::from_le_bytes(bytes))
    }

    fn write(&mut self, target: u8, reg: Register, value: u32) -> bool {
        if target != self.address {
            return false;
        }
        let port = &self.port;
        self.slave.handle_event(BusEvent::StartWrite, port);
        self.slave.handle_event(BusEvent::Rx(reg as u8), port);
        for byte in value.to_le_bytes() {
            self.slave.handle_event(BusEvent::Rx(byte), port);
        }
        self.slave.handle_event(BusEvent::Stop, port);
        true
    }
}

struct TuiState {
    inputs: Arc<Mutex<SimInputs>>,
    outputs: Arc<Mutex<SimOutputs>>,
    bus: HostBus,
    timebase: &'static Timebase,
    lines: LineTasks,
    registers: Vec<(Register, u32)>,
    logs: Vec<LogEntry>,
    rx: Receiver<TuiMessage>,
    selected: usize,
    max_logs: usize,
    buzzing: bool,
    should_quit: bool,
}

impl TuiState {
    fn collect_messages(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                TuiMessage::Log(log) => {
                    self.logs.push(log);
                    if self.logs.len() > self.max_logs {
                        self.logs.remove(0);
                    }
                }
                TuiMessage::Shutdown => self.should_quit = true,
            }
        }
    }

    fn poll_registers(&mut self) {
        self.registers = POLLED
            .iter()
            .map(|&reg| (reg, self.bus.read(DRIVER_ADDRESS, reg).unwrap_or(UNKNOWN)))
            .collect();
    }

    fn host_write(&mut self, reg: Register, value: u32) {
        if !self.bus.write(DRIVER_ADDRESS, reg, value) {
            log::warn!("Write to {:#04x} not acknowledged", DRIVER_ADDRESS);
        }
    }

    fn edge(&self, line: BoardLine) {
        self.timebase.wake(self.lines.task(line));
    }

    fn adjust(&mut self, increase: bool) {
        let delta = if increase { 1 } else { -1 };
        let mut inputs = lock(&self.inputs);
        match KNOBS[self.selected] {
            Knob::Vbat => inputs.vbat_mv = (inputs.vbat_mv + delta * 50).clamp(0, 4_400),
            Knob::Dcin => inputs.dcin_mv = (inputs.dcin_mv + delta * 100).clamp(0, 6_000),
            Knob::BatTemp => inputs.bat_temp = (inputs.bat_temp + delta * 1_000).clamp(-40_000, 80_000),
        }
    }

    fn toggle(&mut self, line: BoardLine) {
        {
            let mut inputs = lock(&self.inputs);
            match line {
                BoardLine::PwrKey => inputs.pwr_key = !inputs.pwr_key,
                BoardLine::ChargerStatus => inputs.charger_active = !inputs.charger_active,
                BoardLine::Dcin => inputs.dcin_plugged = !inputs.dcin_plugged,
                BoardLine::Bat => {}
            }
        }
        self.edge(line);
    }

    fn host_key(&mut self, key: char) {
        match key {
            'o' => self.host_write(Register::PowerOff, 0),
            's' => self.host_write(Register::PowerOff, 1),
            'r' => self.host_write(Register::PowerOff, 2),
            'b' => {
                self.buzzing = !self.buzzing;
                let value = if self.buzzing { (2_000 << 8) | 50 } else { 0 };
                self.host_write(Register::PlayBuzzer, value);
            }
            't' => {
                let now = SimRtc::new().now();
                self.host_write(Register::RtcTime, now);
            }
            'i' => {
                match self.bus.read(DRIVER_ADDRESS, Register::IrqStatus) {
                    Some(status) => log::info!("Host read IRQ_STATUS = {:#06x}", status),
                    None => log::warn!("Read from {:#04x} not acknowledged", DRIVER_ADDRESS),
                }
            }
            _ => {}
        }
    }
}

enum TuiMessage {
    Log(LogEntry),
    Shutdown,
}

/// Sends every log record to the panel.
pub struct TuiLogger {
    tx: Sender<TuiMessage>,
}

impl log::Log for TuiLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let entry = LogEntry {
            level: record.level(),
            message: format!("{}", record.args()),
        };
        let _ = self.tx.send(TuiMessage::Log(entry));
    }

    fn flush(&self) {}
}

/// Log records queued for the panel; installed before the firmware starts
/// so its boot messages are kept.
pub struct LogChannel {
    tx: Sender<TuiMessage>,
    rx: Receiver<TuiMessage>,
}

pub fn install_logger(max_level: LevelFilter) -> LogChannel {
    let (tx, rx) = channel();
    if log::set_boxed_logger(Box::new(TuiLogger { tx: tx.clone() })).is_ok() {
        log::set_max_level(max_level);
    }
    LogChannel { tx, rx }
}

/// Control panel for the simulated board plus a host-side register view.
pub struct MockHwTui {
    tx: Sender<TuiMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockHwTui {
    pub fn new(
        logs: LogChannel,
        inputs: Arc<Mutex<SimInputs>>,
        outputs: Arc<Mutex<SimOutputs>>,
        port: HostPort<'static, SimRtc>,
        address: u8,
        timebase: &'static Timebase,
        lines: LineTasks,
        on_quit: impl FnOnce() + Send + 'static,
    ) -> Self {
        let LogChannel { tx, rx } = logs;
        let state = TuiState {
            inputs,
            outputs,
            bus: HostBus {
                port,
                slave: I2cSlave::new(),
                address,
            },
            timebase,
            lines,
            registers: Vec::new(),
            logs: Vec::new(),
            rx,
            selected: 0,
            max_logs: 200,
            buzzing: false,
            should_quit: false,
        };

        let handle = thread::spawn(move || {
            if let Err(e) = run_tui(state) {
                eprintln!("TUI error: {}", e);
            }
            on_quit();
        });

        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(TuiMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockHwTui {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_tui(mut state: TuiState) -> Result<(), io::Error> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    loop {
        state.collect_messages();
        if state.should_quit {
            break;
        }
        state.poll_registers();

        terminal.draw(|f| ui(f, &state))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                    KeyCode::Up => state.selected = state.selected.saturating_sub(1),
                    KeyCode::Down => state.selected = (state.selected + 1).min(KNOBS.len() - 1),
                    KeyCode::Left | KeyCode::Char('-') => state.adjust(false),
                    KeyCode::Right | KeyCode::Char('+') | KeyCode::Char('=') => state.adjust(true),
                    KeyCode::Char('k') => state.toggle(BoardLine::PwrKey),
                    KeyCode::Char('c') => state.toggle(BoardLine::ChargerStatus),
                    KeyCode::Char('d') => state.toggle(BoardLine::Dcin),
                    KeyCode::Char(other) => state.host_key(other),
                    _ => {}
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    Ok(())
}

fn ui(f: &mut Frame, state: &TuiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(14),
            Constraint::Min(8),
            Constraint::Length(4),
        ])
        .split(f.area());

    let title = Paragraph::new("PMIC Simulator")
        .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(title, rows[0]);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[1]);
    render_board(f, columns[0], state);
    render_registers(f, columns[1], state);

    render_logs(f, rows[2], state);

    let help = Paragraph::new(vec![
        Line::from("↑/↓: select | ←/→: adjust | k: power key | c: charger status | d: plug DCIN | q: quit"),
        Line::from("host: o: power on | s: shutdown | r: reboot | b: buzzer | t: sync RTC | i: read IRQ_STATUS"),
    ])
    .style(Style::default().fg(Color::Gray))
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, rows[3]);
}

fn on_off(on: bool) -> Span<'static> {
    if on {
        Span::styled("ON ", Style::default().fg(Color::Green))
    } else {
        Span::styled("off", Style::default().fg(Color::DarkGray))
    }
}

fn render_board(f: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default().borders(Borders::ALL).title("Board");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let inputs = lock(&state.inputs).clone();
    let outputs = lock(&state.outputs).clone();

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(2),
            Constraint::Length(2),
            Constraint::Min(4),
        ])
        .split(inner);

    let knobs = [
        ("VBAT", inputs.vbat_mv as f64, "mV", 0.0, 4_400.0),
        ("DCIN", inputs.dcin_mv as f64, "mV", 0.0, 6_000.0),
        ("BAT temp", inputs.bat_temp as f64 / 1000.0, "°C", -40.0, 80.0),
    ];
    for (i, (name, value, unit, min, max)) in knobs.iter().enumerate() {
        let style = if i == state.selected {
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::White)
        };
        let gauge = Gauge::default()
            .gauge_style(style)
            .ratio(((value - min) / (max - min)).clamp(0.0, 1.0))
            .label(format!("{}: {:.1} {}", name, value, unit));
        f.render_widget(gauge, parts[i]);
    }

    let lines = vec![
        Line::from(vec![
            Span::raw("DCIN plugged "),
            on_off(inputs.dcin_plugged),
            Span::raw("  PWR key "),
            on_off(inputs.pwr_key),
            Span::raw("  CHRG status "),
            on_off(inputs.charger_active),
        ]),
        Line::from(vec![
            Span::raw("System power "),
            on_off(outputs.system_power),
            Span::raw("  Charger EN "),
            on_off(outputs.charger_enabled),
            Span::raw("  IRQ "),
            on_off(outputs.host_irq),
        ]),
        Line::from(format!(
            "Watchdog feeds {}  Backup {:#06x}  {}",
            outputs.watchdog_feeds,
            outputs.backup,
            if outputs.asleep { "DEEP SLEEP" } else { "running" }
        )),
    ];
    f.render_widget(Paragraph::new(lines), parts[3]);
}

fn render_registers(f: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default().borders(Borders::ALL).title("Host registers");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let items: Vec<ListItem> = state
        .registers
        .iter()
        .map(|&(reg, value)| {
            let shown = match reg {
                Register::Status => SystemState::from_bits(value)
                    .iter()
                    .map(|flag| flag.name())
                    .collect::<Vec<_>>()
                    .join(" "),
                Register::RtcTime => {
                    let dt = DateTime::from_unix(value);
                    format!(
                        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                        dt.year, dt.month, dt.day, dt.hours, dt.minutes, dt.seconds
                    )
                }
                _ => format!("{}", value as i32),
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<16}", format!("{:?}", reg)), Style::default().fg(Color::Cyan)),
                Span::raw(shown),
            ]))
        })
        .collect();

    f.render_widget(List::new(items), inner);
}

fn render_logs(f: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default().borders(Borders::ALL).title("Logs");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let max_logs = inner.height as usize;
    let start_idx = state.logs.len().saturating_sub(max_logs);

    let log_items: Vec<ListItem> = state.logs[start_idx..]
        .iter()
        .map(|log| {
            ListItem::new(Line::from(vec![
                Span::styled(log.level.prefix(), Style::default().fg(log.level.color())),
                Span::raw(" "),
                Span::raw(&log.message),
            ]))
        })
        .collect();

    f.render_widget(List::new(log_items), inner);
}
