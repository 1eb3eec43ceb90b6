use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use log::LevelFilter;
use pmic_core::app::App;
use pmic_core::board::{Board, Line};
use pmic_core::buzzer::BuzzerTrait;
use pmic_core::config::Config;
use pmic_core::registers::{HostPort, SharedRegisters};
use pmic_core::scheduler::{Scheduler, Timebase};

mod buzzer;
mod log_capture;
mod mock_hw_tui;
mod sim_board;

use mock_hw_tui::{LineTasks, LogChannel, MockHwTui};
use sim_board::{RealTimeTimer, SimBoard, SimInputs, SimOutputs, SimRtc, lock};

static TIMEBASE: Timebase = Timebase::new();
static SHARED: SharedRegisters = SharedRegisters::new();
static RTC: SimRtc = SimRtc::new();
static QUIT: AtomicBool = AtomicBool::new(false);

pub fn quit_requested() -> bool {
    QUIT.load(Ordering::Relaxed)
}

enum Mode {
    Panel,
    /// Runs for a fixed time without a terminal UI; DCIN is plugged in
    /// halfway through.
    Headless(Duration),
}

enum Frontend {
    Panel(LogChannel),
    Headless(Duration),
}

fn parse_args() -> anyhow::Result<Mode> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(Mode::Panel),
        Some("--headless") => {
            let secs = match args.next() {
                Some(s) => s.parse().with_context(|| format!("invalid duration {s:?}"))?,
                None => 30,
            };
            Ok(Mode::Headless(Duration::from_secs(secs)))
        }
        Some(other) => Err(anyhow!("unknown argument {other:?}, expected --headless [SECONDS]")),
    }
}

/// Installs the logger before the firmware logs its first line.
fn start_logging(mode: Mode) -> Frontend {
    match mode {
        Mode::Panel => Frontend::Panel(mock_hw_tui::install_logger(LevelFilter::Debug)),
        Mode::Headless(run_for) => {
            log_capture::init(LevelFilter::Info);
            Frontend::Headless(run_for)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let frontend = start_logging(parse_args()?);

    let config = Config::DEFAULT;
    let inputs = Arc::new(Mutex::new(SimInputs::default()));
    let outputs = Arc::new(Mutex::new(SimOutputs::default()));
    let board = SimBoard::new(config, Arc::clone(&inputs), Arc::clone(&outputs), &TIMEBASE);

    let mut sched = Scheduler::new(&TIMEBASE);
    let mut app = App::new(config, board, &RTC, &SHARED, &mut sched).map_err(|e| anyhow!("{e}"))?;
    let mut timer = RealTimeTimer::new(&TIMEBASE);

    let lines = LineTasks {
        pwr_key: app.line_task(Line::PwrKey),
        charger_status: app.line_task(Line::ChargerStatus),
        dcin: app.line_task(Line::Dcin),
    };

    match frontend {
        Frontend::Panel(logs) => {
            let port = HostPort::new(&SHARED, &RTC, &TIMEBASE, app.host_task());
            let mut tui = MockHwTui::new(logs, inputs, outputs, port, config.i2c_address, &TIMEBASE, lines, || {
                QUIT.store(true, Ordering::Relaxed)
            });
            while !quit_requested() {
                sched.run_pass(&mut app, &mut timer);
            }
            tui.shutdown();
        }
        Frontend::Headless(run_for) => {
            let script = thread::spawn(move || {
                thread::sleep(run_for / 2);
                lock(&inputs).dcin_plugged = true;
                TIMEBASE.wake(lines.dcin);
                thread::sleep(run_for - run_for / 2);
                QUIT.store(true, Ordering::Relaxed);
            });
            while !quit_requested() {
                sched.run_pass(&mut app, &mut timer);
            }
            let _ = script.join();

            println!("final state: {:#06x}", app.state().bits());
            for entry in log_capture::recent_warnings() {
                println!("[{:>9} ms] {:<5} {}", entry.at_ms, entry.level, entry.message);
            }
        }
    }

    app.board().buzzer().stop();
    Ok(())
}
