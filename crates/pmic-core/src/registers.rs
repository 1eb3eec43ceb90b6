//! Host register map and the state shared between the foreground and the
//! bus interrupt.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;

use crate::i2c_slave::RegisterAccess;
use crate::rtc::TimeService;
use crate::scheduler::{TaskId, Timebase};

/// Read value of unknown and write-only registers.
pub const UNKNOWN: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Register {
    Status = 0,
    IrqStatus = 1,
    BatVoltage = 2,
    BatTemp = 3,
    BatMinTemp = 4,
    BatMaxTemp = 5,
    BatPct = 6,
    DcinVoltage = 7,
    CpuTemp = 8,
    MaxBatVoltage = 9,
    MinBatVoltage = 10,
    PowerOff = 11,
    RtcTime = 12,
    PlayBuzzer = 13,
}

impl TryFrom<u8> for Register {
    type Error = u8;

    fn try_from(addr: u8) -> Result<Self, Self::Error> {
        use Register::*;
        Ok(match addr {
            0 => Status,
            1 => IrqStatus,
            2 => BatVoltage,
            3 => BatTemp,
            4 => BatMinTemp,
            5 => BatMaxTemp,
            6 => BatPct,
            7 => DcinVoltage,
            8 => CpuTemp,
            9 => MaxBatVoltage,
            10 => MinBatVoltage,
            11 => PowerOff,
            12 => RtcTime,
            13 => PlayBuzzer,
            _ => return Err(addr),
        })
    }
}

/// Register values as of the end of the last foreground task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub status: u32,
    pub bat_voltage: i32,
    pub bat_temp: i32,
    pub bat_min_temp: i32,
    pub bat_max_temp: i32,
    pub bat_pct: i32,
    pub dcin_voltage: i32,
    pub cpu_temp: i32,
    pub max_bat_voltage: i32,
    pub min_bat_voltage: i32,
}

impl Snapshot {
    const EMPTY: Snapshot = Snapshot {
        status: 0,
        bat_voltage: 0,
        bat_temp: 0,
        bat_min_temp: 0,
        bat_max_temp: 0,
        bat_pct: 0,
        dcin_voltage: 0,
        cpu_temp: 0,
        max_bat_voltage: 0,
        min_bat_voltage: 0,
    };

    /// Value of a readable register backed by the snapshot.
    pub fn get(&self, reg: Register) -> Option<u32> {
        let value = match reg {
            Register::Status | Register::IrqStatus => return Some(self.status),
            Register::BatVoltage => self.bat_voltage,
            Register::BatTemp => self.bat_temp,
            Register::BatMinTemp => self.bat_min_temp,
            Register::BatMaxTemp => self.bat_max_temp,
            Register::BatPct => self.bat_pct,
            Register::DcinVoltage => self.dcin_voltage,
            Register::CpuTemp => self.cpu_temp,
            Register::MaxBatVoltage => self.max_bat_voltage,
            Register::MinBatVoltage => self.min_bat_voltage,
            Register::PowerOff | Register::RtcTime | Register::PlayBuzzer => return None,
        };
        // negative temperatures go out two's complement
        Some(value as u32)
    }
}

/// A host write that needs the foreground to act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostCommand {
    PowerOn,
    Shutdown,
    Reboot,
    SetTime(u32),
    PlayBuzzer { frequency: u32, volume: u32 },
}

impl HostCommand {
    /// Decodes a register write; `None` for read-only registers and
    /// unsupported values.
    pub fn decode(reg: Register, value: u32) -> Option<Self> {
        match reg {
            Register::PowerOff => match value {
                0 => Some(HostCommand::PowerOn),
                1 => Some(HostCommand::Shutdown),
                2 => Some(HostCommand::Reboot),
                _ => None,
            },
            Register::RtcTime => Some(HostCommand::SetTime(value)),
            Register::PlayBuzzer => Some(HostCommand::PlayBuzzer {
                frequency: (value >> 8) & 0xFFFF,
                volume: value & 0xFF,
            }),
            _ => None,
        }
    }
}

pub const COMMAND_QUEUE_LEN: usize = 8;

struct Bank {
    snapshot: Snapshot,
    commands: Deque<HostCommand, COMMAND_QUEUE_LEN>,
    irq_ack: Option<u32>,
}

/// Interrupt-safe mailbox between the bus handler and the foreground.
pub struct SharedRegisters {
    bank: Mutex<RefCell<Bank>>,
}

impl SharedRegisters {
    pub const fn new() -> Self {
        Self {
            bank: Mutex::new(RefCell::new(Bank {
                snapshot: Snapshot::EMPTY,
                commands: Deque::new(),
                irq_ack: None,
            })),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        critical_section::with(|cs| self.bank.borrow_ref_mut(cs).snapshot = snapshot);
    }

    pub fn snapshot(&self) -> Snapshot {
        critical_section::with(|cs| self.bank.borrow_ref(cs).snapshot)
    }

    /// Queues a command; returns `false` if the queue is full.
    pub fn push_command(&self, command: HostCommand) -> bool {
        critical_section::with(|cs| self.bank.borrow_ref_mut(cs).commands.push_back(command).is_ok())
    }

    pub fn pop_command(&self) -> Option<HostCommand> {
        critical_section::with(|cs| self.bank.borrow_ref_mut(cs).commands.pop_front())
    }

    /// Reads STATUS for the host and records that it has seen that value.
    pub fn ack_irq(&self) -> u32 {
        critical_section::with(|cs| {
            let mut bank = self.bank.borrow_ref_mut(cs);
            let status = bank.snapshot.status;
            bank.irq_ack = Some(status);
            status
        })
    }

    /// Status value of the latest unprocessed acknowledgement.
    pub fn take_irq_ack(&self) -> Option<u32> {
        critical_section::with(|cs| self.bank.borrow_ref_mut(cs).irq_ack.take())
    }
}

impl Default for SharedRegisters {
    fn default() -> Self {
        Self::new()
    }
}

/// Register file as seen from the bus interrupt: reads come from the
/// published snapshot and the clock, writes are queued and wake `host_task`.
pub struct HostPort<'a, R: TimeService> {
    shared: &'a SharedRegisters,
    rtc: &'a R,
    timebase: &'a Timebase,
    host_task: TaskId,
}

impl<'a, R: TimeService> HostPort<'a, R> {
    pub fn new(shared: &'a SharedRegisters, rtc: &'a R, timebase: &'a Timebase, host_task: TaskId) -> Self {
        Self {
            shared,
            rtc,
            timebase,
            host_task,
        }
    }
}

impl<R: TimeService> RegisterAccess for HostPort<'_, R> {
    fn read(&self, addr: u8) -> u32 {
        let Ok(reg) = Register::try_from(addr) else {
            return UNKNOWN;
        };
        if reg == Register::IrqStatus {
            let status = self.shared.ack_irq();
            self.timebase.wake(self.host_task);
            return status;
        }
        if reg == Register::RtcTime {
            return self.rtc.now();
        }
        self.shared.snapshot().get(reg).unwrap_or(UNKNOWN)
    }

    fn write(&self, addr: u8, value: u32) {
        let Some(command) = Register::try_from(addr)
            .ok()
            .and_then(|reg| HostCommand::decode(reg, value))
        else {
            return;
        };
        if !self.shared.push_command(command) {
            log::warn!("Host command queue full, dropping {:?}", command);
            return;
        }
        self.timebase.wake(self.host_task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FixedClock(Cell<u32>);

    impl TimeService for FixedClock {
        fn now(&self) -> u32 {
            self.0.get()
        }

        fn set_date_time(&self, dt: &crate::rtc::DateTime) {
            self.0.set(dt.to_unix());
        }
    }

    fn port_fixture() -> (SharedRegisters, FixedClock, Timebase) {
        (SharedRegisters::new(), FixedClock(Cell::new(1_700_000_000)), Timebase::new())
    }

    fn host_task() -> TaskId {
        let timebase = Timebase::new();
        let mut sched = crate::scheduler::Scheduler::new(&timebase);
        sched.register().unwrap()
    }

    #[test]
    fn power_off_register_is_three_way() {
        assert_eq!(HostCommand::decode(Register::PowerOff, 0), Some(HostCommand::PowerOn));
        assert_eq!(HostCommand::decode(Register::PowerOff, 1), Some(HostCommand::Shutdown));
        assert_eq!(HostCommand::decode(Register::PowerOff, 2), Some(HostCommand::Reboot));
        assert_eq!(HostCommand::decode(Register::PowerOff, 3), None);
        assert_eq!(HostCommand::decode(Register::Status, 1), None);
    }

    #[test]
    fn buzzer_value_is_unpacked() {
        assert_eq!(
            HostCommand::decode(Register::PlayBuzzer, 0x00_0F_A0_32),
            Some(HostCommand::PlayBuzzer { frequency: 4000, volume: 50 })
        );
    }

    #[test]
    fn reads_come_from_snapshot_and_clock() {
        let (shared, clock, timebase) = port_fixture();
        let port = HostPort::new(&shared, &clock, &timebase, host_task());
        shared.publish(Snapshot {
            status: 0b1010,
            bat_temp: -5_000,
            ..Snapshot::default()
        });

        assert_eq!(port.read(Register::Status as u8), 0b1010);
        assert_eq!(port.read(Register::BatTemp as u8), (-5_000i32) as u32);
        assert_eq!(port.read(Register::RtcTime as u8), 1_700_000_000);
        assert_eq!(port.read(Register::PowerOff as u8), UNKNOWN);
        assert_eq!(port.read(200), UNKNOWN);
        assert!(!timebase.has_pending());
    }

    #[test]
    fn irq_status_read_acknowledges_and_wakes() {
        let (shared, clock, timebase) = port_fixture();
        let port = HostPort::new(&shared, &clock, &timebase, host_task());
        shared.publish(Snapshot { status: 0b1, ..Snapshot::default() });

        assert_eq!(port.read(Register::IrqStatus as u8), 0b1);
        assert!(timebase.has_pending());
        assert_eq!(shared.take_irq_ack(), Some(0b1));
        assert_eq!(shared.take_irq_ack(), None);
    }

    #[test]
    fn writes_are_queued_in_order() {
        let (shared, clock, timebase) = port_fixture();
        let port = HostPort::new(&shared, &clock, &timebase, host_task());
        port.write(Register::RtcTime as u8, 42);
        port.write(Register::Status as u8, 42);
        port.write(99, 42);
        port.write(Register::PowerOff as u8, 1);

        assert!(timebase.has_pending());
        assert_eq!(shared.pop_command(), Some(HostCommand::SetTime(42)));
        assert_eq!(shared.pop_command(), Some(HostCommand::Shutdown));
        assert_eq!(shared.pop_command(), None);
    }

    #[test]
    fn full_queue_drops_commands() {
        let shared = SharedRegisters::new();
        for _ in 0..COMMAND_QUEUE_LEN {
            assert!(shared.push_command(HostCommand::PowerOn));
        }
        assert!(!shared.push_command(HostCommand::Reboot));
    }
}
