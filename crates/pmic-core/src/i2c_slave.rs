//! Slave side of the host register bus.
//!
//! Writes are `[addr, d0, d1, d2, d3]`, reads are `[addr]` followed by a
//! repeated start and four data bytes, all little-endian. Anything else is
//! dropped without telling the master.

use heapless::Vec;

/// Bus events as decoded by the peripheral interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    StartRead,
    StartWrite,
    Rx(u8),
    /// The master clocks out a byte; the handler returns it.
    Tx,
    Stop,
}

/// Register file seen by the bus. Called from interrupt context.
pub trait RegisterAccess {
    fn read(&self, addr: u8) -> u32;
    fn write(&self, addr: u8, value: u32);
}

const RX_CAPACITY: usize = 32;
const WRITE_LEN: usize = 5;

/// Byte sent for positions nothing was staged for.
pub const IDLE_BYTE: u8 = 0xFF;

#[derive(Debug, Default)]
pub struct I2cSlave {
    rx: Vec<u8, RX_CAPACITY>,
    tx: Option<[u8; 4]>,
    tx_n: usize,
    is_read: bool,
}

impl I2cSlave {
    pub const fn new() -> Self {
        Self {
            rx: Vec::new(),
            tx: None,
            tx_n: 0,
            is_read: false,
        }
    }

    /// Advances the transaction. Returns the byte to transmit for [`BusEvent::Tx`].
    pub fn handle_event<R: RegisterAccess + ?Sized>(&mut self, event: BusEvent, regs: &R) -> Option<u8> {
        match event {
            // a repeated start keeps the address byte
            BusEvent::StartRead | BusEvent::StartWrite => {
                self.is_read = event == BusEvent::StartRead;
                None
            }
            BusEvent::Rx(byte) => {
                // overflow is dropped
                let _ = self.rx.push(byte);
                None
            }
            BusEvent::Tx => {
                if self.is_read && self.tx_n == 0 && self.rx.len() == 1 {
                    self.tx = Some(regs.read(self.rx[0]).to_le_bytes());
                }
                let byte = self
                    .tx
                    .and_then(|staged| staged.get(self.tx_n).copied())
                    .unwrap_or(IDLE_BYTE);
                self.tx_n += 1;
                Some(byte)
            }
            BusEvent::Stop => {
                if self.rx.len() == WRITE_LEN {
                    let value = u32::from_le_bytes([self.rx[1], self.rx[2], self.rx[3], self.rx[4]]);
                    regs.write(self.rx[0], value);
                }
                self.reset();
                None
            }
        }
    }

    fn reset(&mut self) {
        self.rx.clear();
        self.tx = None;
        self.tx_n = 0;
    }
}
