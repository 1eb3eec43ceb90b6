#![cfg_attr(not(test), no_std)]

pub mod analog;
pub mod app;
pub mod board;
pub mod button;
pub mod buzzer;
pub mod config;
pub mod fmt;
pub mod i2c_slave;
pub mod registers;
pub mod rtc;
pub mod scheduler;
pub mod state;
