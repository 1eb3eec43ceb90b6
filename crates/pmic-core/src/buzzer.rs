// Platform-agnostic buzzer trait
pub trait BuzzerTrait: Send {
    /// Starts (or retunes) a continuous tone. `volume` is the PWM duty in percent.
    fn play(&self, frequency_hz: u32, volume: u32);
    fn stop(&self);
}

/// Timer setup producing a tone on a PWM channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmParams {
    pub prescaler: u32,
    pub period: u32,
    pub duty: u32,
}

pub const MIN_FREQUENCY_HZ: u32 = 20;
pub const MAX_FREQUENCY_HZ: u32 = 20_000;

/// Picks the smallest prescaler that fits the period into a 16-bit timer.
/// Full volume is a 50 % duty square wave.
pub fn pwm_params(timer_clock_hz: u32, frequency_hz: u32, volume: u32) -> PwmParams {
    let freq = frequency_hz.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ);
    let volume = volume.min(100);

    let mut psc = 0;
    let period = loop {
        psc += 1;
        let apr = timer_clock_hz / (psc * freq);
        if apr < 0xFFFF {
            break apr;
        }
    };

    let duty = if volume > 0 { ((period / 2) * volume / 100).max(1) } else { 1 };

    PwmParams {
        prescaler: psc - 1,
        period: period.saturating_sub(1),
        duty,
    }
}
