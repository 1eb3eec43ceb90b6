use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::Duration;

use pmic_core::buzzer::{BuzzerTrait, PwmParams, pwm_params};
use rodio::{OutputStream, Sink, Source};

/// Clock of the emulated buzzer timer.
const TIMER_CLOCK_HZ: u32 = 8_000_000;
const SAMPLE_RATE: u32 = 48_000;
const AMPLITUDE: f32 = 0.15;

// Endless pulse wave shaped like the timer output
struct PulseWave {
    frequency: f32,
    duty: f32,
    current_sample: u64,
}

impl PulseWave {
    fn from_pwm(params: PwmParams) -> Self {
        let ticks = (params.prescaler + 1) as f32 * (params.period + 1) as f32;
        Self {
            frequency: TIMER_CLOCK_HZ as f32 / ticks,
            duty: params.duty as f32 / (params.period + 1) as f32,
            current_sample: 0,
        }
    }
}

impl Iterator for PulseWave {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let t = self.current_sample as f32 / SAMPLE_RATE as f32;
        let cycle_position = (t * self.frequency) % 1.0;
        self.current_sample += 1;

        if cycle_position < self.duty { Some(AMPLITUDE) } else { Some(-AMPLITUDE) }
    }
}

impl Source for PulseWave {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

enum Tone {
    Play(PwmParams),
    Stop,
}

/// Plays the buzzer on the sound card from a background thread.
pub struct DesktopBuzzer {
    tx: Sender<Tone>,
}

impl DesktopBuzzer {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        thread::spawn(move || buzzer_thread(rx));
        Self { tx }
    }
}

impl BuzzerTrait for DesktopBuzzer {
    fn play(&self, frequency_hz: u32, volume: u32) {
        let params = pwm_params(TIMER_CLOCK_HZ, frequency_hz, volume);
        log::debug!("Buzzer PWM: {:?}", params);
        let _ = self.tx.send(Tone::Play(params));
    }

    fn stop(&self) {
        let _ = self.tx.send(Tone::Stop);
    }
}

fn buzzer_thread(rx: Receiver<Tone>) {
    let Ok((_stream, handle)) = OutputStream::try_default() else {
        log::warn!("No audio output, buzzer is muted");
        return;
    };

    let mut sink: Option<Sink> = None;
    while let Ok(tone) = rx.recv() {
        if let Some(old) = sink.take() {
            old.stop();
        }
        if let Tone::Play(params) = tone {
            match Sink::try_new(&handle) {
                Ok(new) => {
                    new.append(PulseWave::from_pwm(params));
                    sink = Some(new);
                }
                Err(e) => log::warn!("Failed to start buzzer tone: {}", e),
            }
        }
    }
}
