//! Debounced digital input with long-press detection.
//!
//! Works for the power key and for the charger status line alike: the owner
//! feeds line levels into [`Button::update`] and routes the button's timer
//! tasks back through [`Button::handle_task`], which yields the event.

use crate::config::ButtonTimings;
use crate::scheduler::{Scheduler, SchedulerError, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ButtonEvent {
    Press,
    LongPress,
    Release,
    /// Release that ends a long press.
    LongRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonState {
    Released,
    Pressed,
    LongPressed,
}

pub struct Button {
    press_timer: TaskId,
    release_timer: TaskId,
    long_press_timer: TaskId,
    state: ButtonState,
    timings: ButtonTimings,
}

impl Button {
    pub fn new(sched: &mut Scheduler<'_>, timings: ButtonTimings) -> Result<Self, SchedulerError> {
        Ok(Self {
            press_timer: sched.register()?,
            release_timer: sched.register()?,
            long_press_timer: sched.register()?,
            state: ButtonState::Released,
            timings,
        })
    }

    pub fn is_pressed(&self) -> bool {
        self.state != ButtonState::Released
    }

    pub fn is_short_pressed(&self) -> bool {
        self.state == ButtonState::Pressed
    }

    pub fn is_long_pressed(&self) -> bool {
        self.state == ButtonState::LongPressed
    }

    pub fn is_released(&self) -> bool {
        self.state == ButtonState::Released
    }

    /// True if `id` is one of this button's timers.
    pub fn owns(&self, id: TaskId) -> bool {
        id == self.press_timer || id == self.release_timer || id == self.long_press_timer
    }

    /// Seeds the state at boot without emitting events.
    pub fn init_level(&mut self, pressed: bool) {
        self.state = if pressed { ButtonState::Pressed } else { ButtonState::Released };
    }

    /// Feeds a new line level. Press is reported on the next pass; release
    /// only once the line stayed released for the debounce time.
    pub fn update(&mut self, pressed: bool, sched: &mut Scheduler<'_>) {
        match (self.is_pressed(), pressed) {
            (true, false) => sched.set_timeout(self.release_timer, self.timings.debounce),
            // bounced back before the release settled
            (true, true) => sched.cancel(self.release_timer),
            (false, true) => {
                self.state = ButtonState::Pressed;
                sched.cancel(self.release_timer);
                sched.set_timeout(self.press_timer, 0);
                sched.set_timeout(self.long_press_timer, self.timings.long_press);
            }
            (false, false) => {}
        }
    }

    /// Runs one of the button timers and returns the resulting event.
    pub fn handle_task(&mut self, id: TaskId, sched: &mut Scheduler<'_>) -> Option<ButtonEvent> {
        if id == self.press_timer {
            Some(match self.state {
                ButtonState::LongPressed => ButtonEvent::LongPress,
                _ => ButtonEvent::Press,
            })
        } else if id == self.long_press_timer {
            self.state = ButtonState::LongPressed;
            Some(ButtonEvent::LongPress)
        } else if id == self.release_timer {
            let was_long = self.is_long_pressed();
            self.state = ButtonState::Released;
            sched.cancel(self.long_press_timer);
            Some(if was_long { ButtonEvent::LongRelease } else { ButtonEvent::Release })
        } else {
            None
        }
    }
}
