//! Cooperative run-to-completion scheduler.
//!
//! Tasks live in a fixed arena and are chained into one doubly linked list in
//! arming order. Each [`Scheduler::run_pass`] walks the list once, runs every
//! due task and then parks the CPU until the earliest deadline.
//!
//! Interrupt handlers never touch the list. They only use the [`Timebase`]:
//! the tick interrupt advances the millisecond clock and peripheral handlers
//! call [`Timebase::wake`], which arms the task with a zero delay at the start
//! of the next pass.

use core::cell::Cell;
use core::fmt;

use critical_section::Mutex;

/// Size of the task arena.
pub const MAX_TASKS: usize = 16;

/// Handle to a task slot, stable for the lifetime of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId(u8);

impl TaskId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerError {
    /// All [`MAX_TASKS`] slots are taken.
    Exhausted,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Exhausted => write!(f, "task arena exhausted ({} slots)", MAX_TASKS),
        }
    }
}

/// Millisecond clock and wake requests shared with interrupt context.
pub struct Timebase {
    ticks: Mutex<Cell<i64>>,
    pending: Mutex<Cell<u32>>,
}

impl Timebase {
    pub const fn new() -> Self {
        Self {
            ticks: Mutex::new(Cell::new(0)),
            pending: Mutex::new(Cell::new(0)),
        }
    }

    /// Called from the 1 ms tick interrupt.
    pub fn tick(&self) {
        self.advance(1);
    }

    /// Accounts for time spent with the tick stopped.
    pub fn advance(&self, ms: u32) {
        critical_section::with(|cs| {
            let ticks = self.ticks.borrow(cs);
            ticks.set(ticks.get() + ms as i64);
        });
    }

    pub fn now_ms(&self) -> i64 {
        critical_section::with(|cs| self.ticks.borrow(cs).get())
    }

    /// Requests `id` to run on the next pass. Safe from any context.
    pub fn wake(&self, id: TaskId) {
        critical_section::with(|cs| {
            let pending = self.pending.borrow(cs);
            pending.set(pending.get() | 1 << id.0);
        });
    }

    pub fn has_pending(&self) -> bool {
        critical_section::with(|cs| self.pending.borrow(cs).get() != 0)
    }

    fn take_pending(&self) -> u32 {
        critical_section::with(|cs| self.pending.borrow(cs).replace(0))
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives task executions. `sched` may be used to arm or cancel any task,
/// including the one currently running; changes apply from the next pass.
pub trait TaskHandler {
    fn run_task(&mut self, id: TaskId, sched: &mut Scheduler<'_>);

    /// Called when no task is armed. Returning `true` means the handler
    /// changed the system state (e.g. slept deeply and re-armed its tasks)
    /// and the pass should restart instead of idling.
    fn on_idle(&mut self, _sched: &mut Scheduler<'_>) -> bool {
        false
    }
}

/// Low-power waiting primitives of the platform.
pub trait IdleTimer {
    /// Longest wait the hardware timer can be programmed for.
    fn max_idle_ms(&self) -> u32;

    /// Halts until the next interrupt; the tick interrupt keeps counting.
    fn wait_for_interrupt(&mut self);

    /// Stops the tick, programs the timer to fire after `ms` and halts.
    /// Returns the milliseconds that actually elapsed, which is less than
    /// `ms` when another interrupt woke the CPU first.
    fn sleep_for(&mut self, ms: u32) -> u32;
}

/// What a pass ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// The list changed; another pass follows immediately.
    Busy,
    /// Next deadline was one tick away, waited for a single interrupt.
    Napped,
    /// Slept with the tick stopped for the given milliseconds.
    Slept(u32),
    /// The idle hook took over (deep sleep) and the pass restarts.
    Suspended,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    registered: bool,
    armed: bool,
    repeat: bool,
    interval: u32,
    due: i64,
    /// Pass number in which the task was last linked.
    epoch: u32,
    /// Bumped on every link/unlink, lets `exec` see re-arming by the callback.
    generation: u32,
    prev: Option<TaskId>,
    next: Option<TaskId>,
}

const EMPTY_SLOT: Slot = Slot {
    registered: false,
    armed: false,
    repeat: false,
    interval: 0,
    due: 0,
    epoch: 0,
    generation: 0,
    prev: None,
    next: None,
};

pub struct Scheduler<'t> {
    timebase: &'t Timebase,
    slots: [Slot; MAX_TASKS],
    registered: usize,
    head: Option<TaskId>,
    tail: Option<TaskId>,
    changed: u32,
    pass: u32,
}

impl<'t> Scheduler<'t> {
    pub fn new(timebase: &'t Timebase) -> Self {
        Self {
            timebase,
            slots: [EMPTY_SLOT; MAX_TASKS],
            registered: 0,
            head: None,
            tail: None,
            changed: 0,
            pass: 0,
        }
    }

    /// Reserves a task slot. Slots are never released.
    pub fn register(&mut self) -> Result<TaskId, SchedulerError> {
        if self.registered == MAX_TASKS {
            return Err(SchedulerError::Exhausted);
        }
        let id = TaskId(self.registered as u8);
        self.slots[id.index()].registered = true;
        self.registered += 1;
        Ok(id)
    }

    pub fn timebase(&self) -> &'t Timebase {
        self.timebase
    }

    pub fn now_ms(&self) -> i64 {
        self.timebase.now_ms()
    }

    pub fn set_timeout(&mut self, id: TaskId, ms: u32) {
        self.arm(id, ms, false);
    }

    pub fn set_interval(&mut self, id: TaskId, ms: u32) {
        self.arm(id, ms, true);
    }

    /// Schedules `id` at `now + ms`, discarding any previous schedule.
    pub fn arm(&mut self, id: TaskId, ms: u32, repeat: bool) {
        debug_assert!(self.slots[id.index()].registered, "arming unregistered task");
        self.cancel(id);
        let due = self.now_ms() + ms as i64;
        self.link_tail(id, due, repeat, ms);
    }

    /// Removes `id` from the list. No-op for an unarmed task.
    pub fn cancel(&mut self, id: TaskId) {
        if !self.slots[id.index()].armed {
            return;
        }
        self.unlink(id);
    }

    pub fn is_armed(&self, id: TaskId) -> bool {
        self.slots[id.index()].armed
    }

    /// Due time of an armed task.
    pub fn due(&self, id: TaskId) -> Option<i64> {
        let slot = &self.slots[id.index()];
        slot.armed.then_some(slot.due)
    }

    /// True when nothing is armed.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Armed tasks in execution order.
    pub fn armed(&self) -> ArmedTasks<'_, 't> {
        ArmedTasks {
            sched: self,
            cursor: self.head,
        }
    }

    /// Runs one pass: executes due tasks in list order, then idles until the
    /// next deadline unless the list changed meanwhile.
    pub fn run_pass<H, T>(&mut self, handler: &mut H, timer: &mut T) -> Pass
    where
        H: TaskHandler + ?Sized,
        T: IdleTimer + ?Sized,
    {
        self.arm_woken();
        self.pass = self.pass.wrapping_add(1);

        let max_idle = timer.max_idle_ms();
        let mut next_run = self.now_ms() + max_idle as i64;
        let changed_before = self.changed;

        let mut cursor = self.head;
        while let Some(id) = cursor {
            let next = self.slots[id.index()].next;
            let slot = self.slots[id.index()];
            if slot.armed && slot.epoch != self.pass && self.now_ms() >= slot.due {
                self.exec(id, handler);
            }
            let slot = &self.slots[id.index()];
            if slot.armed {
                next_run = next_run.min(slot.due);
            }
            cursor = next;
        }

        if self.changed != changed_before || self.timebase.has_pending() {
            return Pass::Busy;
        }

        if self.is_empty() && handler.on_idle(self) {
            return Pass::Suspended;
        }

        let idle = next_run - self.now_ms();
        if idle == 1 {
            timer.wait_for_interrupt();
            Pass::Napped
        } else if idle > 1 {
            let ms = idle.min(max_idle as i64) as u32;
            let elapsed = timer.sleep_for(ms);
            self.timebase.advance(elapsed);
            Pass::Slept(elapsed)
        } else {
            Pass::Busy
        }
    }

    /// Runs passes forever.
    pub fn run<H, T>(&mut self, handler: &mut H, timer: &mut T) -> !
    where
        H: TaskHandler + ?Sized,
        T: IdleTimer + ?Sized,
    {
        loop {
            self.run_pass(handler, timer);
        }
    }

    fn exec<H: TaskHandler + ?Sized>(&mut self, id: TaskId, handler: &mut H) {
        let slot = self.slots[id.index()];
        if !slot.repeat {
            self.unlink(id);
            handler.run_task(id, self);
            return;
        }

        handler.run_task(id, self);

        let after = self.slots[id.index()];
        if !after.armed || after.generation != slot.generation {
            // cancelled or re-armed by its own callback
            return;
        }

        // Stay on the t0 + k*interval grid, skipping periods already missed.
        let interval = slot.interval as i64;
        let now = self.now_ms();
        let mut due = slot.due + interval;
        if interval == 0 {
            due = now;
        } else if due < now {
            due += (now - due + interval - 1) / interval * interval;
        }
        self.unlink(id);
        self.link_tail(id, due, true, slot.interval);
    }

    fn arm_woken(&mut self) {
        let mut pending = self.timebase.take_pending();
        while pending != 0 {
            let index = pending.trailing_zeros() as usize;
            pending &= pending - 1;
            if index < MAX_TASKS && self.slots[index].registered {
                self.set_timeout(TaskId(index as u8), 0);
            }
        }
    }

    fn link_tail(&mut self, id: TaskId, due: i64, repeat: bool, interval: u32) {
        let tail = self.tail;
        let slot = &mut self.slots[id.index()];
        slot.due = due;
        slot.repeat = repeat;
        slot.interval = interval;
        slot.epoch = self.pass;
        slot.generation = slot.generation.wrapping_add(1);
        slot.armed = true;
        slot.prev = tail;
        slot.next = None;

        match tail {
            Some(tail) => self.slots[tail.index()].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.changed = self.changed.wrapping_add(1);
    }

    fn unlink(&mut self, id: TaskId) {
        let Slot { prev, next, .. } = self.slots[id.index()];

        match prev {
            Some(prev) => self.slots[prev.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next.index()].prev = prev,
            None => self.tail = prev,
        }

        let slot = &mut self.slots[id.index()];
        slot.prev = None;
        slot.next = None;
        slot.armed = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.changed = self.changed.wrapping_add(1);
    }
}

pub struct ArmedTasks<'s, 't> {
    sched: &'s Scheduler<'t>,
    cursor: Option<TaskId>,
}

impl Iterator for ArmedTasks<'_, '_> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let id = self.cursor?;
        self.cursor = self.sched.slots[id.index()].next;
        Some(id)
    }
}
