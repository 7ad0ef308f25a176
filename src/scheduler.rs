//! Repeating timers behind a small seam, so lock renewal and status polling
//! can be driven by `gloo-timers` in the browser and by hand in tests.

use std::cell::RefCell;
use std::rc::Rc;

/// Runs its teardown when dropped. Returned by timers and subscriptions.
pub struct CancelOnDrop {
    teardown: Option<Box<dyn FnOnce()>>,
}

impl CancelOnDrop {
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self { teardown: Some(Box::new(teardown)) }
    }

    /// Keeps `resource` alive until the handle is dropped.
    pub fn holding<T: 'static>(resource: T) -> Self {
        Self::new(move || drop(resource))
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

pub trait Scheduler {
    /// Call `tick` every `period_ms` until the returned handle is dropped.
    fn every(&self, period_ms: u32, tick: Box<dyn FnMut()>) -> CancelOnDrop;
}

/// `gloo_timers::callback::Interval`; dropping the handle clears the interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalScheduler;

impl Scheduler for IntervalScheduler {
    fn every(&self, period_ms: u32, mut tick: Box<dyn FnMut()>) -> CancelOnDrop {
        let interval = gloo_timers::callback::Interval::new(period_ms, move || tick());
        CancelOnDrop::holding(interval)
    }
}

type Timer = (u64, u32, Rc<RefCell<Box<dyn FnMut()>>>);

/// Timers that only fire when [`ManualScheduler::fire`] is called.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    timers: Rc<RefCell<Vec<Timer>>>,
    next_id: Rc<RefCell<u64>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Fire every live timer once. Timers registered during the pass wait for the next one.
    pub fn fire(&self) {
        let due: Vec<_> = self.timers.borrow().iter().map(|(_, _, tick)| tick.clone()).collect();
        for tick in due {
            (tick.borrow_mut())();
        }
    }

    pub fn periods(&self) -> Vec<u32> {
        self.timers.borrow().iter().map(|(_, period, _)| *period).collect()
    }
}

impl Scheduler for ManualScheduler {
    fn every(&self, period_ms: u32, tick: Box<dyn FnMut()>) -> CancelOnDrop {
        let id = {
            let mut next = self.next_id.borrow_mut();
            *next += 1;
            *next
        };
        self.timers.borrow_mut().push((id, period_ms, Rc::new(RefCell::new(tick))));
        let timers = self.timers.clone();
        CancelOnDrop::new(move || timers.borrow_mut().retain(|(timer, _, _)| *timer != id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn manual_timers_fire_until_dropped() {
        let scheduler = ManualScheduler::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let handle = scheduler.every(500, Box::new(move || counter.set(counter.get() + 1)));

        scheduler.fire();
        scheduler.fire();
        assert_eq!(count.get(), 2);
        assert_eq!(scheduler.periods(), vec![500]);

        drop(handle);
        scheduler.fire();
        assert_eq!(count.get(), 2);
        assert_eq!(scheduler.active(), 0);
    }

    #[test]
    fn cancel_on_drop_runs_teardown_once() {
        let ran = Rc::new(Cell::new(0));
        let flag = ran.clone();
        drop(CancelOnDrop::new(move || flag.set(flag.get() + 1)));
        assert_eq!(ran.get(), 1);
    }
}
