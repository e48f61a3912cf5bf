//! Deferred-free collector.
//!
//! Event callbacks frequently need to tear down the very object they were
//! invoked through — a connection closing itself from its own read
//! callback. Dropping it on the spot would free state the dispatch loop
//! is still touching, so instead the object is parked here and dropped at
//! a fixed point: once per reactor iteration, before the next poll wait.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
pub struct Collector {
    parked: RefCell<Vec<Rc<dyn Any>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `obj` until the next [`collect`](Self::collect). Scheduling
    /// the same object (by pointer identity) twice parks it once.
    pub fn schedule_retire(&self, obj: Rc<dyn Any>) {
        let mut parked = self.parked.borrow_mut();
        let ptr = Rc::as_ptr(&obj) as *const ();
        if parked.iter().any(|o| Rc::as_ptr(o) as *const () == ptr) {
            return;
        }
        parked.push(obj);
    }

    /// Drops every parked object. Runs once per reactor iteration; the
    /// collector's own drop performs a final sweep.
    pub fn collect(&self) {
        self.parked.borrow_mut().clear();
    }

    /// Objects currently awaiting collection.
    pub fn pending(&self) -> usize {
        self.parked.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Guard {
        drops: Rc<Cell<u32>>,
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn double_schedule_drops_once() {
        let drops = Rc::new(Cell::new(0));
        let guard: Rc<dyn Any> = Rc::new(Guard {
            drops: drops.clone(),
        });

        let collector = Collector::new();
        collector.schedule_retire(guard.clone());
        collector.schedule_retire(guard.clone());
        assert_eq!(collector.pending(), 1);

        drop(guard);
        assert_eq!(drops.get(), 0);

        collector.collect();
        assert_eq!(drops.get(), 1);
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn distinct_objects_collect_independently() {
        let drops = Rc::new(Cell::new(0));
        let collector = Collector::new();

        for _ in 0..3 {
            collector.schedule_retire(Rc::new(Guard {
                drops: drops.clone(),
            }));
        }
        assert_eq!(collector.pending(), 3);

        collector.collect();
        assert_eq!(drops.get(), 3);
    }

    #[test]
    fn dropping_the_collector_sweeps() {
        let drops = Rc::new(Cell::new(0));
        let collector = Collector::new();
        collector.schedule_retire(Rc::new(Guard {
            drops: drops.clone(),
        }));

        drop(collector);
        assert_eq!(drops.get(), 1);
    }
}
