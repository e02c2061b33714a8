use crate::dev::DevId;
use crate::machine::Machine;

pub type TimerFn = fn(&mut Machine, TimerId, DevId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u32);

#[derive(Clone, Copy)]
struct Timer {
    /// Absolute deadline in cycles. Meaningful only while armed.
    deadline: u64,
    /// Re-arm interval in cycles, 0 for one-shot.
    period: u64,
    armed: bool,
    dead: bool,
    cb: TimerFn,
    dev: DevId,
}

/// Virtual time for the whole machine. The CPU core consumes cycles as it
/// executes; devices arm timers against the same cycle counter, so device
/// behavior is a pure function of executed work and never of host time.
pub struct Timing {
    tsc: u64,
    hz: u64,
    timers: Vec<Timer>,
}

impl Timing {
    pub fn new(hz: u64) -> Timing {
        Timing {
            tsc: 0,
            hz,
            timers: Vec::new(),
        }
    }

    pub fn tsc(&self) -> u64 {
        self.tsc
    }

    pub fn hz(&self) -> u64 {
        self.hz
    }

    /// Accounts for `n` executed cycles.
    pub fn consume(&mut self, n: u64) {
        self.tsc += n;
    }

    pub fn add(&mut self, cb: TimerFn, dev: DevId) -> TimerId {
        self.timers.push(Timer {
            deadline: 0,
            period: 0,
            armed: false,
            dead: false,
            cb,
            dev,
        });
        TimerId((self.timers.len() - 1) as u32)
    }

    /// One-shot, `delta` cycles from now. Re-arming an armed timer moves it.
    pub fn arm(&mut self, id: TimerId, delta: u64) {
        let t = &mut self.timers[id.0 as usize];
        t.deadline = self.tsc + delta;
        t.period = 0;
        t.armed = true;
    }

    /// Fires every `period` cycles until disarmed. A period of 0 is treated
    /// as 1 so a misprogrammed device cannot wedge the due-timer loop.
    pub fn arm_periodic(&mut self, id: TimerId, period: u64) {
        let period = period.max(1);
        let t = &mut self.timers[id.0 as usize];
        t.deadline = self.tsc + period;
        t.period = period;
        t.armed = true;
    }

    pub fn disarm(&mut self, id: TimerId) {
        self.timers[id.0 as usize].armed = false;
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        let t = &self.timers[id.0 as usize];
        t.armed && !t.dead
    }

    pub fn remove(&mut self, id: TimerId) {
        let t = &mut self.timers[id.0 as usize];
        t.dead = true;
        t.armed = false;
    }

    pub fn remove_owned(&mut self, dev: DevId) {
        for t in self.timers.iter_mut() {
            if t.dev == dev && !t.dead {
                t.dead = true;
                t.armed = false;
            }
        }
    }

    /// Cycles until the nearest armed deadline, if any. Used to fast-forward
    /// a halted CPU.
    pub fn next_due_in(&self) -> Option<u64> {
        self.timers
            .iter()
            .filter(|t| t.armed && !t.dead)
            .map(|t| t.deadline.saturating_sub(self.tsc))
            .min()
    }

    pub fn skip_to_next_deadline(&mut self) {
        if let Some(d) = self.next_due_in() {
            self.tsc += d;
        }
    }

    /// Takes the most overdue timer, earliest deadline first so callbacks
    /// observe non-decreasing virtual time. Periodic timers are re-armed
    /// before the caller runs the callback.
    pub fn pop_due(&mut self) -> Option<(TimerId, TimerFn, DevId)> {
        let mut best: Option<usize> = None;
        for (i, t) in self.timers.iter().enumerate() {
            if !t.armed || t.dead || t.deadline > self.tsc {
                continue;
            }
            match best {
                Some(b) if self.timers[b].deadline <= t.deadline => {}
                _ => best = Some(i),
            }
        }
        let i = best?;
        let t = &mut self.timers[i];
        if t.period != 0 {
            t.deadline += t.period;
        } else {
            t.armed = false;
        }
        Some((TimerId(i as u32), t.cb, t.dev))
    }

    /// Changes the emulated clock rate. Pending deadlines keep their
    /// wall-time distance: the remaining cycles are rescaled by the ratio
    /// of the new and old rates.
    pub fn set_speed(&mut self, hz: u64) {
        if hz == 0 || hz == self.hz {
            return;
        }
        let old = self.hz;
        for t in self.timers.iter_mut() {
            if !t.armed || t.dead {
                continue;
            }
            let left = t.deadline.saturating_sub(self.tsc);
            t.deadline = self.tsc + left * hz / old;
            if t.period != 0 {
                t.period = (t.period * hz / old).max(1);
            }
        }
        self.hz = hz;
    }

    /// Converts a duration in microseconds to cycles at the current rate.
    pub fn usec_to_cycles(&self, usec: u64) -> u64 {
        (usec * self.hz / 1_000_000).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_cb(_: &mut Machine, _: TimerId, _: DevId) {}

    fn timing() -> Timing {
        Timing::new(1_000_000)
    }

    #[test]
    fn oneshot_fires_once_at_deadline() {
        let mut t = timing();
        let id = t.add(nop_cb, DevId::NONE);
        t.arm(id, 100);
        t.consume(99);
        assert!(t.pop_due().is_none());
        t.consume(1);
        let (fired, _, _) = t.pop_due().unwrap();
        assert_eq!(fired, id);
        assert!(t.pop_due().is_none());
        assert!(!t.is_armed(id));
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let mut t = timing();
        let late = t.add(nop_cb, DevId::NONE);
        let early = t.add(nop_cb, DevId::NONE);
        t.arm(late, 200);
        t.arm(early, 50);
        t.consume(500);
        assert_eq!(t.pop_due().unwrap().0, early);
        assert_eq!(t.pop_due().unwrap().0, late);
    }

    #[test]
    fn periodic_rearms_before_callback() {
        let mut t = timing();
        let id = t.add(nop_cb, DevId::NONE);
        t.arm_periodic(id, 100);
        t.consume(250);
        assert!(t.pop_due().is_some()); // deadline 100 -> 200
        assert!(t.pop_due().is_some()); // deadline 200 -> 300
        assert!(t.pop_due().is_none());
        assert!(t.is_armed(id));
    }

    #[test]
    fn speed_change_rescales_remaining_time() {
        let mut t = timing();
        let id = t.add(nop_cb, DevId::NONE);
        t.consume(100);
        t.arm(id, 1000);
        t.set_speed(2_000_000);
        // 1000 cycles left at 1 MHz becomes 2000 at 2 MHz
        t.consume(1999);
        assert!(t.pop_due().is_none());
        t.consume(1);
        assert!(t.pop_due().is_some());
    }

    #[test]
    fn halted_skip_lands_on_deadline() {
        let mut t = timing();
        let id = t.add(nop_cb, DevId::NONE);
        t.arm(id, 12345);
        t.skip_to_next_deadline();
        assert_eq!(t.tsc(), 12345);
        assert!(t.pop_due().is_some());
    }

    #[test]
    fn owner_sweep_kills_timers() {
        let mut t = timing();
        let dev = DevId::new_for_test(5);
        let id = t.add(nop_cb, dev);
        t.arm(id, 10);
        t.remove_owned(dev);
        t.consume(100);
        assert!(t.pop_due().is_none());
    }
}
