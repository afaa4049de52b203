//! Timeouts (timed events), the tick pipeline, and the calendar clock
//!
//! Armed timeouts form a single doubly-linked list sorted non-decreasing by
//! absolute expiry tick; entries with equal expiries keep their insertion
//! order. [`handle_tick`] pops and fires every expired entry, then programs
//! the port's alarm for the new head (or for the running task's round-robin
//! quantum, whichever is earlier).
//!
//! The calendar clock is a correspondence between the monotonic tick counter
//! and a (date, time, sub-second ticks) triple, calibrated by
//! [`System::time_set`]. Setting the clock never moves armed timeouts; they
//! are keyed to monotonic ticks only.
use crate::{
    cfg,
    error::KernelError,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    task,
    utils::Init,
    KernelTraits, Port, Result, System, Ticks,
};

/// Timeout callback function.
///
/// Called with CPU Lock active from the tick pipeline when the timeout
/// expires. The callback may wake up tasks; dispatching is taken care of by
/// the pipeline.
pub(crate) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// A timeout. Embedded in the control blocks that need one (TCBs for
/// blocking-call timeouts, timer blocks for the timer service).
pub(crate) struct Timeout<Traits: Port> {
    /// The absolute expiry tick.
    at: CpuLockCell<Traits, Ticks>,
    /// Whether this timeout is on the active list.
    linked: CpuLockCell<Traits, bool>,
    prev: CpuLockCell<Traits, Option<&'static Timeout<Traits>>>,
    next: CpuLockCell<Traits, Option<&'static Timeout<Traits>>>,
    callback: CpuLockCell<Traits, TimeoutFn<Traits>>,
    callback_param: CpuLockCell<Traits, usize>,
}

impl<Traits: Port> Init for Timeout<Traits> {
    const INIT: Self = Self {
        at: Init::INIT,
        linked: Init::INIT,
        prev: Init::INIT,
        next: Init::INIT,
        callback: CpuLockCell::new(|_, x| x),
        callback_param: Init::INIT,
    };
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Configure the timeout. It must not be linked.
    pub(crate) fn arm(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        at: Ticks,
        callback: TimeoutFn<Traits>,
        callback_param: usize,
    ) {
        debug_assert!(!self.linked.get(&*lock));
        self.at.replace(&mut *lock, at);
        self.callback.replace(&mut *lock, callback);
        self.callback_param.replace(&mut *lock, callback_param);
    }

    /// Advance the expiry by `period` (periodic re-arm). It must not be
    /// linked.
    pub(crate) fn adjust_expiration(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        period: Ticks,
    ) {
        debug_assert!(!self.linked.get(&*lock));
        let at = self.at.get(&*lock);
        self.at.replace(&mut *lock, at.wrapping_add(period));
    }

    pub(crate) fn at(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Ticks {
        self.at.get(&*lock)
    }

    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.linked.get(&*lock)
    }
}

/// Kernel-global state of the tick pipeline and the calendar clock.
pub(crate) struct TimeoutGlobals<Traits: Port> {
    /// The kernel's mirror of the port's tick counter, updated on each
    /// `handle_tick`.
    tick_count: CpuLockCell<Traits, Ticks>,

    /// Head of the active-timeout list, sorted non-decreasing by expiry.
    head: CpuLockCell<Traits, Option<&'static Timeout<Traits>>>,

    /// Suppresses redundant alarm reprogramming while `handle_tick` drains
    /// the list.
    handle_tick_in_progress: CpuLockCell<Traits, bool>,

    // Calendar epoch: the calendar instant bound to `epoch_tick`
    epoch_days: CpuLockCell<Traits, i64>,
    epoch_secs: CpuLockCell<Traits, u32>,
    epoch_subticks: CpuLockCell<Traits, Ticks>,
    epoch_tick: CpuLockCell<Traits, Ticks>,
}

impl<Traits: Port> Init for TimeoutGlobals<Traits> {
    const INIT: Self = Self {
        tick_count: Init::INIT,
        head: Init::INIT,
        handle_tick_in_progress: Init::INIT,
        epoch_days: Init::INIT,
        epoch_secs: Init::INIT,
        epoch_subticks: Init::INIT,
        epoch_tick: Init::INIT,
    };
}

impl<Traits: KernelTraits> TimeoutGlobals<Traits> {
    /// Initialize the timekeeping system at boot.
    pub(crate) fn init(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let now = Traits::tick_count();
        self.tick_count.replace(&mut *lock, now);
        self.epoch_tick.replace(&mut *lock, now);
        self.epoch_days
            .replace(&mut *lock, calendar::days_from_civil(2025, 1, 1));

        // Nothing is armed yet
        // Safety: CPU Lock active
        unsafe { Traits::clear_pending_tick() };
    }
}

// Timeout list management
// ---------------------------------------------------------------------------

/// Register a timeout. It is inserted after every entry with an expiry less
/// than or equal to its own, which keeps equal-expiry firing stable.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &'static Timeout<Traits>,
) {
    let g = &Traits::state().timeout;
    debug_assert!(!timeout.linked.get(&*lock), "timeout is already linked");

    let at = timeout.at.get(&*lock);
    let mut prev: Option<&'static Timeout<Traits>> = None;
    let mut cur = g.head.get(&*lock);
    while let Some(c) = cur {
        if c.at.get(&*lock) > at {
            break;
        }
        prev = Some(c);
        cur = c.next.get(&*lock);
    }

    timeout.prev.replace(&mut *lock, prev);
    timeout.next.replace(&mut *lock, cur);
    match prev {
        Some(p) => {
            p.next.replace(&mut *lock, Some(timeout));
        }
        None => {
            g.head.replace(&mut *lock, Some(timeout));
        }
    }
    if let Some(c) = cur {
        c.prev.replace(&mut *lock, Some(timeout));
    }
    timeout.linked.replace(&mut *lock, true);

    if !g.handle_tick_in_progress.get(&*lock) {
        pend_next_tick(lock);
    }
}

/// Unregister a timeout. Does nothing if it's not linked. Removing the list
/// head reprograms the alarm.
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    let g = &Traits::state().timeout;
    if !timeout.linked.get(&*lock) {
        return;
    }

    let prev = timeout.prev.get(&*lock);
    let next = timeout.next.get(&*lock);
    match prev {
        Some(p) => {
            p.next.replace(&mut *lock, next);
        }
        None => {
            g.head.replace(&mut *lock, next);
        }
    }
    if let Some(n) = next {
        n.prev.replace(&mut *lock, prev);
    }
    timeout.prev.replace(&mut *lock, None);
    timeout.next.replace(&mut *lock, None);
    timeout.linked.replace(&mut *lock, false);

    if !g.handle_tick_in_progress.get(&*lock) {
        pend_next_tick(lock);
    }
}

/// Program the port's alarm for the earliest of: the head timeout's expiry,
/// the running task's remaining round-robin quantum. Clears the alarm when
/// neither applies.
pub(crate) fn pend_next_tick<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let g = &Traits::state().timeout;
    let now = Traits::tick_count();

    let mut next = g.head.get(&*lock).map(|t| t.at.get(&*lock));

    if let Some(budget) = task::current_slice_budget::<Traits>(lock.borrow_mut()) {
        let slice_at = now.saturating_add(budget);
        next = Some(match next {
            Some(at) => at.min(slice_at),
            None => slice_at,
        });
    }

    // Safety: CPU Lock active
    match next {
        Some(at) => unsafe { Traits::pend_tick_at(at.max(now)) },
        None => unsafe { Traits::clear_pending_tick() },
    }
}

/// The tick pipeline: called by the port when the programmed alarm fires.
///
/// Precondition: CPU Lock inactive, outside task context.
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this can't fail
    let mut guard = klock::lock_cpu::<Traits>().unwrap();
    let g = &Traits::state().timeout;

    let now = Traits::tick_count();
    let prev_tick = g.tick_count.replace(&mut *guard, now);
    let elapsed = now.saturating_sub(prev_tick);

    g.handle_tick_in_progress.replace(&mut *guard, true);

    // Pop and fire every expired timeout, in list order. A periodic timer's
    // callback re-inserts its timeout; if it is still overdue it fires again
    // on a later iteration, catching up one period at a time.
    loop {
        let Some(timeout) = g.head.get(&*guard) else {
            break;
        };
        if timeout.at.get(&*guard) > now {
            break;
        }

        remove_timeout(guard.borrow_mut(), timeout);
        let callback = timeout.callback.get(&*guard);
        let callback_param = timeout.callback_param.get(&*guard);
        guard = callback(callback_param, guard);
    }

    g.handle_tick_in_progress.replace(&mut *guard, false);

    task::debit_time_slice::<Traits>(guard.borrow_mut(), elapsed);

    pend_next_tick(guard.borrow_mut());

    // Fired timeouts may have woken tasks. Check for dispatch and release
    // CPU Lock.
    task::unlock_cpu_and_check_preemption(guard);
}

// Calendar clock
// ---------------------------------------------------------------------------

/// A calendar instant.
///
/// `date` is packed `year << 16 | month << 8 | day`; `time` is packed
/// `hour << 16 | minute << 8 | second`; `ticks` is the sub-second tick count
/// in `0..`[`cfg::TICKS_PER_SEC`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimeOfDay {
    pub date: u32,
    pub time: u32,
    pub ticks: Ticks,
}

/// The current calendar instant derived from the epoch and elapsed ticks:
/// (days since civil epoch, second of day, sub-second ticks).
fn current_civil<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> (i64, u32, Ticks) {
    let g = &Traits::state().timeout;
    let now = Traits::tick_count();
    let elapsed = now - g.epoch_tick.get(&*lock);
    let total_sub = g.epoch_subticks.get(&*lock) + elapsed;
    let extra_secs = total_sub / cfg::TICKS_PER_SEC;
    let sub = total_sub % cfg::TICKS_PER_SEC;
    let total_secs = g.epoch_secs.get(&*lock) as u64 + extra_secs;
    let days = g.epoch_days.get(&*lock) + (total_secs / 86400) as i64;
    (days, (total_secs % 86400) as u32, sub)
}

/// Convert a calendar target into an absolute monotonic tick. A target not
/// in the future clamps to "now".
pub(crate) fn ticks_for_wall_clock<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    target: TimeOfDay,
) -> Result<Ticks> {
    let (year, month, day) = calendar::unpack_date(target.date)?;
    let (hour, minute, second) = calendar::unpack_time(target.time)?;
    if target.ticks >= cfg::TICKS_PER_SEC {
        return Err(KernelError::IllegalTicks);
    }

    let g = &Traits::state().timeout;
    let target_days = calendar::days_from_civil(year, month, day);
    let target_secs = hour * 3600 + minute * 60 + second;

    let delta_sub = ((target_days - g.epoch_days.get(&*lock)) as i128 * 86400
        + target_secs as i128
        - g.epoch_secs.get(&*lock) as i128)
        * cfg::TICKS_PER_SEC as i128
        + target.ticks as i128
        - g.epoch_subticks.get(&*lock) as i128;
    let target_tick = g.epoch_tick.get(&*lock) as i128 + delta_sub;

    let now = Traits::tick_count();
    if target_tick <= now as i128 {
        Ok(now)
    } else {
        Ok(target_tick as Ticks)
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Read the calendar clock.
    pub fn time_get() -> Result<TimeOfDay> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let (days, secs, sub) = current_civil::<Traits>(lock.borrow_mut());
        let (year, month, day) = calendar::civil_from_days(days);
        Ok(TimeOfDay {
            date: calendar::pack_date(year, month, day),
            time: calendar::pack_time(secs / 3600, secs % 3600 / 60, secs % 60),
            ticks: sub,
        })
    }

    /// Calibrate the calendar clock: bind the given instant to the current
    /// monotonic tick. Armed timers' monotonic expiries are unaffected.
    pub fn time_set(new_time: TimeOfDay) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let (year, month, day) = calendar::unpack_date(new_time.date)?;
        let (hour, minute, second) = calendar::unpack_time(new_time.time)?;
        if new_time.ticks >= cfg::TICKS_PER_SEC {
            return Err(KernelError::IllegalTicks);
        }

        let g = &Traits::state().timeout;
        g.epoch_days
            .replace(&mut *lock, calendar::days_from_civil(year, month, day));
        g.epoch_secs
            .replace(&mut *lock, hour * 3600 + minute * 60 + second);
        g.epoch_subticks.replace(&mut *lock, new_time.ticks);
        g.epoch_tick.replace(&mut *lock, Traits::tick_count());
        Ok(())
    }
}

pub(crate) mod calendar {
    //! Proleptic-Gregorian date arithmetic over a day count.
    use crate::{error::KernelError, Result};

    /// Days from the civil epoch (1970-01-01) to the given date.
    pub(crate) fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
        let y = if month <= 2 { year - 1 } else { year };
        let era = if y >= 0 { y } else { y - 399 } / 400;
        let yoe = (y - era * 400) as u64;
        let mp = (month + 9) % 12;
        let doy = (153 * mp + 2) / 5 + day - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy as u64;
        era * 146097 + doe as i64 - 719468
    }

    /// Inverse of [`days_from_civil`].
    pub(crate) fn civil_from_days(z: i64) -> (i64, u32, u32) {
        let z = z + 719468;
        let era = if z >= 0 { z } else { z - 146096 } / 146097;
        let doe = (z - era * 146097) as u64;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
        let y = yoe as i64 + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
        (if month <= 2 { y + 1 } else { y }, month, day)
    }

    fn is_leap(year: i64) -> bool {
        year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
    }

    fn days_in_month(year: i64, month: u32) -> u32 {
        match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 => {
                if is_leap(year) {
                    29
                } else {
                    28
                }
            }
            _ => 0,
        }
    }

    pub(crate) fn unpack_date(date: u32) -> Result<(i64, u32, u32)> {
        let year = (date >> 16) as i64;
        let month = (date >> 8) & 0xff;
        let day = date & 0xff;
        if month < 1 || month > 12 || day < 1 || day > days_in_month(year, month) {
            return Err(KernelError::BadParam);
        }
        Ok((year, month, day))
    }

    pub(crate) fn unpack_time(time: u32) -> Result<(u32, u32, u32)> {
        let hour = time >> 16;
        let minute = (time >> 8) & 0xff;
        let second = time & 0xff;
        if hour >= 24 || minute >= 60 || second >= 60 {
            return Err(KernelError::BadParam);
        }
        Ok((hour, minute, second))
    }

    pub(crate) fn pack_date(year: i64, month: u32, day: u32) -> u32 {
        ((year as u32) << 16) | (month << 8) | day
    }

    pub(crate) fn pack_time(hour: u32, minute: u32, second: u32) -> u32 {
        (hour << 16) | (minute << 8) | second
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn known_days() {
            assert_eq!(days_from_civil(1970, 1, 1), 0);
            assert_eq!(days_from_civil(1970, 1, 2), 1);
            assert_eq!(days_from_civil(1969, 12, 31), -1);
            assert_eq!(days_from_civil(2000, 3, 1), 11017);
            assert_eq!(days_from_civil(2025, 1, 1), 20089);
        }

        #[test]
        fn round_trip() {
            for z in (-1_000_000..1_000_000).step_by(997) {
                let (y, m, d) = civil_from_days(z);
                assert_eq!(days_from_civil(y, m, d), z, "z={z} -> {y}-{m}-{d}");
            }
        }

        #[test]
        fn month_boundaries() {
            assert_eq!(
                days_from_civil(2024, 3, 1) - days_from_civil(2024, 2, 29),
                1
            );
            assert_eq!(
                days_from_civil(2023, 3, 1) - days_from_civil(2023, 2, 28),
                1
            );
            assert_eq!(civil_from_days(days_from_civil(2024, 12, 31)), (2024, 12, 31));
        }

        #[test]
        fn packed_validation() {
            assert!(unpack_date(pack_date(2025, 1, 1)).is_ok());
            assert!(unpack_date(pack_date(2024, 2, 29)).is_ok());
            assert!(unpack_date(pack_date(2023, 2, 29)).is_err());
            assert!(unpack_date(pack_date(2025, 13, 1)).is_err());
            assert!(unpack_date(pack_date(2025, 0, 1)).is_err());
            assert!(unpack_date(pack_date(2025, 4, 31)).is_err());
            assert!(unpack_time(pack_time(23, 59, 59)).is_ok());
            assert!(unpack_time(pack_time(24, 0, 0)).is_err());
            assert!(unpack_time(pack_time(0, 60, 0)).is_err());
        }
    }
}
