//! Time counter services
//!
//! A 64-bit monotonic time counter composed from a (possibly narrower) hardware counter supplied by
//! the platform, plus the `Stall`, `GetNextMonotonicCount` and `SetWatchdogTimer` boot services that
//! are built on it.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use r_efi::efi;

use crate::{interrupts, tpl_lock::TplMutex};

/// Platform hardware counter behind the 64-bit time counter.
///
/// The counter must count up monotonically at a fixed frequency and wrap at `2^width_bits()`. The
/// core observes the counter's high bit to extend it to 64 bits, so the counter must be read at
/// least once per half-rollover period for the extension to be lossless.
pub trait HardwareTick {
    /// Reads the current raw counter value. Bits at or above `width_bits()` are ignored.
    fn read(&self) -> u64;

    /// The width of the hardware counter in bits (1 to 64).
    fn width_bits(&self) -> u32;

    /// The rate at which the counter advances, in ticks per second.
    fn frequency(&self) -> u64;
}

struct TimeCounter {
    source: Option<Box<dyn HardwareTick + Send>>,
    // counts of full hardware counter periods observed so far.
    rollovers: u64,
    last_read: u64,
}

impl TimeCounter {
    const fn new() -> Self {
        Self { source: None, rollovers: 0, last_read: 0 }
    }

    // Reads the hardware counter and folds rollovers into the 64-bit value. Interrupts are masked for
    // the read so that an interrupt handler on the same processor cannot observe (and fold) a rollover
    // between our raw read and our state update.
    fn read(&mut self) -> Option<u64> {
        let source = self.source.as_ref()?;
        let width = source.width_bits().min(64);

        let was_enabled = interrupts::interrupts_enabled();
        interrupts::disable_interrupts();

        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        let raw = source.read() & mask;
        let high_bit = 1u64 << (width - 1);
        if (self.last_read & high_bit) != 0 && (raw & high_bit) == 0 {
            self.rollovers = self.rollovers.wrapping_add(1);
        }
        self.last_read = raw;

        if was_enabled {
            interrupts::enable_interrupts();
        }

        if width >= 64 {
            Some(raw)
        } else {
            Some((self.rollovers << width) | raw)
        }
    }

    fn frequency(&self) -> Option<u64> {
        self.source.as_ref().map(|x| x.frequency())
    }
}

static TIME_COUNTER: TplMutex<TimeCounter> =
    TplMutex::new(efi::TPL_HIGH_LEVEL, TimeCounter::new(), "TimeCounterLock");

static NEXT_MONOTONIC_COUNT: AtomicU64 = AtomicU64::new(0);

static WATCHDOG_SECONDS: AtomicUsize = AtomicUsize::new(0);
static WATCHDOG_CODE: AtomicU64 = AtomicU64::new(0);

/// Registers the platform hardware counter that backs the time counter.
///
/// Replaces any previously registered source and resets the rollover state.
pub fn register_tick_source(source: Box<dyn HardwareTick + Send>) {
    let mut counter = TIME_COUNTER.lock();
    counter.rollovers = 0;
    counter.last_read = 0;
    counter.source = Some(source);
}

#[cfg(test)]
pub(crate) fn clear_tick_source() {
    let mut counter = TIME_COUNTER.lock();
    counter.source = None;
    counter.rollovers = 0;
    counter.last_read = 0;
}

/// Returns the current 64-bit time counter value, or None if no tick source is registered.
pub fn read_time_counter() -> Option<u64> {
    TIME_COUNTER.lock().read()
}

/// Returns the time counter frequency in ticks per second, or None if no tick source is registered.
pub fn time_counter_frequency() -> Option<u64> {
    TIME_COUNTER.lock().frequency()
}

// Stalls execution on the processor for at least the requested number of microseconds by polling the
// time counter. Execution is not yielded for the duration of the stall.
extern "efiapi" fn stall(microseconds: usize) -> efi::Status {
    let (start, frequency) = {
        let mut counter = TIME_COUNTER.lock();
        match (counter.read(), counter.frequency()) {
            (Some(start), Some(frequency)) => (start, frequency),
            _ => return efi::Status::NOT_READY,
        }
    };

    let ticks = ((microseconds as u128) * (frequency as u128) / 1_000_000) as u64;

    loop {
        let now = match TIME_COUNTER.lock().read() {
            Some(now) => now,
            None => return efi::Status::NOT_READY,
        };
        if now.wrapping_sub(start) >= ticks {
            break;
        }
        // fire timers that come due while we spin; the tick interrupt cannot preempt a stall
        // issued above its TPL.
        crate::events::timer_tick();
        core::hint::spin_loop();
    }

    efi::Status::SUCCESS
}

extern "efiapi" fn get_next_monotonic_count(count: *mut u64) -> efi::Status {
    if count.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    // Safety: caller must ensure that count is a valid pointer. It is null-checked above.
    unsafe { count.write_unaligned(NEXT_MONOTONIC_COUNT.fetch_add(1, Ordering::SeqCst)) };
    efi::Status::SUCCESS
}

// Stores the watchdog deadline for the platform's expiry handler to act on. A timeout of zero
// disarms the watchdog; ExitBootServices disarms it as well.
extern "efiapi" fn set_watchdog_timer(
    timeout: usize,
    watchdog_code: u64,
    _data_size: usize,
    _data: *mut efi::Char16,
) -> efi::Status {
    WATCHDOG_SECONDS.store(timeout, Ordering::SeqCst);
    WATCHDOG_CODE.store(watchdog_code, Ordering::SeqCst);
    if timeout == 0 {
        log::info!("watchdog disarmed");
    } else {
        log::info!("watchdog armed: {timeout}s, code {watchdog_code:#x}");
    }
    efi::Status::SUCCESS
}

/// Returns the active watchdog setting as (seconds, code); seconds of zero means disarmed.
pub fn watchdog_state() -> (usize, u64) {
    (WATCHDOG_SECONDS.load(Ordering::SeqCst), WATCHDOG_CODE.load(Ordering::SeqCst))
}

/// Disarms the watchdog. Invoked on successful ExitBootServices.
pub fn disarm_watchdog() {
    WATCHDOG_SECONDS.store(0, Ordering::SeqCst);
    WATCHDOG_CODE.store(0, Ordering::SeqCst);
}

pub fn init_timer_support(bs: &mut efi::BootServices) {
    bs.stall = stall;
    bs.get_next_monotonic_count = get_next_monotonic_count;
    bs.set_watchdog_timer = set_watchdog_timer;
}
