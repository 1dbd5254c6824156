//! Core event, TPL, and timer dispatch services
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{
    ffi::c_void,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use r_efi::efi;

use crate::{
    event_db::{SpinLockedEventDb, TimerDelay},
    interrupts,
};

pub static EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

static CURRENT_TPL: AtomicUsize = AtomicUsize::new(efi::TPL_APPLICATION);

// Whether interrupts were enabled when the TPL last crossed up into TPL_HIGH_LEVEL. Leaving
// TPL_HIGH_LEVEL restores this state rather than unconditionally enabling, so a caller that
// masked interrupts before raising gets its mask back on the matching restore.
static INTERRUPT_STATE_AT_RAISE: AtomicBool = AtomicBool::new(true);

static SYSTEM_TIME: AtomicU64 = AtomicU64::new(0);

/// Event group signaled once per polling turnaround in WaitForEvent.
pub const EVENT_GROUP_IDLE_LOOP: efi::Guid =
    efi::Guid::from_fields(0x3c8d294c, 0x5fc3, 0x4451, 0xbb, 0x31, &[0xc4, 0xc0, 0x32, 0x29, 0x5e, 0x6c]);

/// Event group signaled when ExitBootServices fails after the before-exit notifications ran.
pub const EVENT_GROUP_EXIT_BOOT_SERVICES_FAILED: efi::Guid =
    efi::Guid::from_fields(0x4f6c5507, 0x232f, 0x4787, 0xb9, 0x5e, &[0x72, 0xf8, 0x62, 0x49, 0x0c, 0xb1]);

extern "efiapi" fn create_event(
    event_type: u32,
    notify_tpl: efi::Tpl,
    notify_function: Option<efi::EventNotify>,
    notify_context: *mut c_void,
    event: *mut efi::Event,
) -> efi::Status {
    if event.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    let notify_context = if !notify_context.is_null() { Some(notify_context) } else { None };

    //the legacy type bits alias the corresponding event groups.
    let (event_type, event_group) = match event_type {
        efi::EVT_SIGNAL_EXIT_BOOT_SERVICES => (efi::EVT_NOTIFY_SIGNAL, Some(efi::EVENT_GROUP_EXIT_BOOT_SERVICES)),
        efi::EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE => {
            (efi::EVT_NOTIFY_SIGNAL, Some(efi::EVENT_GROUP_VIRTUAL_ADDRESS_CHANGE))
        }
        other => (other, None),
    };

    match EVENT_DB.create_event(event_type, notify_tpl, notify_function, notify_context, event_group) {
        Ok(new_event) => {
            unsafe { *event = new_event };
            efi::Status::SUCCESS
        }
        Err(err) => err.into(),
    }
}

extern "efiapi" fn create_event_ex(
    event_type: u32,
    notify_tpl: efi::Tpl,
    notify_function: Option<efi::EventNotify>,
    notify_context: *const c_void,
    event_group: *const efi::Guid,
    event: *mut efi::Event,
) -> efi::Status {
    if event.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    let notify_context = if !notify_context.is_null() { Some(notify_context as *mut c_void) } else { None };

    match event_type {
        efi::EVT_SIGNAL_EXIT_BOOT_SERVICES | efi::EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE => {
            return efi::Status::INVALID_PARAMETER;
        }
        _ => (),
    }

    let event_group = if !event_group.is_null() { Some(unsafe { *event_group }) } else { None };

    match EVENT_DB.create_event(event_type, notify_tpl, notify_function, notify_context, event_group) {
        Ok(new_event) => {
            unsafe { *event = new_event };
            efi::Status::SUCCESS
        }
        Err(err) => err.into(),
    }
}

pub extern "efiapi" fn close_event(event: efi::Event) -> efi::Status {
    match EVENT_DB.close_event(event) {
        Ok(()) => efi::Status::SUCCESS,
        Err(err) => err.into(),
    }
}

pub extern "efiapi" fn signal_event(event: efi::Event) -> efi::Status {
    let status = match EVENT_DB.signal_event(event) {
        Ok(()) => efi::Status::SUCCESS,
        Err(err) => err.into(),
    };

    //Note: the C reference implementation of SignalEvent gets an immediate dispatch of
    //pending events as a side effect of the locking implementation calling raise/restore
    //TPL. The spec doesn't require this; but it's likely that code out there depends
    //on it. So emulate that here with an artificial raise/restore.
    let old_tpl = raise_tpl(efi::TPL_HIGH_LEVEL);
    restore_tpl(old_tpl);

    status
}

extern "efiapi" fn wait_for_event(
    number_of_events: usize,
    event_array: *mut efi::Event,
    out_index: *mut usize,
) -> efi::Status {
    if number_of_events == 0 || event_array.is_null() || out_index.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    if CURRENT_TPL.load(Ordering::SeqCst) != efi::TPL_APPLICATION {
        return efi::Status::UNSUPPORTED;
    }

    //get the events list as a slice
    let event_list = unsafe { core::slice::from_raw_parts(event_array, number_of_events) };

    //spin on the list
    loop {
        for (index, event) in event_list.iter().enumerate() {
            match check_event(*event) {
                efi::Status::NOT_READY => (),
                status => {
                    unsafe { *out_index = index };
                    return status;
                }
            }
        }

        //nothing ready this turnaround; give idle-loop listeners a chance to run.
        EVENT_DB.signal_group(EVENT_GROUP_IDLE_LOOP);
        let old_tpl = raise_tpl(efi::TPL_HIGH_LEVEL);
        restore_tpl(old_tpl);
    }
}

pub extern "efiapi" fn check_event(event: efi::Event) -> efi::Status {
    let event_type = match EVENT_DB.get_event_type(event) {
        Ok(event_type) => event_type,
        Err(err) => return err.into(),
    };

    if event_type.is_notify_signal() {
        return efi::Status::INVALID_PARAMETER;
    }

    match EVENT_DB.read_and_clear_signaled(event) {
        Ok(signaled) => {
            if signaled {
                return efi::Status::SUCCESS;
            }
        }
        Err(err) => return err.into(),
    }

    match EVENT_DB.queue_event_notify(event) {
        Ok(()) => (),
        Err(err) => return err.into(),
    }

    // raise/restore TPL to allow notifies to occur at the appropriate level.
    let old_tpl = raise_tpl(efi::TPL_HIGH_LEVEL);
    restore_tpl(old_tpl);

    match EVENT_DB.read_and_clear_signaled(event) {
        Ok(signaled) => {
            if signaled {
                return efi::Status::SUCCESS;
            }
        }
        Err(err) => return err.into(),
    }

    efi::Status::NOT_READY
}

/// Number of 100ns intervals in one second; SetTimer trigger times arrive in these units.
const HUNDRED_NS_PER_SECOND: u64 = 10_000_000;

// Converts a SetTimer duration in 100ns units into ticks of the time counter the timer queue
// runs on. Without a registered tick source the queue unit defaults to 100ns.
fn ticks_from_100ns(duration: u64) -> u64 {
    let frequency = crate::timer::time_counter_frequency().unwrap_or(HUNDRED_NS_PER_SECOND);
    ((duration as u128 * frequency as u128) / HUNDRED_NS_PER_SECOND as u128) as u64
}

// Current position of the timer queue clock: the time counter when one is registered, otherwise
// the last value system time reached.
fn current_system_time() -> u64 {
    match crate::timer::read_time_counter() {
        Some(now) => {
            SYSTEM_TIME.store(now, Ordering::SeqCst);
            now
        }
        None => SYSTEM_TIME.load(Ordering::SeqCst),
    }
}

pub extern "efiapi" fn set_timer(event: efi::Event, timer_type: efi::TimerDelay, trigger_time: u64) -> efi::Status {
    let timer_type = match TimerDelay::try_from(timer_type) {
        Err(err) => return err,
        Ok(timer_type) => timer_type,
    };

    let (trigger_time, period) = match timer_type {
        TimerDelay::Cancel => (None, None),
        TimerDelay::Relative => (Some(current_system_time() + ticks_from_100ns(trigger_time)), None),
        TimerDelay::Periodic => {
            // a sub-tick period still has to make forward progress on every tick.
            let period = ticks_from_100ns(trigger_time).max(1);
            (Some(current_system_time() + period), Some(period))
        }
    };

    match EVENT_DB.set_timer(event, timer_type, trigger_time, period) {
        Ok(()) => efi::Status::SUCCESS,
        Err(err) => err.into(),
    }
}

pub extern "efiapi" fn raise_tpl(new_tpl: efi::Tpl) -> efi::Tpl {
    assert!(new_tpl <= efi::TPL_HIGH_LEVEL, "Invalid attempt to raise TPL above TPL_HIGH_LEVEL");

    let prev_tpl = CURRENT_TPL.fetch_max(new_tpl, Ordering::SeqCst);

    assert!(
        new_tpl >= prev_tpl,
        "Invalid attempt to raise TPL to lower value. New TPL: {:#x?}, Prev TPL: {:#x?}",
        new_tpl,
        prev_tpl
    );

    if (new_tpl == efi::TPL_HIGH_LEVEL) && (prev_tpl < efi::TPL_HIGH_LEVEL) {
        INTERRUPT_STATE_AT_RAISE.store(interrupts::interrupts_enabled(), Ordering::SeqCst);
        interrupts::disable_interrupts();
    }
    prev_tpl
}

pub extern "efiapi" fn restore_tpl(new_tpl: efi::Tpl) {
    let prev_tpl = CURRENT_TPL.fetch_min(new_tpl, Ordering::SeqCst);

    assert!(
        new_tpl <= prev_tpl,
        "Invalid attempt to restore TPL to higher value. New TPL: {:#x?}, Prev TPL: {:#x?}",
        new_tpl,
        prev_tpl
    );

    if new_tpl < prev_tpl {
        // loop over any pending event notifications. Note: more notifications can be queued in the course of servicing
        // the current set of notifies; this will continue looping as long as there are any pending notifications, even
        // if they were queued after the loop started.
        loop {
            // Care must be taken to deal with reentrant "restore_tpl" cases. For example, the consume_next_event_notify
            // call requires taking the lock on EVENT_DB to retrieve the next notification. The release of that lock will
            // call restore_tpl. To avoid infinite recursion, this logic uses EVENT_NOTIFIES_IN_PROGRESS as a flag to
            // avoid reentrancy in the specific case that the lock is being taken for the purpose of acquiring event
            // notifies.
            static EVENT_NOTIFIES_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
            let event =
                match EVENT_NOTIFIES_IN_PROGRESS.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed) {
                    Ok(_) => {
                        let result = EVENT_DB.consume_next_event_notify(new_tpl);
                        EVENT_NOTIFIES_IN_PROGRESS.store(false, Ordering::Release);
                        result
                    }
                    _ => break, /* reentrant restore_tpl case */
                };

            let Some(event) = event else {
                break; /* no pending events */
            };
            if event.notify_tpl < efi::TPL_HIGH_LEVEL {
                if INTERRUPT_STATE_AT_RAISE.load(Ordering::SeqCst) {
                    interrupts::enable_interrupts();
                }
            } else {
                interrupts::disable_interrupts();
            }
            CURRENT_TPL.store(event.notify_tpl, Ordering::SeqCst);
            let notify_context = event.notify_context.unwrap_or(core::ptr::null_mut());

            if let Ok(event_type) = EVENT_DB.get_event_type(event.event) {
                if event_type.is_notify_signal() {
                    let _ = EVENT_DB.clear_signal(event.event);
                }
            }

            //Caution: this is calling a function pointer supplied by code outside the core.
            //The notify_function is not "unsafe" per the signature, even though it's
            //supplied by external code; marking it 'unsafe' would force every event
            //callback in Rust modules running under the core to be "unsafe", and the r_efi
            //definition for EventNotify would need to change.
            if let Some(notify_function) = event.notify_function {
                (notify_function)(event.event, notify_context);
            }
        }
    }

    if new_tpl < efi::TPL_HIGH_LEVEL && INTERRUPT_STATE_AT_RAISE.load(Ordering::SeqCst) {
        interrupts::enable_interrupts();
    }
    CURRENT_TPL.store(new_tpl, Ordering::SeqCst);
}

/// Returns the current task priority level.
pub fn current_tpl() -> efi::Tpl {
    CURRENT_TPL.load(Ordering::SeqCst)
}

/// Samples the time counter, advances system time to it, and fires any due timers.
///
/// Called from the platform's periodic tick interrupt and from the Stall polling loop (see
/// [`crate::timer`]); the trailing restore dispatches the timer notifies that came due.
pub fn timer_tick() {
    let old_tpl = raise_tpl(efi::TPL_HIGH_LEVEL);
    let current_time = current_system_time();
    EVENT_DB.timer_tick(current_time);
    restore_tpl(old_tpl); //implicitly dispatches timer notifies if any.
}

// indicates that eventing subsystem is fully initialized.
static EVENT_DB_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Invoked by the memory map whenever a range is added, allocated, freed or converted, so that
/// listeners on the standard memory-map-change group observe the mutation.
pub fn memory_map_changed() {
    if EVENT_DB_INITIALIZED.load(Ordering::SeqCst) {
        EVENT_DB.signal_group(efi::EVENT_GROUP_MEMORY_MAP_CHANGE);
    }
}

pub fn init_events_support(bs: &mut efi::BootServices) {
    bs.create_event = create_event;
    bs.create_event_ex = create_event_ex;
    bs.close_event = close_event;
    bs.signal_event = signal_event;
    bs.wait_for_event = wait_for_event;
    bs.check_event = check_event;
    bs.set_timer = set_timer;
    bs.raise_tpl = raise_tpl;
    bs.restore_tpl = restore_tpl;

    //Indicate eventing is initialized
    EVENT_DB_INITIALIZED.store(true, Ordering::SeqCst);
}
