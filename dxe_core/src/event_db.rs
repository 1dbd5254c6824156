//! UEFI Event Database support
//!
//! This module provides an UEFI event database implementation.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![warn(missing_docs)]

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use core::{cmp::Ordering, ffi::c_void, fmt};
use ember_sdk::error::EfiError;
use r_efi::efi;

use crate::tpl_lock;

/// Defines the supported UEFI event types
#[repr(u32)]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum EventType {
    ///
    /// 0x80000200       Timer event with a notification function that is
    /// queue when the event is signaled with SignalEvent()
    ///
    TimerNotify = efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
    ///
    /// 0x80000000       Timer event without a notification function. It can be
    /// signaled with SignalEvent() and checked with CheckEvent() or WaitForEvent().
    ///
    Timer = efi::EVT_TIMER,
    ///
    /// 0x00000100       Generic event with a notification function that
    /// can be waited on with CheckEvent() or WaitForEvent()
    ///
    NotifyWait = efi::EVT_NOTIFY_WAIT,
    ///
    /// 0x00000200       Generic event with a notification function that
    /// is queue when the event is signaled with SignalEvent()
    ///
    NotifySignal = efi::EVT_NOTIFY_SIGNAL,
    ///
    /// 0x00000201       ExitBootServicesEvent.
    ///
    ExitBootServices = efi::EVT_SIGNAL_EXIT_BOOT_SERVICES,
    ///
    /// 0x60000202       SetVirtualAddressMapEvent.
    ///
    SetVirtualAddress = efi::EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE,
    ///
    /// 0x00000000       Generic event without a notification function.
    /// It can be signaled with SignalEvent() and checked with CheckEvent()
    /// or WaitForEvent().
    ///
    Generic = 0x00000000,
    ///
    /// 0x80000100       Timer event with a notification function that can be
    /// waited on with CheckEvent() or WaitForEvent()
    ///
    TimerNotifyWait = efi::EVT_TIMER | efi::EVT_NOTIFY_WAIT,
}

impl TryFrom<u32> for EventType {
    type Error = EfiError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            x if x == EventType::TimerNotify as u32 => Ok(EventType::TimerNotify),
            x if x == EventType::Timer as u32 => Ok(EventType::Timer),
            x if x == EventType::NotifyWait as u32 => Ok(EventType::NotifyWait),
            x if x == EventType::NotifySignal as u32 => Ok(EventType::NotifySignal),
            //NOTE: the following are placeholders for corresponding event groups; callers are expected to translate
            //them to event groups before calling create_event, so they are rejected here.
            x if x == EventType::ExitBootServices as u32 => Err(EfiError::InvalidParameter),
            x if x == EventType::SetVirtualAddress as u32 => Err(EfiError::InvalidParameter),
            x if x == EventType::Generic as u32 => Ok(EventType::Generic),
            x if x == EventType::TimerNotifyWait as u32 => Ok(EventType::TimerNotifyWait),
            _ => Err(EfiError::InvalidParameter),
        }
    }
}

impl EventType {
    /// indicates whether this EventType is NOTIFY_SIGNAL
    pub fn is_notify_signal(&self) -> bool {
        (*self as u32) & efi::EVT_NOTIFY_SIGNAL != 0
    }

    /// indicates whether this EventType is NOTIFY_WAIT
    pub fn is_notify_wait(&self) -> bool {
        (*self as u32) & efi::EVT_NOTIFY_WAIT != 0
    }

    /// indicates whether this EventType is TIMER
    pub fn is_timer(&self) -> bool {
        (*self as u32) & efi::EVT_TIMER != 0
    }
}

/// Defines supported timer delay types.
#[repr(u32)]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum TimerDelay {
    /// Cancels a pending timer
    Cancel,
    /// Creates a periodic timer
    Periodic,
    /// Creates a one-shot relative timer
    Relative,
}

impl TryFrom<u32> for TimerDelay {
    type Error = efi::Status;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            x if x == TimerDelay::Cancel as u32 => Ok(TimerDelay::Cancel),
            x if x == TimerDelay::Periodic as u32 => Ok(TimerDelay::Periodic),
            x if x == TimerDelay::Relative as u32 => Ok(TimerDelay::Relative),
            _ => Err(efi::Status::INVALID_PARAMETER),
        }
    }
}

/// Event Notification
#[derive(Clone)]
pub struct EventNotification {
    /// event handle
    pub event: efi::Event,
    /// efi::TPL that notification should run at
    pub notify_tpl: efi::Tpl,
    /// notification function
    pub notify_function: Option<efi::EventNotify>,
    /// context passed to the notification function
    pub notify_context: Option<*mut c_void>,
}

impl fmt::Debug for EventNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotification")
            .field("event", &self.event)
            .field("notify_tpl", &self.notify_tpl)
            .field("notify_function", &self.notify_function.map(|f| f as usize))
            .field("notify_context", &self.notify_context)
            .finish()
    }
}

//This type is necessary because ordering in a BTreeSet is not stable with respect to insertion
//order. Each event notification is tagged as it is added so that insertion order can be used as
//part of the element comparison (FIFO within a TPL level).
#[derive(Debug, Clone)]
struct TaggedEventNotification(EventNotification, u64);

impl PartialOrd for TaggedEventNotification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaggedEventNotification {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.event == other.0.event {
            Ordering::Equal
        } else if self.0.notify_tpl == other.0.notify_tpl {
            self.1.cmp(&other.1)
        } else {
            other.0.notify_tpl.cmp(&self.0.notify_tpl)
        }
    }
}

impl PartialEq for TaggedEventNotification {
    fn eq(&self, other: &Self) -> bool {
        self.0.event == other.0.event
    }
}

impl Eq for TaggedEventNotification {}

// Note: this Event type is a distinct data structure from efi::Event.
// Event defined here is a private data structure that tracks the data related to the event,
// whereas efi::Event is used as the public index or handle into the event database.
// In the code below efi::Event is used to qualify the index/handle type, where as `Event` with
// scope qualification refers to this private type.
struct Event {
    event_id: usize,
    event_type: EventType,
    event_group: Option<efi::Guid>,

    signaled: bool,

    //Only used for NOTIFY events.
    notify_tpl: efi::Tpl,
    notify_function: Option<efi::EventNotify>,
    notify_context: Option<*mut c_void>,

    //Only used for TIMER events.
    trigger_time: Option<u64>,
    period: Option<u64>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_id", &self.event_id)
            .field("event_type", &self.event_type)
            .field("event_group", &self.event_group)
            .field("signaled", &self.signaled)
            .field("notify_tpl", &self.notify_tpl)
            .field("notify_function", &self.notify_function.map(|f| f as usize).unwrap_or(0))
            .field("notify_context", &self.notify_context)
            .field("trigger_time", &self.trigger_time)
            .field("period", &self.period)
            .finish()
    }
}

impl Event {
    fn new(
        event_id: usize,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: Option<*mut c_void>,
        event_group: Option<efi::Guid>,
    ) -> Result<Self, EfiError> {
        let notifiable = (event_type & (efi::EVT_NOTIFY_SIGNAL | efi::EVT_NOTIFY_WAIT)) != 0;
        let event_type: EventType = event_type.try_into()?;

        if notifiable {
            if notify_function.is_none() {
                return Err(EfiError::InvalidParameter);
            }

            if !((efi::TPL_APPLICATION + 1)..=efi::TPL_HIGH_LEVEL).contains(&notify_tpl) {
                return Err(EfiError::InvalidParameter);
            }
        }

        Ok(Event {
            event_id,
            event_type,
            notify_tpl,
            notify_function,
            notify_context,
            event_group,
            signaled: false,
            trigger_time: None,
            period: None,
        })
    }
}

struct EventDb {
    events: BTreeMap<usize, Event>,
    next_event_id: usize,
    pending_notifies: BTreeSet<TaggedEventNotification>,
    notify_tags: u64, //used to ensure that each notify gets a unique tag in increasing order
    //active timers ordered by due time; the event also carries its due time in trigger_time so
    //that set_timer can remove a prior scheduling without a scan.
    timers: BTreeSet<(u64, usize)>,
}

impl EventDb {
    const fn new() -> Self {
        EventDb {
            events: BTreeMap::new(),
            next_event_id: 1,
            pending_notifies: BTreeSet::new(),
            notify_tags: 0,
            timers: BTreeSet::new(),
        }
    }

    fn create_event(
        &mut self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: Option<*mut c_void>,
        event_group: Option<efi::Guid>,
    ) -> Result<efi::Event, EfiError> {
        let id = self.next_event_id;
        self.next_event_id += 1;
        let event = Event::new(id, event_type, notify_tpl, notify_function, notify_context, event_group)?;
        self.events.insert(id, event);
        Ok(id as efi::Event)
    }

    fn close_event(&mut self, event: efi::Event) -> Result<(), EfiError> {
        let id = event as usize;
        let event = self.events.remove(&id).ok_or(EfiError::InvalidParameter)?;
        if let Some(due) = event.trigger_time {
            self.timers.remove(&(due, id));
        }
        Ok(())
    }

    //private helper function for signal_event.
    fn queue_notify_event(pending_notifies: &mut BTreeSet<TaggedEventNotification>, event: &mut Event, tag: u64) {
        if event.event_type.is_notify_signal() || event.event_type.is_notify_wait() {
            pending_notifies.insert(TaggedEventNotification(
                EventNotification {
                    event: event.event_id as efi::Event,
                    notify_tpl: event.notify_tpl,
                    notify_function: event.notify_function,
                    notify_context: event.notify_context,
                },
                tag,
            ));
        }
    }

    fn signal_event(&mut self, event: efi::Event) -> Result<(), EfiError> {
        let id = event as usize;
        let current_event = self.events.get_mut(&id).ok_or(EfiError::InvalidParameter)?;

        //an already-signaled event does not queue an additional notify.
        if current_event.signaled {
            return Ok(());
        }

        //signal all the members of the same event group (including the current one), if present.
        if let Some(target_group) = current_event.event_group {
            self.signal_group(target_group);
        } else {
            // if no group, signal the event by itself.
            current_event.signaled = true;
            if current_event.event_type.is_notify_signal() {
                Self::queue_notify_event(&mut self.pending_notifies, current_event, self.notify_tags);
                self.notify_tags += 1;
            }
        }
        Ok(())
    }

    fn signal_group(&mut self, group: efi::Guid) {
        for member_event in self.events.values_mut().filter(|e| e.event_group == Some(group) && !e.signaled) {
            member_event.signaled = true;

            if member_event.event_type.is_notify_signal() {
                Self::queue_notify_event(&mut self.pending_notifies, member_event, self.notify_tags);
                self.notify_tags += 1;
            }
        }
    }

    fn clear_signal(&mut self, event: efi::Event) -> Result<(), EfiError> {
        let id = event as usize;
        let event = self.events.get_mut(&id).ok_or(EfiError::InvalidParameter)?;
        event.signaled = false;
        Ok(())
    }

    fn is_signaled(&self, event: efi::Event) -> bool {
        let id = event as usize;
        self.events.get(&id).map(|event| event.signaled).unwrap_or(false)
    }

    fn queue_event_notify(&mut self, event: efi::Event) -> Result<(), EfiError> {
        let id = event as usize;
        let current_event = self.events.get_mut(&id).ok_or(EfiError::InvalidParameter)?;

        Self::queue_notify_event(&mut self.pending_notifies, current_event, self.notify_tags);
        self.notify_tags += 1;

        Ok(())
    }

    fn get_event_type(&self, event: efi::Event) -> Result<EventType, EfiError> {
        let id = event as usize;
        Ok(self.events.get(&id).ok_or(EfiError::InvalidParameter)?.event_type)
    }

    fn set_timer(
        &mut self,
        event: efi::Event,
        timer_type: TimerDelay,
        trigger_time: Option<u64>,
        period: Option<u64>,
    ) -> Result<(), EfiError> {
        let id = event as usize;
        let current_event = self.events.get_mut(&id).ok_or(EfiError::InvalidParameter)?;
        if !current_event.event_type.is_timer() {
            return Err(EfiError::InvalidParameter);
        }
        match timer_type {
            TimerDelay::Cancel => {
                if trigger_time.is_some() || period.is_some() {
                    return Err(EfiError::InvalidParameter);
                }
            }
            TimerDelay::Periodic => {
                if trigger_time.is_none() || period.is_none() {
                    return Err(EfiError::InvalidParameter);
                }
            }
            TimerDelay::Relative => {
                if trigger_time.is_none() || period.is_some() {
                    return Err(EfiError::InvalidParameter);
                }
            }
        }
        //any prior scheduling for this event is removed before the new one takes effect.
        if let Some(due) = current_event.trigger_time {
            self.timers.remove(&(due, id));
        }
        let current_event = self.events.get_mut(&id).ok_or(EfiError::InvalidParameter)?;
        current_event.trigger_time = trigger_time;
        current_event.period = period;
        if let Some(due) = trigger_time {
            self.timers.insert((due, id));
        }
        Ok(())
    }

    fn timer_tick(&mut self, current_time: u64) {
        loop {
            let (due, id) = match self.timers.first() {
                Some(&(due, id)) if due <= current_time => (due, id),
                _ => break,
            };
            self.timers.remove(&(due, id));

            let current_event = match self.events.get_mut(&id) {
                Some(current) => current,
                None => continue, //closed after its timer fired; nothing to signal.
            };

            if let Some(period) = current_event.period {
                //re-arm the periodic timer; if the tick loop fell behind, push the due time
                //forward so the event fires once rather than bursting to catch up.
                let mut next_due = due.saturating_add(period);
                if next_due <= current_time {
                    next_due = current_time + period;
                }
                current_event.trigger_time = Some(next_due);
                self.timers.insert((next_due, id));
            } else {
                //no period means it's a one-shot event; another call to set_timer is required to "re-arm"
                current_event.trigger_time = None;
            }

            if let Err(e) = self.signal_event(id as efi::Event) {
                log::error!("Error {:?} signaling event {:?}.", e, id);
            }
        }
    }

    fn consume_next_event_notify(&mut self, tpl_level: efi::Tpl) -> Option<EventNotification> {
        //if items at front of queue don't exist (e.g. due to close_event), silently pop them off.
        while let Some(item) = self.pending_notifies.first() {
            if !self.events.contains_key(&(item.0.event as usize)) {
                self.pending_notifies.pop_first();
            } else {
                break;
            }
        }
        //if item at front of queue is not higher than desired efi::TPL, then return none
        //otherwise, pop it off and return it.
        if let Some(item) = self.pending_notifies.first() {
            if item.0.notify_tpl <= tpl_level {
                return None;
            } else if let Some(item) = self.pending_notifies.pop_first() {
                return Some(item.0);
            } else {
                log::error!("Pending_notifies was empty, but it should have at least one item.");
            }
        }
        None
    }

    fn is_valid(&self, event: efi::Event) -> bool {
        self.events.contains_key(&(event as usize))
    }
}

struct EventNotificationIterator {
    event_db: &'static SpinLockedEventDb,
    tpl_level: efi::Tpl,
}

impl EventNotificationIterator {
    fn new(event_db: &'static SpinLockedEventDb, tpl_level: efi::Tpl) -> Self {
        EventNotificationIterator { event_db, tpl_level }
    }
}

impl Iterator for EventNotificationIterator {
    type Item = EventNotification;
    fn next(&mut self) -> Option<EventNotification> {
        self.event_db.lock().consume_next_event_notify(self.tpl_level)
    }
}

/// Spin-Locked event database instance.
///
/// This is the main access point for interaction with the event database.
/// The event database is intended to be used as a global singleton, so access
/// is only allowed through this structure which ensures that the event database
/// is properly guarded against race conditions.
pub struct SpinLockedEventDb {
    inner: tpl_lock::TplMutex<EventDb>,
}

impl Default for SpinLockedEventDb {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLockedEventDb {
    /// Creates a new instance of EventDb.
    pub const fn new() -> Self {
        SpinLockedEventDb { inner: tpl_lock::TplMutex::new(efi::TPL_HIGH_LEVEL, EventDb::new(), "EventLock") }
    }

    fn lock(&self) -> tpl_lock::TplGuard<EventDb> {
        self.inner.lock()
    }

    /// Creates a new event in the event database
    ///
    /// This function closely matches the semantics of the EFI_BOOT_SERVICES.CreateEventEx() API in
    /// UEFI spec 2.10 section 7.1.2. Please refer to the spec for details on the input parameters.
    ///
    /// On success, this function returns the newly created event.
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect parameters are given.
    pub fn create_event(
        &self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: Option<*mut c_void>,
        event_group: Option<efi::Guid>,
    ) -> Result<efi::Event, EfiError> {
        self.lock().create_event(event_type, notify_tpl, notify_function, notify_context, event_group)
    }

    /// Closes (deletes) an event from the event database
    ///
    /// This function closely matches the semantics of the EFI_BOOT_SERVICES.CloseEvent() API in
    /// UEFI spec 2.10 section 7.1.3. Please refer to the spec for details on the input parameters.
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect parameters are given.
    pub fn close_event(&self, event: efi::Event) -> Result<(), EfiError> {
        self.lock().close_event(event)
    }

    /// Marks an event as signaled, and queues it for dispatch if it is of type NotifySignalEvent
    ///
    /// This function closely matches the semantics of the EFI_BOOT_SERVICES.SignalEvent() API in
    /// UEFI spec 2.10 section 7.1.4. Please refer to the spec for details on the input parameters.
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect parameters are given.
    pub fn signal_event(&self, event: efi::Event) -> Result<(), EfiError> {
        self.lock().signal_event(event)
    }

    /// Signals an event group
    ///
    /// This routine signals all events in the given event group. There isn't an equivalent UEFI spec API for this; the
    /// equivalent would need to be accomplished by creating a dummy event that is a member of the group and signalling
    /// that event.
    pub fn signal_group(&self, group: efi::Guid) {
        self.lock().signal_group(group)
    }

    /// Returns the event type for the given event
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect event is given.
    pub fn get_event_type(&self, event: efi::Event) -> Result<EventType, EfiError> {
        self.lock().get_event_type(event)
    }

    /// Indicates whether the given event is in the signaled state
    pub fn is_signaled(&self, event: efi::Event) -> bool {
        self.lock().is_signaled(event)
    }

    /// Clears the signaled state for the given event.
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect parameters are given.
    pub fn clear_signal(&self, event: efi::Event) -> Result<(), EfiError> {
        self.lock().clear_signal(event)
    }

    /// Atomically reads and clears the signaled state.
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect parameters are given.
    pub fn read_and_clear_signaled(&self, event: efi::Event) -> Result<bool, EfiError> {
        let mut event_db = self.lock();
        let signaled = event_db.is_signaled(event);
        if signaled {
            event_db.clear_signal(event)?;
        }
        Ok(signaled)
    }

    /// Queues the notify for the given event.
    ///
    /// Queued events can be retrieved via [`event_notification_iter`](SpinLockedEventDb::event_notification_iter).
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect parameters are given.
    pub fn queue_event_notify(&self, event: efi::Event) -> Result<(), EfiError> {
        self.lock().queue_event_notify(event)
    }

    /// Sets a timer on the specified event
    ///
    /// [`timer_tick`](SpinLockedEventDb::timer_tick) is used to advance time; when a timer expires, the corresponding
    /// event is signaled and (if it carries a notify) queued for retrieval via
    /// [`event_notification_iter`](SpinLockedEventDb::event_notification_iter).
    ///
    /// Any prior scheduling for the event is removed before the new one takes effect; `TimerDelay::Cancel` just
    /// removes it.
    ///
    /// ## Errors
    ///
    /// Returns r_efi:efi::Status::INVALID_PARAMETER if incorrect parameters are given.
    pub fn set_timer(
        &self,
        event: efi::Event,
        timer_type: TimerDelay,
        trigger_time: Option<u64>,
        period: Option<u64>,
    ) -> Result<(), EfiError> {
        self.lock().set_timer(event, timer_type, trigger_time, period)
    }

    /// called to advance the system time and process any timer events that fire
    ///
    /// [`set_timer`](SpinLockedEventDb::set_timer) is used to configure timers with either a one-shot or periodic
    /// timer.
    ///
    /// This routine is called to inform the event database that that a certain amount of time has passed. Timers are
    /// kept ordered by due time, so the database only examines expired entries; any that have come due are signaled.
    /// Periodic timers are re-armed at `due + period`; if the tick processing fell behind by more than a period, the
    /// re-arm point is advanced past the current time so that a burst of catch-up signals does not occur.
    ///
    /// signaled events with notifications are queued and can be retrieved via
    /// [`event_notification_iter`](SpinLockedEventDb::event_notification_iter).
    pub fn timer_tick(&self, current_time: u64) {
        self.lock().timer_tick(current_time);
    }

    /// Removes and returns the next pending notification at or above the given efi::TPL level, if any.
    ///
    /// Notifications for events that have been closed since they were queued are silently discarded.
    pub fn consume_next_event_notify(&self, tpl_level: efi::Tpl) -> Option<EventNotification> {
        self.lock().consume_next_event_notify(tpl_level)
    }

    /// Returns an iterator over pending event notifications that should be dispatched at or above the given efi::TPL level.
    ///
    /// Events can be added to the pending queue directly via
    /// [`queue_event_notify`](SpinLockedEventDb::queue_event_notify) or via timer expiration configured via
    /// [`set_timer`](SpinLockedEventDb::set_timer) followed by a [`timer_tick`](SpinLockedEventDb::timer_tick) that
    /// causes the timer to expire.
    ///
    /// Any new events added to the dispatch queue between calls to next() on the iterator will also be returned by the
    /// iterator - the iterator will only stop if there are no pending dispatches at or above the given efi::TPL on a call to
    /// next().
    pub fn event_notification_iter(&'static self, tpl_level: efi::Tpl) -> impl Iterator<Item = EventNotification> {
        EventNotificationIterator::new(self, tpl_level)
    }

    /// Indicates whether a given event is valid.
    pub fn is_valid(&self, event: efi::Event) -> bool {
        self.lock().is_valid(event)
    }
}

unsafe impl Send for SpinLockedEventDb {}
unsafe impl Sync for SpinLockedEventDb {}

#[cfg(test)]
mod tests {
    extern crate std;
    use core::str::FromStr;

    use alloc::{vec, vec::Vec};
    use r_efi::efi;
    use uuid::Uuid;

    use crate::test_support;

    use super::*;

    fn with_locked_state<F: Fn() + std::panic::RefUnwindSafe>(f: F) {
        test_support::with_global_lock(|| {
            f();
        })
        .unwrap();
    }

    extern "efiapi" fn test_notify_function(_: efi::Event, _: *mut core::ffi::c_void) {}

    #[test]
    fn new_should_create_event_db() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            assert_eq!(SPIN_LOCKED_EVENT_DB.lock().events.len(), 0)
        });
    }

    #[test]
    fn create_event_should_create_event() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            let result = SPIN_LOCKED_EVENT_DB.create_event(
                efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                efi::TPL_NOTIFY,
                Some(test_notify_function),
                None,
                None,
            );
            assert!(result.is_ok());
            let event = result.unwrap();
            let index = event as usize;
            assert!(index < SPIN_LOCKED_EVENT_DB.lock().next_event_id);
            let events = &SPIN_LOCKED_EVENT_DB.lock().events;
            assert_eq!(events.get(&index).unwrap().event_type, EventType::TimerNotify);
            assert_eq!(events.get(&index).unwrap().event_type as u32, efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL);
            assert_eq!(events.get(&index).unwrap().notify_tpl, efi::TPL_NOTIFY);
            assert_eq!(events.get(&index).unwrap().notify_function.unwrap() as usize, test_notify_function as usize);
            assert_eq!(events.get(&index).unwrap().notify_context, None);
            assert_eq!(events.get(&index).unwrap().event_group, None);
        });
    }

    #[test]
    fn create_event_with_bad_input_should_not_create_event() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

            //Try with an invalid event type.
            let result = SPIN_LOCKED_EVENT_DB.create_event(
                efi::EVT_SIGNAL_EXIT_BOOT_SERVICES,
                efi::TPL_NOTIFY,
                None,
                None,
                None,
            );
            assert_eq!(result, Err(EfiError::InvalidParameter));

            //if type has efi::EVT_NOTIFY_SIGNAL or efi::EVT_NOTIFY_WAIT, then NotifyFunction must be non-NULL and
            //NotifyTpl must be a valid efi::TPL.
            //Try to create a notified event with None notify_function - should fail.
            let result = SPIN_LOCKED_EVENT_DB.create_event(
                efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                efi::TPL_NOTIFY,
                None,
                None,
                None,
            );
            assert_eq!(result, Err(EfiError::InvalidParameter));

            //Try to create a notified event with Some notify_function but invalid efi::TPL - should fail.
            let result = SPIN_LOCKED_EVENT_DB.create_event(
                efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                efi::TPL_HIGH_LEVEL + 1,
                Some(test_notify_function),
                None,
                None,
            );
            assert_eq!(result, Err(EfiError::InvalidParameter));
        });
    }

    #[test]
    fn close_event_should_delete_event() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            let mut events: Vec<efi::Event> = Vec::new();
            for _ in 0..10 {
                events.push(
                    SPIN_LOCKED_EVENT_DB
                        .create_event(
                            efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                            efi::TPL_NOTIFY,
                            Some(test_notify_function),
                            None,
                            None,
                        )
                        .unwrap(),
                );
            }
            for consumed in 1..11 {
                let event = events.pop().unwrap();
                assert!(SPIN_LOCKED_EVENT_DB.is_valid(event));
                let result = SPIN_LOCKED_EVENT_DB.close_event(event);
                assert!(result.is_ok());
                assert_eq!(SPIN_LOCKED_EVENT_DB.lock().events.len(), 10 - consumed);
                assert!(!SPIN_LOCKED_EVENT_DB.is_valid(event));
            }
        });
    }

    #[test]
    fn signal_event_should_put_events_in_signaled_state() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            let mut events: Vec<efi::Event> = Vec::new();
            for _ in 0..10 {
                events.push(
                    SPIN_LOCKED_EVENT_DB
                        .create_event(
                            efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                            efi::TPL_NOTIFY,
                            Some(test_notify_function),
                            None,
                            None,
                        )
                        .unwrap(),
                );
            }

            for event in events {
                let result: Result<(), EfiError> = SPIN_LOCKED_EVENT_DB.signal_event(event);
                assert!(result.is_ok());
                assert!(SPIN_LOCKED_EVENT_DB.is_signaled(event));
            }
        });
    }

    #[test]
    fn signal_event_should_not_double_queue() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

            let event = SPIN_LOCKED_EVENT_DB
                .create_event(
                    efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                    efi::TPL_NOTIFY,
                    Some(test_notify_function),
                    None,
                    None,
                )
                .unwrap();

            for _ in 0..2 {
                assert!(SPIN_LOCKED_EVENT_DB.signal_event(event).is_ok());
            }

            //ensure only one notify was queued
            assert!(SPIN_LOCKED_EVENT_DB.lock().pending_notifies.len() == 1);

            //ensure the mere act of collecting the events doesn't allow another notification to be queued
            let _ =
                SPIN_LOCKED_EVENT_DB.event_notification_iter(efi::TPL_APPLICATION).collect::<Vec<EventNotification>>();
            assert!(SPIN_LOCKED_EVENT_DB.signal_event(event).is_ok());
            assert!(SPIN_LOCKED_EVENT_DB.lock().pending_notifies.is_empty());

            //ensure the event can be re-queued after it's signal state has been cleared
            assert!(SPIN_LOCKED_EVENT_DB.clear_signal(event).is_ok());
            assert!(SPIN_LOCKED_EVENT_DB.signal_event(event).is_ok());
            assert!(SPIN_LOCKED_EVENT_DB.lock().pending_notifies.len() == 1);
        });
    }

    #[test]
    fn signal_event_on_an_event_group_should_put_all_members_in_signaled_state() {
        with_locked_state(|| {
            let uuid = Uuid::from_str("aefcf33c-ce02-47b4-89f6-4bacdeda3377").unwrap();
            let group1 = efi::Guid::from_bytes(uuid.as_bytes());
            let uuid = Uuid::from_str("3a08a8c7-054b-4268-8aed-bc6a3aef999f").unwrap();
            let group2 = efi::Guid::from_bytes(uuid.as_bytes());
            let uuid = Uuid::from_str("745e8316-4889-4f58-be3c-6b718b7170ec").unwrap();
            let group3 = efi::Guid::from_bytes(uuid.as_bytes());

            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            let mut group1_events: Vec<efi::Event> = Vec::new();
            let mut group2_events: Vec<efi::Event> = Vec::new();
            let mut group3_events: Vec<efi::Event> = Vec::new();
            let mut ungrouped_events: Vec<efi::Event> = Vec::new();

            for group in [Some(group1), Some(group2), Some(group3), None] {
                let list = match group {
                    Some(g) if g == group1 => &mut group1_events,
                    Some(g) if g == group2 => &mut group2_events,
                    Some(_) => &mut group3_events,
                    None => &mut ungrouped_events,
                };
                for _ in 0..10 {
                    list.push(
                        SPIN_LOCKED_EVENT_DB
                            .create_event(
                                efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                                efi::TPL_NOTIFY,
                                Some(test_notify_function),
                                None,
                                group,
                            )
                            .unwrap(),
                    );
                }
            }

            //signal an ungrouped event
            SPIN_LOCKED_EVENT_DB.signal_event(ungrouped_events.pop().unwrap()).unwrap();

            //all other events should remain un-signaled
            for event in group1_events.iter().chain(group2_events.iter()).chain(ungrouped_events.iter()) {
                assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(*event));
            }

            //signal an event in a group
            SPIN_LOCKED_EVENT_DB.signal_event(group1_events[0]).unwrap();

            //events in the same group should be signaled.
            for event in group1_events.iter() {
                assert!(SPIN_LOCKED_EVENT_DB.is_signaled(*event));
            }

            //events in another group and ungrouped events should not be signaled.
            for event in group2_events.iter().chain(ungrouped_events.iter()) {
                assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(*event));
            }

            //signal events in third group using signal_group
            SPIN_LOCKED_EVENT_DB.signal_group(group3);
            for event in group3_events.iter() {
                assert!(SPIN_LOCKED_EVENT_DB.is_signaled(*event));
            }

            //second event group should still not be signaled.
            for event in group2_events.iter() {
                assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(*event));
            }
        });
    }

    #[test]
    fn clear_signal_should_clear_signaled_state() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            let event = SPIN_LOCKED_EVENT_DB
                .create_event(
                    efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                    efi::TPL_NOTIFY,
                    Some(test_notify_function),
                    None,
                    None,
                )
                .unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(event).unwrap();
            assert!(SPIN_LOCKED_EVENT_DB.is_signaled(event));
            let result = SPIN_LOCKED_EVENT_DB.clear_signal(event);
            assert!(result.is_ok());
            assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(event));
        });
    }

    #[test]
    fn is_signaled_should_return_false_for_closed_or_non_existent_event() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            let event = SPIN_LOCKED_EVENT_DB
                .create_event(
                    efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                    efi::TPL_NOTIFY,
                    Some(test_notify_function),
                    None,
                    None,
                )
                .unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(event).unwrap();
            assert!(SPIN_LOCKED_EVENT_DB.is_signaled(event));
            SPIN_LOCKED_EVENT_DB.close_event(event).unwrap();
            assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(event));
            assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(0x1234 as *mut c_void));
        });
    }

    #[test]
    fn signaled_events_with_notifies_should_be_put_in_pending_queue_in_tpl_order() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();
            let make_event = |tpl| {
                SPIN_LOCKED_EVENT_DB
                    .create_event(
                        efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                        tpl,
                        Some(test_notify_function),
                        None,
                        None,
                    )
                    .unwrap()
            };
            let callback_evt1 = make_event(efi::TPL_CALLBACK);
            let callback_evt2 = make_event(efi::TPL_CALLBACK);
            let notify_evt1 = make_event(efi::TPL_NOTIFY);
            let notify_evt2 = make_event(efi::TPL_NOTIFY);
            let high_evt1 = make_event(efi::TPL_HIGH_LEVEL);
            let high_evt2 = make_event(efi::TPL_HIGH_LEVEL);

            SPIN_LOCKED_EVENT_DB.signal_event(callback_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt1).unwrap();

            SPIN_LOCKED_EVENT_DB.signal_event(callback_evt2).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt2).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt2).unwrap();

            {
                let mut event_db = SPIN_LOCKED_EVENT_DB.lock();
                let queue = &mut event_db.pending_notifies;
                assert_eq!(queue.pop_first().unwrap().0.event, high_evt1);
                assert_eq!(queue.pop_first().unwrap().0.event, high_evt2);
                assert_eq!(queue.pop_first().unwrap().0.event, notify_evt1);
                assert_eq!(queue.pop_first().unwrap().0.event, notify_evt2);
                assert_eq!(queue.pop_first().unwrap().0.event, callback_evt1);
                assert_eq!(queue.pop_first().unwrap().0.event, callback_evt2);
            }
        });
    }

    #[test]
    fn signaled_event_iterator_should_return_next_events_in_tpl_order() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

            assert_eq!(
                SPIN_LOCKED_EVENT_DB
                    .event_notification_iter(efi::TPL_APPLICATION)
                    .collect::<Vec<EventNotification>>()
                    .len(),
                0
            );

            let make_event = |tpl| {
                SPIN_LOCKED_EVENT_DB
                    .create_event(
                        efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
                        tpl,
                        Some(test_notify_function),
                        None,
                        None,
                    )
                    .unwrap()
            };
            let callback_evt1 = make_event(efi::TPL_CALLBACK);
            let callback_evt2 = make_event(efi::TPL_CALLBACK);
            let notify_evt1 = make_event(efi::TPL_NOTIFY);
            let notify_evt2 = make_event(efi::TPL_NOTIFY);
            let high_evt1 = make_event(efi::TPL_HIGH_LEVEL);
            let high_evt2 = make_event(efi::TPL_HIGH_LEVEL);

            SPIN_LOCKED_EVENT_DB.signal_event(callback_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt1).unwrap();

            SPIN_LOCKED_EVENT_DB.signal_event(callback_evt2).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt2).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt2).unwrap();

            for (event_notification, expected_event) in
                SPIN_LOCKED_EVENT_DB.event_notification_iter(efi::TPL_NOTIFY).zip(vec![high_evt1, high_evt2])
            {
                assert_eq!(event_notification.event, expected_event);
                assert!(SPIN_LOCKED_EVENT_DB.is_signaled(expected_event));
                let _ = SPIN_LOCKED_EVENT_DB.clear_signal(expected_event);
            }

            //re-signal the consumed events
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt2).unwrap();

            for (event_notification, expected_event) in SPIN_LOCKED_EVENT_DB
                .event_notification_iter(efi::TPL_CALLBACK)
                .zip(vec![high_evt1, high_evt2, notify_evt1, notify_evt2])
            {
                assert_eq!(event_notification.event, expected_event);
                assert!(SPIN_LOCKED_EVENT_DB.is_signaled(expected_event));
                let _ = SPIN_LOCKED_EVENT_DB.clear_signal(expected_event);
            }

            //re-signal the consumed events
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt2).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt2).unwrap();

            for (event_notification, expected_event) in SPIN_LOCKED_EVENT_DB
                .event_notification_iter(efi::TPL_APPLICATION)
                .zip(vec![high_evt1, high_evt2, notify_evt1, notify_evt2, callback_evt1, callback_evt2])
            {
                assert_eq!(event_notification.event, expected_event);
                assert!(SPIN_LOCKED_EVENT_DB.is_signaled(expected_event));
                let _ = SPIN_LOCKED_EVENT_DB.clear_signal(expected_event);
            }

            //re-signal the consumed events
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(high_evt2).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(notify_evt2).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(callback_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.signal_event(callback_evt2).unwrap();

            //close some of the events before consuming; closed events are pruned from the queue.
            SPIN_LOCKED_EVENT_DB.close_event(high_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.close_event(notify_evt1).unwrap();
            SPIN_LOCKED_EVENT_DB.close_event(callback_evt1).unwrap();

            for (event_notification, expected_event) in SPIN_LOCKED_EVENT_DB
                .event_notification_iter(efi::TPL_APPLICATION)
                .zip(vec![high_evt2, notify_evt2, callback_evt2])
            {
                assert_eq!(event_notification.event, expected_event);
                assert!(SPIN_LOCKED_EVENT_DB.is_signaled(expected_event));
                let _ = SPIN_LOCKED_EVENT_DB.clear_signal(expected_event);
            }
        });
    }

    #[test]
    fn set_timer_should_validate_arguments() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

            let timer_evt = SPIN_LOCKED_EVENT_DB
                .create_event(efi::EVT_TIMER, efi::TPL_APPLICATION, None, None, None)
                .unwrap();
            let plain_evt = SPIN_LOCKED_EVENT_DB
                .create_event(0, efi::TPL_APPLICATION, None, None, None)
                .unwrap();

            //non-timer events cannot be scheduled.
            assert_eq!(
                SPIN_LOCKED_EVENT_DB.set_timer(plain_evt, TimerDelay::Relative, Some(100), None),
                Err(EfiError::InvalidParameter)
            );

            //argument combinations must match the delay type.
            assert_eq!(
                SPIN_LOCKED_EVENT_DB.set_timer(timer_evt, TimerDelay::Cancel, Some(100), None),
                Err(EfiError::InvalidParameter)
            );
            assert_eq!(
                SPIN_LOCKED_EVENT_DB.set_timer(timer_evt, TimerDelay::Periodic, Some(100), None),
                Err(EfiError::InvalidParameter)
            );
            assert_eq!(
                SPIN_LOCKED_EVENT_DB.set_timer(timer_evt, TimerDelay::Relative, Some(100), Some(10)),
                Err(EfiError::InvalidParameter)
            );

            assert!(SPIN_LOCKED_EVENT_DB.set_timer(timer_evt, TimerDelay::Relative, Some(100), None).is_ok());
            assert_eq!(SPIN_LOCKED_EVENT_DB.lock().timers.len(), 1);

            //re-scheduling replaces the prior entry rather than adding a second one.
            assert!(SPIN_LOCKED_EVENT_DB.set_timer(timer_evt, TimerDelay::Relative, Some(200), None).is_ok());
            assert_eq!(SPIN_LOCKED_EVENT_DB.lock().timers.len(), 1);

            assert!(SPIN_LOCKED_EVENT_DB.set_timer(timer_evt, TimerDelay::Cancel, None, None).is_ok());
            assert!(SPIN_LOCKED_EVENT_DB.lock().timers.is_empty());
        });
    }

    #[test]
    fn timer_tick_should_signal_due_events_in_due_order() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

            let early = SPIN_LOCKED_EVENT_DB
                .create_event(efi::EVT_TIMER, efi::TPL_APPLICATION, None, None, None)
                .unwrap();
            let late = SPIN_LOCKED_EVENT_DB
                .create_event(efi::EVT_TIMER, efi::TPL_APPLICATION, None, None, None)
                .unwrap();

            SPIN_LOCKED_EVENT_DB.set_timer(early, TimerDelay::Relative, Some(100), None).unwrap();
            SPIN_LOCKED_EVENT_DB.set_timer(late, TimerDelay::Relative, Some(500), None).unwrap();

            SPIN_LOCKED_EVENT_DB.timer_tick(50);
            assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(early));
            assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(late));

            SPIN_LOCKED_EVENT_DB.timer_tick(100);
            assert!(SPIN_LOCKED_EVENT_DB.is_signaled(early));
            assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(late));

            //one-shot timers do not fire again without a new set_timer.
            SPIN_LOCKED_EVENT_DB.clear_signal(early).unwrap();
            SPIN_LOCKED_EVENT_DB.timer_tick(400);
            assert!(!SPIN_LOCKED_EVENT_DB.is_signaled(early));

            SPIN_LOCKED_EVENT_DB.timer_tick(500);
            assert!(SPIN_LOCKED_EVENT_DB.is_signaled(late));
        });
    }

    #[test]
    fn periodic_timers_should_rearm_and_clamp_forward_when_behind() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

            let event = SPIN_LOCKED_EVENT_DB
                .create_event(efi::EVT_TIMER, efi::TPL_APPLICATION, None, None, None)
                .unwrap();

            SPIN_LOCKED_EVENT_DB.set_timer(event, TimerDelay::Periodic, Some(100), Some(100)).unwrap();

            SPIN_LOCKED_EVENT_DB.timer_tick(100);
            assert!(SPIN_LOCKED_EVENT_DB.is_signaled(event));
            assert_eq!(SPIN_LOCKED_EVENT_DB.lock().events.get(&(event as usize)).unwrap().trigger_time, Some(200));

            //falling far behind re-arms past the current time instead of bursting.
            SPIN_LOCKED_EVENT_DB.clear_signal(event).unwrap();
            SPIN_LOCKED_EVENT_DB.timer_tick(1000);
            assert!(SPIN_LOCKED_EVENT_DB.is_signaled(event));
            assert_eq!(SPIN_LOCKED_EVENT_DB.lock().events.get(&(event as usize)).unwrap().trigger_time, Some(1100));
        });
    }

    #[test]
    fn closing_a_scheduled_event_should_drop_its_timer() {
        with_locked_state(|| {
            static SPIN_LOCKED_EVENT_DB: SpinLockedEventDb = SpinLockedEventDb::new();

            let event = SPIN_LOCKED_EVENT_DB
                .create_event(efi::EVT_TIMER, efi::TPL_APPLICATION, None, None, None)
                .unwrap();
            SPIN_LOCKED_EVENT_DB.set_timer(event, TimerDelay::Periodic, Some(100), Some(100)).unwrap();
            SPIN_LOCKED_EVENT_DB.close_event(event).unwrap();
            assert!(SPIN_LOCKED_EVENT_DB.lock().timers.is_empty());

            //a tick after the close is a no-op.
            SPIN_LOCKED_EVENT_DB.timer_tick(1000);
        });
    }
}
