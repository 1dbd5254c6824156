//! Interrupt masking seam
//!
//! TPL transitions into and out of `TPL_HIGH_LEVEL` must mask and unmask external interrupts.
//! The actual mechanism is platform-owned, so the core routes through a registered hook; until
//! one is registered (and on test hosts) the mask state is only tracked.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Platform hook invoked with `true` to enable interrupts and `false` to mask them.
pub type InterruptMaskHook = fn(enable: bool);

static MASK_HOOK: AtomicUsize = AtomicUsize::new(0);
static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Registers the platform interrupt mask hook.
pub fn register_mask_hook(hook: InterruptMaskHook) {
    MASK_HOOK.store(hook as usize, Ordering::SeqCst);
}

fn invoke_hook(enable: bool) {
    let raw = MASK_HOOK.load(Ordering::SeqCst);
    if raw != 0 {
        //Safety: the only writer is register_mask_hook, which stores a valid fn pointer.
        let hook: InterruptMaskHook = unsafe { core::mem::transmute(raw) };
        hook(enable);
    }
}

/// Masks external interrupts.
pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.store(false, Ordering::SeqCst);
    invoke_hook(false);
}

/// Unmasks external interrupts.
pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
    invoke_hook(true);
}

/// Returns the tracked interrupt mask state.
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::SeqCst)
}
