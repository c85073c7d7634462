//! Debounced button polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::debug;

use super::sleep_unless;
use crate::hardware::{Button, Hardware};

/// Both buttons, in poll order.
pub const BUTTONS: [Button; 2] = [Button::Dump, Button::Pair];

/// Whether `button` is held, confirmed after `settle`.
pub fn debounced_press(hardware: &Hardware, button: Button, settle: Duration) -> bool {
    if !hardware.is_pressed(button) {
        return false;
    }
    thread::sleep(settle);
    hardware.is_pressed(button)
}

/// Block until `button` is released. Returns `false` on shutdown.
pub fn wait_release(hardware: &Hardware, button: Button, poll: Duration, shutdown: &AtomicBool) -> bool {
    while hardware.is_pressed(button) {
        if !sleep_unless(shutdown, poll) {
            return false;
        }
    }
    true
}

/// Poll both buttons every `poll` and call `on_press` once per press.
///
/// A press fires only after it survived `settle`; the button must be
/// released before it can fire again.
pub fn run<F>(hardware: &Hardware, poll: Duration, settle: Duration, shutdown: &AtomicBool, mut on_press: F)
where
    F: FnMut(Button),
{
    while !shutdown.load(Ordering::SeqCst) {
        for button in BUTTONS {
            if debounced_press(hardware, button, settle) {
                debug!("{button} button pressed");
                on_press(button);
                if !wait_release(hardware, button, poll, shutdown) {
                    return;
                }
            }
        }
        if !sleep_unless(shutdown, poll) {
            break;
        }
    }
}
