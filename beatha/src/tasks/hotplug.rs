//! Serial device arrival and removal.
//!
//! [`PollingHotplug`] diffs the serial enumeration between polls. Devices
//! present when the source is created are the baseline and do not produce
//! events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};

use super::sleep_unless;
use crate::error::Result;
use crate::port::{PortEnumerator, PortInfo};

/// A change in the set of serial devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device appeared.
    Added(PortInfo),
    /// A device with this path disappeared.
    Removed(String),
}

/// Source of hotplug events.
pub trait HotplugSource: Send {
    /// Events since the previous call.
    fn poll(&mut self) -> Result<Vec<HotplugEvent>>;
}

/// Enumeration-diffing hotplug source.
pub struct PollingHotplug {
    enumerator: Arc<dyn PortEnumerator>,
    known: BTreeMap<String, PortInfo>,
}

impl PollingHotplug {
    /// Create a source with the current devices as baseline.
    pub fn new(enumerator: Arc<dyn PortEnumerator>) -> Self {
        let known = enumerator
            .list_ports()
            .unwrap_or_else(|e| {
                warn!("Initial serial enumeration failed: {e}");
                Vec::new()
            })
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        Self { enumerator, known }
    }
}

impl HotplugSource for PollingHotplug {
    fn poll(&mut self) -> Result<Vec<HotplugEvent>> {
        let current: BTreeMap<String, PortInfo> = self
            .enumerator
            .list_ports()?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let mut events: Vec<HotplugEvent> = self
            .known
            .keys()
            .filter(|name| !current.contains_key(*name))
            .map(|name| HotplugEvent::Removed(name.clone()))
            .collect();
        events.extend(
            current
                .iter()
                .filter(|(name, _)| !self.known.contains_key(*name))
                .map(|(_, info)| HotplugEvent::Added(info.clone())),
        );

        self.known = current;
        Ok(events)
    }
}

/// Poll `source` every `interval` and hand each event to `on_event`.
pub fn run<S, F>(mut source: S, interval: Duration, shutdown: &AtomicBool, mut on_event: F)
where
    S: HotplugSource,
    F: FnMut(HotplugEvent),
{
    while !shutdown.load(Ordering::SeqCst) {
        match source.poll() {
            Ok(events) => {
                for event in events {
                    debug!("Hotplug: {event:?}");
                    on_event(event);
                }
            },
            Err(e) => warn!("Serial enumeration failed: {e}"),
        }
        if !sleep_unless(shutdown, interval) {
            break;
        }
    }
}
