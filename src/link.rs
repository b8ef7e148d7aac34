//! Link-state notifications for a bound interface, completing the
//! `HostMonitor` pattern `glonax-runtime`'s own `device/host.rs` left as a
//! `#[allow(dead_code)] mod todo`.
//!
//! Subscribes to udev's `net` subsystem, matches events against the bound
//! interface's sysname, and maps them onto the three events `isobus_notifier`
//! reacts to: `NETDEV_UNREGISTER`, `NETDEV_DOWN`, and the interface coming
//! back up.

use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The interface transitioned to the `up` operational state.
    Up,
    /// The interface transitioned to administratively down.
    Down,
    /// The interface was unregistered (removed) from the host entirely.
    Gone,
}

pub struct LinkWatcher {
    ifname: String,
    inner: AsyncFd<udev::MonitorSocket>,
}

impl LinkWatcher {
    /// Start watching `ifname` for link-state changes.
    pub fn new(ifname: &str) -> Result<Self> {
        let monitor = udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem("net"))
            .and_then(udev::MonitorBuilder::listen)
            .map_err(std::io::Error::from)?;

        Ok(Self {
            ifname: ifname.to_owned(),
            inner: AsyncFd::new(monitor)?,
        })
    }

    /// Read the interface's current sysfs `operstate` attribute directly,
    /// the same way `HostInterface::elect` enumerates device attributes,
    /// used once at bind time to report a soft "interface down" warning.
    pub fn is_up(ifname: &str) -> Result<bool> {
        let mut enumerator = udev::Enumerator::new().map_err(std::io::Error::from)?;
        enumerator
            .match_subsystem("net")
            .map_err(std::io::Error::from)?;
        enumerator
            .match_sysname(ifname)
            .map_err(std::io::Error::from)?;

        let device = enumerator
            .scan_devices()
            .map_err(std::io::Error::from)?
            .next()
            .ok_or(Error::NoSuchInterface)?;

        let operstate = device
            .attribute_value("operstate")
            .and_then(|v| v.to_str());

        Ok(operstate == Some("up"))
    }

    /// Wait for the next link event concerning the watched interface.
    pub async fn listen(&mut self) -> Result<LinkEvent> {
        loop {
            let mut guard = self.inner.readable_mut().await?;

            let event = guard.get_inner_mut().next();
            guard.clear_ready();

            let Some(event) = event else { continue };

            let sysname = event.sysname().to_str().unwrap_or_default();
            if sysname != self.ifname {
                continue;
            }

            let mapped = match event.event_type() {
                udev::EventType::Remove => Some(LinkEvent::Gone),
                udev::EventType::Change => {
                    let operstate = event
                        .attribute_value("operstate")
                        .and_then(|v| v.to_str());
                    match operstate {
                        Some("up") => Some(LinkEvent::Up),
                        Some("down") => Some(LinkEvent::Down),
                        _ => None,
                    }
                }
                _ => None,
            };

            if let Some(event) = mapped {
                return Ok(event);
            }
        }
    }
}
