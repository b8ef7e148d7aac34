//! The concrete CAN collaborator: a `CanDriver` trait capturing exactly the
//! `register`/`unregister`/`send` surface a [`crate::dispatch::FrameDispatcher`]
//! needs, and `CanRawDriver`, a `CAN_RAW` socket-backed implementation.
//!
//! Several logical endpoints share one physical `CAN_RAW` socket per
//! interface. Dispatch to each endpoint's registered filters is therefore
//! performed in software, the same way Linux's own `af_can.c` dispatches to
//! registered protocol sockets rather than installing one kernel filter per
//! registration.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};
use crate::frame::RawCanFrame;
use crate::link::LinkWatcher;

const SOL_CAN_RAW: libc::c_int = 101; // SOL_CAN_BASE (100) + CAN_RAW (1)
const CAN_RAW_ERR_FILTER: libc::c_int = 2;
const CAN_RAW_FD_FRAMES: libc::c_int = 5;
#[allow(dead_code)]
const CAN_RAW: libc::c_int = 1;

/// Identifies an endpoint for origin-tagging loopback frames, so `user_rcv`
/// can tell a self-sent frame from a wire frame without relying on the
/// kernel's per-socket `CAN_RAW_RECV_OWN_MSGS`, which cannot distinguish
/// between several logical endpoints sharing one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

impl EndpointId {
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a dispatched frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Received off the physical bus.
    Wire,
    /// Looped back locally after a send by the named endpoint.
    Loopback(EndpointId),
}

pub type DispatchCallback = Arc<dyn Fn(RawCanFrame, Origin) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

struct Registration {
    id: RegistrationId,
    can_id: u32,
    can_mask: u32,
    callback: DispatchCallback,
}

/// Error-class registrations (`reg_mask` carrying [`crate::frame::ERR_FLAG`])
/// use the kernel's own `can_rx_register`/error-frame convention: `reg_id` is
/// ignored, and the match is "is this an error frame sharing at least one
/// error-class bit with `reg_mask`", not an equality test.
fn matches(reg_id: u32, reg_mask: u32, frame: &RawCanFrame) -> bool {
    if reg_mask & crate::frame::ERR_FLAG != 0 {
        let err_mask = reg_mask & !crate::frame::ERR_FLAG;
        return frame.is_error() && (frame.id() & err_mask) != 0;
    }

    let inverted = reg_id & crate::filter::INV_FILTER != 0;
    let plain_id = reg_id & !crate::filter::INV_FILTER;
    let hit = (frame.id() & reg_mask) == (plain_id & reg_mask);
    if inverted {
        !hit
    } else {
        hit
    }
}

/// The collaborator surface a [`crate::dispatch::FrameDispatcher`] depends
/// on: register/unregister a software filter against a callback, and send a
/// frame, optionally looping it back to this host's own registrations.
#[async_trait::async_trait]
pub trait CanDriver: Send + Sync {
    async fn register(
        &self,
        ifname: &str,
        can_id: u32,
        can_mask: u32,
        callback: DispatchCallback,
    ) -> Result<RegistrationId>;

    async fn unregister(&self, ifname: &str, id: RegistrationId) -> Result<()>;

    async fn send(
        &self,
        ifname: &str,
        frame: RawCanFrame,
        sender: EndpointId,
        loopback: bool,
    ) -> Result<()>;

    /// Whether `ifname` is administratively up. Queried once at bind time to
    /// report the soft "interface down" warning; link transitions after
    /// bind are picked up by [`crate::link::LinkWatcher`] instead.
    async fn is_up(&self, ifname: &str) -> Result<bool>;
}

/// One `CAN_RAW` socket for a single interface, shared by every endpoint
/// bound to it, plus the software dispatch registry matched against every
/// inbound frame.
struct Bus {
    socket: AsyncFd<RawSocket>,
    registrations: Mutex<Vec<Registration>>,
}

impl Bus {
    fn dispatch(&self, frame: RawCanFrame, origin: Origin) {
        let regs = self.registrations.lock().unwrap();
        for reg in regs.iter() {
            if matches(reg.can_id, reg.can_mask, &frame) {
                (reg.callback)(frame, origin);
            }
        }
    }

    /// Recompute the union of every currently registered error mask and push
    /// it down as the socket's `CAN_RAW_ERR_FILTER`, so the kernel starts (or
    /// stops) handing this socket error frames as registrations come and go.
    /// Mirrors `isobus_enable_errfilter`/`isobus_disable_errfilter`, except
    /// applied once per shared socket instead of once per registration,
    /// since several endpoints can register distinct error masks against the
    /// same underlying `CAN_RAW` socket.
    fn refresh_err_filter(&self) -> Result<()> {
        let mask = self
            .registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|reg| reg.can_mask & crate::frame::ERR_FLAG != 0)
            .fold(0u32, |acc, reg| acc | (reg.can_mask & !crate::frame::ERR_FLAG));

        self.socket.get_ref().set_err_filter(mask)
    }
}

/// `CAN_RAW`-backed implementation of [`CanDriver`]. Opens one socket per
/// interface lazily and keeps it alive for as long as any endpoint holds a
/// registration on it.
#[derive(Default)]
pub struct CanRawDriver {
    buses: Mutex<HashMap<String, Arc<Bus>>>,
}

impl CanRawDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bus(&self, ifname: &str) -> Result<Arc<Bus>> {
        let mut buses = self.buses.lock().unwrap();
        if let Some(bus) = buses.get(ifname) {
            return Ok(bus.clone());
        }

        let socket = RawSocket::bind(ifname)?;
        socket.set_nonblocking(true)?;
        let bus = Arc::new(Bus {
            socket: AsyncFd::new(socket)?,
            registrations: Mutex::new(Vec::new()),
        });

        buses.insert(ifname.to_owned(), bus.clone());
        spawn_reader(bus.clone());

        Ok(bus)
    }
}

/// Spawn the task that reads frames off a bus's socket and dispatches them
/// to every matching registration.
fn spawn_reader(bus: Arc<Bus>) {
    tokio::spawn(async move {
        loop {
            let mut guard = match bus.socket.readable().await {
                Ok(guard) => guard,
                Err(error) => {
                    log::error!("bus reader: {}", error);
                    return;
                }
            };

            match guard.try_io(|inner| inner.get_ref().recv()) {
                Ok(Ok(frame)) => bus.dispatch(frame, Origin::Wire),
                Ok(Err(error)) => {
                    log::warn!("bus read error: {}", error);
                }
                Err(_would_block) => continue,
            }
        }
    });
}

#[async_trait::async_trait]
impl CanDriver for CanRawDriver {
    async fn register(
        &self,
        ifname: &str,
        can_id: u32,
        can_mask: u32,
        callback: DispatchCallback,
    ) -> Result<RegistrationId> {
        let bus = self.bus(ifname)?;
        let id = RegistrationId(NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed));

        bus.registrations.lock().unwrap().push(Registration {
            id,
            can_id,
            can_mask,
            callback,
        });

        if can_mask & crate::frame::ERR_FLAG != 0 {
            bus.refresh_err_filter()?;
        }

        Ok(id)
    }

    async fn unregister(&self, ifname: &str, id: RegistrationId) -> Result<()> {
        let bus = {
            let buses = self.buses.lock().unwrap();
            buses.get(ifname).cloned()
        };

        if let Some(bus) = bus {
            let was_err = bus
                .registrations
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.id == id && r.can_mask & crate::frame::ERR_FLAG != 0);

            bus.registrations.lock().unwrap().retain(|r| r.id != id);

            if was_err {
                bus.refresh_err_filter()?;
            }
        }

        Ok(())
    }

    async fn send(
        &self,
        ifname: &str,
        frame: RawCanFrame,
        sender: EndpointId,
        loopback: bool,
    ) -> Result<()> {
        let bus = self.bus(ifname)?;

        loop {
            let mut guard = bus.socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(&frame)) {
                Ok(result) => {
                    result?;
                    break;
                }
                Err(_would_block) => continue,
            }
        }

        if loopback {
            bus.dispatch(frame, Origin::Loopback(sender));
        }

        Ok(())
    }

    async fn is_up(&self, ifname: &str) -> Result<bool> {
        LinkWatcher::is_up(ifname)
    }
}

#[cfg(test)]
impl RegistrationId {
    pub(crate) fn for_test(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw_for_test(self) -> u64 {
        self.0
    }
}

/// Raw `PF_CAN`/`SOCK_RAW`/`CAN_RAW` socket bound to one interface, laid out
/// after `glonax-j1939`'s own `J1939Socket`: the same libc call sequence and
/// the same generic `getsockopt`/`setsockopt` helpers, but targeting the
/// `CAN_RAW` protocol instead of `CAN_J1939`, since address claiming here is
/// implemented in userspace rather than delegated to the kernel.
struct RawSocket {
    fd: i32,
}

impl RawSocket {
    fn iface_index(ifname: &str) -> Result<i32> {
        let cstr = std::ffi::CString::new(ifname).map_err(|_| Error::InvalidArgument)?;
        let idx = unsafe { libc::if_nametoindex(cstr.as_ptr()) };
        if idx == 0 {
            Err(Error::NoSuchInterface)
        } else {
            Ok(idx as i32)
        }
    }

    fn bind(ifname: &str) -> Result<Self> {
        let ifindex = Self::iface_index(ifname)?;

        let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, CAN_RAW) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut addr = unsafe { std::mem::zeroed::<libc::sockaddr_can>() };
        addr.can_family = libc::AF_CAN as u16;
        addr.can_ifindex = ifindex;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_can as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let error = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(error.into());
        }

        let sock = Self { fd };
        // CAN_RAW_FD_FRAMES is enabled on the kernel's own raw socket by
        // default on modern kernels; disable it explicitly since this crate
        // only ever exchanges classic 8-byte frames.
        let _ = sock.setsockopt(SOL_CAN_RAW, CAN_RAW_FD_FRAMES, 0i32);

        Ok(sock)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(std::io::Error::last_os_error().into());
        }

        let new_flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };

        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, new_flags) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(())
    }

    fn recv(&self) -> Result<RawCanFrame> {
        let mut frame = RawCanFrame::default();
        let n = unsafe {
            libc::read(
                self.fd,
                &mut frame as *mut RawCanFrame as *mut libc::c_void,
                std::mem::size_of::<RawCanFrame>(),
            )
        };

        if n as usize != std::mem::size_of::<RawCanFrame>() {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(frame)
    }

    fn send(&self, frame: &RawCanFrame) -> Result<()> {
        let n = unsafe {
            libc::write(
                self.fd,
                frame as *const RawCanFrame as *const libc::c_void,
                std::mem::size_of::<RawCanFrame>(),
            )
        };

        if n as usize != std::mem::size_of::<RawCanFrame>() {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(())
    }

    fn set_err_filter(&self, err_mask: u32) -> Result<()> {
        self.setsockopt(SOL_CAN_RAW, CAN_RAW_ERR_FILTER, err_mask)
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, value: T) -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };

        if rc < 0 {
            Err(std::io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for RawSocket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl IntoRawFd for RawSocket {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mask_match() {
        let hit = RawCanFrame::new(0x18EE_8081, &[]);
        let miss = RawCanFrame::new(0x18EF_8081, &[]);
        assert!(matches(0x18EE_8000, 0xFFFF_FF00, &hit));
        assert!(!matches(0x18EE_8000, 0xFFFF_FF00, &miss));
    }

    #[test]
    fn inverted_mask_match() {
        let inverted_id = 0x18EE_8000 | crate::filter::INV_FILTER;
        let hit = RawCanFrame::new(0x18EE_8081, &[]);
        let miss = RawCanFrame::new(0x18EF_8081, &[]);
        assert!(!matches(inverted_id, 0xFFFF_FF00, &hit));
        assert!(matches(inverted_id, 0xFFFF_FF00, &miss));
    }

    #[test]
    fn error_mask_registration_uses_or_semantics_on_error_frames() {
        let err_reg_mask = crate::frame::ERR_FLAG | 0x0000_0011;
        let error_frame = RawCanFrame::for_test(crate::frame::ERR_FLAG | 0x10, &[]);
        let non_error_frame = RawCanFrame::for_test(0x10, &[]);
        let non_matching_error_frame = RawCanFrame::for_test(crate::frame::ERR_FLAG | 0x100, &[]);

        assert!(matches(0, err_reg_mask, &error_frame));
        assert!(!matches(0, err_reg_mask, &non_error_frame));
        assert!(!matches(0, err_reg_mask, &non_matching_error_frame));
    }

    #[test]
    fn endpoint_ids_are_distinct() {
        assert_ne!(EndpointId::new(), EndpointId::new());
    }
}
