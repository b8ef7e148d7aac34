//! The public contract: an ISOBUS endpoint bound to a CAN interface, running
//! its own address-claim machine, with a receive queue and a filter set.
//!
//! Lock discipline follows `glonax-runtime`'s `NetDriverContext`: one
//! `std::sync::Mutex` guards every piece of mutable endpoint state, acquired
//! for the duration of a single operation and never held across an `.await`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Notify};

use crate::claim::{self, ClaimState, ScAddrTable};
use crate::dispatch::{self, Installed};
use crate::driver::{CanDriver, EndpointId, Origin};
use crate::error::{Error, Result};
use crate::filter::IsobusFilter;
use crate::id;
use crate::link::{LinkEvent, LinkWatcher};
use crate::message::{IsobusMessage, MsgFlags};
use crate::name::{Name, NameBuilder};

/// A node's default function, borrowed from `isobus_init`'s own default
/// NAME: function 130 is "data logger", a reasonable generic default for an
/// endpoint that hasn't been told what it is.
const DEFAULT_FUNCTION: u8 = 130;

/// An option an endpoint can be configured with via [`Endpoint::set_option`]
/// / [`Endpoint::get_option`].
#[derive(Debug, Clone)]
pub enum EndpointOption {
    Filter(Vec<IsobusFilter>),
    Loopback(bool),
    RecvOwnMsgs(bool),
    SendPrio(u8),
    Daddr(bool),
    Name(Name),
    ErrMask(u32),
}

struct State {
    bound: bool,
    ifname: String,
    name: Name,
    pref_addr: u8,
    s_addr: u8,
    claim: ClaimState,
    sc_addrs: ScAddrTable,
    pref_avail: bool,
    filters: Vec<IsobusFilter>,
    err_mask: u32,
    loopback: bool,
    recv_own_msgs: bool,
    daddr_opt: bool,
    priority: u8,
}

impl State {
    fn fresh() -> Self {
        let identity = rand::thread_rng().gen_range(0..=0x001F_FFFFu32);
        let name = NameBuilder::new()
            .identity(identity)
            .manufacturer(0x07FF)
            .function(DEFAULT_FUNCTION)
            .self_configurable(true)
            .build();

        Self {
            bound: false,
            ifname: String::new(),
            name,
            pref_addr: id::ANY_ADDR,
            s_addr: id::NULL_ADDR,
            claim: ClaimState::Idle,
            sc_addrs: ScAddrTable::all_free(),
            pref_avail: true,
            filters: vec![IsobusFilter::match_all()],
            err_mask: 0,
            loopback: true,
            recv_own_msgs: false,
            daddr_opt: false,
            priority: 6,
        }
    }
}

struct Inner {
    id: EndpointId,
    driver: Arc<dyn CanDriver>,
    state: Mutex<State>,
    notify: Notify,
    tx: mpsc::UnboundedSender<IsobusMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IsobusMessage>>,
    installed: tokio::sync::Mutex<Option<Installed>>,
    link_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A bound or unbound ISOBUS endpoint. Cheaply clonable; clones share the
/// same underlying state, filters, and receive queue.
#[derive(Clone)]
pub struct Endpoint(Arc<Inner>);

impl Endpoint {
    /// Create a fresh, unbound endpoint with a pseudo-random NAME.
    #[must_use]
    pub fn init(driver: Arc<dyn CanDriver>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self(Arc::new(Inner {
            id: EndpointId::new(),
            driver,
            state: Mutex::new(State::fresh()),
            notify: Notify::new(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            installed: tokio::sync::Mutex::new(None),
            link_task: Mutex::new(None),
        }))
    }

    /// Bind to `ifname`, enable filters, and claim `pref_addr` (or any
    /// self-configurable address, if the endpoint's NAME allows it and
    /// `pref_addr` is [`id::ANY_ADDR`]).
    pub async fn bind(&self, ifname: &str, pref_addr: u8) -> Result<()> {
        match self.0.driver.is_up(ifname).await {
            Ok(false) => log::warn!("interface '{}' is bound while down", ifname),
            Err(Error::NoSuchInterface) => return Err(Error::NoSuchInterface),
            Err(error) => return Err(error),
            Ok(true) => {}
        }

        {
            let mut state = self.0.state.lock().unwrap();
            state.ifname = ifname.to_owned();
            state.bound = true;
        }

        let installed = self.install_current(ifname).await?;

        *self.0.installed.lock().await = Some(installed);

        self.spawn_link_task(ifname);

        let claim_result = self.claim(pref_addr).await;
        if claim_result.is_err() {
            log::warn!("endpoint failed to claim an address on '{}'", ifname);
        }
        claim_result
    }

    /// Install the current filter set and error mask against the driver,
    /// per `isobus_enable_allfilters`.
    async fn install_current(&self, ifname: &str) -> Result<Installed> {
        let (filters, err_mask) = {
            let state = self.0.state.lock().unwrap();
            (state.filters.clone(), state.err_mask)
        };

        Installed::enable(
            &self.0.driver,
            ifname,
            &filters,
            err_mask,
            self.user_frame_callback(),
            self.addr_claimed_callback(),
            self.request_callback(),
        )
        .await
    }

    fn spawn_link_task(&self, ifname: &str) {
        let ifname = ifname.to_owned();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut watcher = match LinkWatcher::new(&ifname) {
                Ok(w) => w,
                Err(error) => {
                    log::warn!("link watcher unavailable for '{}': {}", ifname, error);
                    return;
                }
            };

            loop {
                match watcher.listen().await {
                    Ok(LinkEvent::Gone) => {
                        this.0.state.lock().unwrap().bound = false;
                        log::info!("interface '{}' was unregistered", ifname);
                        return;
                    }
                    Ok(LinkEvent::Down) => {
                        log::warn!("interface '{}' went down", ifname);
                    }
                    Ok(LinkEvent::Up) => {
                        log::info!("interface '{}' came back up", ifname);
                    }
                    Err(error) => {
                        log::warn!("link watcher error on '{}': {}", ifname, error);
                        return;
                    }
                }
            }
        });
        *self.0.link_task.lock().unwrap() = Some(handle);
    }

    /// Run the address-claim state machine for `pref_addr`, per
    /// `isobus_claim_addr`.
    async fn claim(&self, pref_addr: u8) -> Result<()> {
        let name = {
            let mut state = self.0.state.lock().unwrap();
            state.s_addr = id::NULL_ADDR;
            state.sc_addrs = ScAddrTable::all_free();
            state.pref_avail = true;
            state.pref_addr = pref_addr;
            state.claim = ClaimState::WaitAddr;
            state.name
        };

        self.send_request_for_claim().await?;

        let wait = claim::ADDR_CLAIM_TIMEOUT + claim::rtxd();
        self.wait_while(ClaimState::WaitAddr, wait).await;

        let chosen = {
            let mut state = self.0.state.lock().unwrap();

            if state.claim == ClaimState::LostAddr {
                return Err(Error::AddressInUse);
            }

            let chosen = if pref_addr != id::ANY_ADDR && state.pref_avail {
                Some(pref_addr)
            } else if name.is_self_configurable() {
                state.sc_addrs.lowest_free()
            } else {
                None
            };

            match chosen {
                Some(addr) => {
                    state.s_addr = addr;
                    state.claim = ClaimState::WaitHaveAddr;
                    addr
                }
                None => {
                    state.claim = ClaimState::LostAddr;
                    None
                }
            }
        };

        let Some(addr) = chosen else {
            self.lose().await;
            return Err(Error::AddressInUse);
        };

        self.send_addr_claimed(addr, name).await?;

        self.wait_while(ClaimState::WaitHaveAddr, claim::ADDR_CLAIM_TIMEOUT)
            .await;

        let mut state = self.0.state.lock().unwrap();
        if state.claim == ClaimState::LostAddr {
            return Err(Error::AddressInUse);
        }
        state.claim = ClaimState::HaveAddr;
        log::info!("endpoint claimed address 0x{:02X}", addr);
        Ok(())
    }

    async fn wait_while(&self, state: ClaimState, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                if self.0.state.lock().unwrap().claim != state {
                    return;
                }
                self.0.notify.notified().await;
            }
        })
        .await;
    }

    async fn send_request_for_claim(&self) -> Result<()> {
        let pgn_bytes = [
            (dispatch::PGN_ADDR_CLAIMED & 0xFF) as u8,
            ((dispatch::PGN_ADDR_CLAIMED >> 8) & 0xFF) as u8,
            ((dispatch::PGN_ADDR_CLAIMED >> 16) & 0xFF) as u8,
        ];
        let ifname = self.0.state.lock().unwrap().ifname.clone();
        let mut msg = IsobusMessage::new(dispatch::PGN_REQUEST, pgn_bytes.to_vec());
        msg.saddr = id::NULL_ADDR;
        msg.daddr = id::GLOBAL_ADDR;
        self.0
            .driver
            .send(&ifname, msg.to_frame(), self.0.id, false)
            .await
    }

    async fn send_addr_claimed(&self, s_addr: u8, name: Name) -> Result<()> {
        let ifname = self.0.state.lock().unwrap().ifname.clone();
        let mut msg = IsobusMessage::new(dispatch::PGN_ADDR_CLAIMED, name.to_le_bytes().to_vec());
        msg.saddr = s_addr;
        msg.daddr = id::GLOBAL_ADDR;
        self.0
            .driver
            .send(&ifname, msg.to_frame(), self.0.id, true)
            .await
    }

    /// Give up the currently claimed (or being-claimed) address: announce a
    /// "cannot claim" address-claimed frame with source address `NULL_ADDR`.
    async fn lose(&self) {
        let (ifname, name) = {
            let mut state = self.0.state.lock().unwrap();
            state.bound = false;
            state.s_addr = id::NULL_ADDR;
            state.claim = ClaimState::LostAddr;
            (state.ifname.clone(), state.name)
        };

        let mut msg = IsobusMessage::new(dispatch::PGN_ADDR_CLAIMED, name.to_le_bytes().to_vec());
        msg.saddr = id::NULL_ADDR;
        msg.daddr = id::GLOBAL_ADDR;
        let _ = self.0.driver.send(&ifname, msg.to_frame(), self.0.id, true).await;

        self.0.notify.notify_waiters();
    }

    /// Send a message. Refuses with [`Error::AddressInUse`] unless the
    /// endpoint currently holds a claimed address.
    pub async fn send(&self, pgn: u32, payload: Vec<u8>, destination: Option<u8>) -> Result<()> {
        let (ifname, saddr, priority, loopback) = {
            let state = self.0.state.lock().unwrap();
            if state.claim != ClaimState::HaveAddr {
                return Err(Error::AddressInUse);
            }
            (
                state.ifname.clone(),
                state.s_addr,
                state.priority,
                state.loopback,
            )
        };

        let daddr = match id::pdu_fmt(pgn) {
            id::PduFormat::Pdu1 => destination.ok_or(Error::InvalidArgument)?,
            id::PduFormat::Pdu2 => id::GLOBAL_ADDR,
        };

        if payload.len() > crate::frame::MAX_DLEN {
            return Err(Error::InvalidArgument);
        }

        let mut msg = IsobusMessage::new(pgn, payload);
        msg.saddr = saddr;
        msg.daddr = daddr;
        msg.priority = priority;

        self.0
            .driver
            .send(&ifname, msg.to_frame(), self.0.id, loopback)
            .await
    }

    /// Receive the next message for this endpoint, blocking until one
    /// arrives or the endpoint is released.
    pub async fn recv(&self) -> Result<IsobusMessage> {
        if self.0.state.lock().unwrap().claim != ClaimState::HaveAddr {
            return Err(Error::AddressInUse);
        }

        self.0
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::DeviceGone)
    }

    /// Receive the next message without blocking, if one is already queued.
    pub fn try_recv(&self) -> Result<IsobusMessage> {
        if self.0.state.lock().unwrap().claim != ClaimState::HaveAddr {
            return Err(Error::AddressInUse);
        }

        self.0
            .rx
            .try_lock()
            .map_err(|_| Error::NotSupported)?
            .try_recv()
            .map_err(|_| Error::NoMemory)
    }

    pub async fn set_option(&self, option: EndpointOption) -> Result<()> {
        match option {
            EndpointOption::Filter(filters) => {
                self.0.state.lock().unwrap().filters = filters;
                self.reinstall_if_bound().await?;
            }
            EndpointOption::Loopback(v) => self.0.state.lock().unwrap().loopback = v,
            EndpointOption::RecvOwnMsgs(v) => self.0.state.lock().unwrap().recv_own_msgs = v,
            EndpointOption::SendPrio(p) => {
                if p > 7 {
                    return Err(Error::OutOfRange);
                }
                self.0.state.lock().unwrap().priority = p;
            }
            EndpointOption::Daddr(v) => self.0.state.lock().unwrap().daddr_opt = v,
            EndpointOption::Name(name) => self.0.state.lock().unwrap().name = name,
            EndpointOption::ErrMask(mask) => {
                self.0.state.lock().unwrap().err_mask = mask;
                self.reinstall_if_bound().await?;
            }
        }
        Ok(())
    }

    /// Re-run [`Self::install_current`] against the driver if this endpoint
    /// is currently bound, swapping in the freshly installed registrations.
    async fn reinstall_if_bound(&self) -> Result<()> {
        if !self.0.state.lock().unwrap().bound {
            return Ok(());
        }

        let ifname = self.0.state.lock().unwrap().ifname.clone();
        let mut guard = self.0.installed.lock().await;
        if let Some(old) = guard.take() {
            old.disable(&self.0.driver).await;
        }
        let installed = self.install_current(&ifname).await?;
        *guard = Some(installed);
        Ok(())
    }

    #[must_use]
    pub fn get_option_name(&self) -> Name {
        self.0.state.lock().unwrap().name
    }

    #[must_use]
    pub fn get_option_loopback(&self) -> bool {
        self.0.state.lock().unwrap().loopback
    }

    #[must_use]
    pub fn get_option_recv_own_msgs(&self) -> bool {
        self.0.state.lock().unwrap().recv_own_msgs
    }

    #[must_use]
    pub fn get_option_daddr(&self) -> bool {
        self.0.state.lock().unwrap().daddr_opt
    }

    #[must_use]
    pub fn get_option_err_mask(&self) -> u32 {
        self.0.state.lock().unwrap().err_mask
    }

    #[must_use]
    pub fn source_address(&self) -> u8 {
        self.0.state.lock().unwrap().s_addr
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.0.state.lock().unwrap().bound
    }

    /// Uninstall every filter and stop the link watcher. The endpoint is
    /// unusable afterward.
    pub async fn release(&self) {
        if let Some(installed) = self.0.installed.lock().await.take() {
            installed.disable(&self.0.driver).await;
        }
        if let Some(handle) = self.0.link_task.lock().unwrap().take() {
            handle.abort();
        }
        self.0.state.lock().unwrap().bound = false;
    }

    fn user_frame_callback(&self) -> crate::driver::DispatchCallback {
        let this = self.clone();
        Arc::new(move |frame, origin| this.on_user_frame(frame, origin))
    }

    fn addr_claimed_callback(&self) -> crate::driver::DispatchCallback {
        let this = self.clone();
        Arc::new(move |frame, origin| this.on_addr_claimed_frame(frame, origin))
    }

    fn request_callback(&self) -> crate::driver::DispatchCallback {
        let this = self.clone();
        Arc::new(move |frame, origin| this.on_request_frame(frame, origin))
    }

    fn on_user_frame(&self, frame: crate::frame::RawCanFrame, origin: Origin) {
        let recv_own_msgs = self.0.state.lock().unwrap().recv_own_msgs;
        if !dispatch::accept_user_frame(&frame, origin, self.0.id, recv_own_msgs) {
            return;
        }

        let Some(mut msg) = IsobusMessage::from_frame(&frame) else {
            return;
        };

        if matches!(origin, Origin::Loopback(_)) {
            msg.flags |= MsgFlags::DONTROUTE;
            if matches!(origin, Origin::Loopback(sender) if sender == self.0.id) {
                msg.flags |= MsgFlags::CONFIRM;
            }
        }

        let _ = self.0.tx.send(msg);
    }

    fn on_addr_claimed_frame(&self, frame: crate::frame::RawCanFrame, origin: Origin) {
        if matches!(origin, Origin::Loopback(sender) if sender == self.0.id) {
            return;
        }

        let can_id = frame.id();
        let sa = id::field(can_id, id::Field::Sa) as u8;
        if frame.payload().len() != 8 {
            return;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(frame.payload());
        let peer_name = Name::from_le_bytes(bytes);

        self.handle_addr_claimed(sa, peer_name);
    }

    fn handle_addr_claimed(&self, sa: u8, peer_name: Name) {
        if sa == id::NULL_ADDR {
            return;
        }

        let action = {
            let mut state = self.0.state.lock().unwrap();

            if sa >= id::MIN_SC_ADDR && sa <= id::MAX_SC_ADDR {
                state.sc_addrs.mark_taken(sa);
            }

            match state.claim {
                ClaimState::WaitAddr => {
                    if sa == state.pref_addr {
                        if state.name < peer_name {
                            state.claim = ClaimState::WaitHaveAddr;
                            Some(true)
                        } else {
                            state.pref_avail = false;
                            if !state.name.is_self_configurable() {
                                state.claim = ClaimState::LostAddr;
                            }
                            None
                        }
                    } else {
                        None
                    }
                }
                ClaimState::HaveAddr | ClaimState::WaitHaveAddr if sa == state.s_addr => {
                    if state.name <= peer_name {
                        Some(false)
                    } else {
                        state.claim = ClaimState::LostAddr;
                        None
                    }
                }
                _ => None,
            }
        };

        self.0.notify.notify_waiters();

        match action {
            Some(true) => {}
            Some(false) => {
                let (addr, name, ifname) = {
                    let state = self.0.state.lock().unwrap();
                    (state.s_addr, state.name, state.ifname.clone())
                };
                let this = self.clone();
                tokio::spawn(async move {
                    let mut msg = IsobusMessage::new(
                        dispatch::PGN_ADDR_CLAIMED,
                        name.to_le_bytes().to_vec(),
                    );
                    msg.saddr = addr;
                    msg.daddr = id::GLOBAL_ADDR;
                    let _ = this
                        .0
                        .driver
                        .send(&ifname, msg.to_frame(), this.0.id, true)
                        .await;
                });
            }
            None => {
                if self.0.state.lock().unwrap().claim == ClaimState::LostAddr {
                    let this = self.clone();
                    tokio::spawn(async move { this.lose().await });
                }
            }
        }
    }

    fn on_request_frame(&self, frame: crate::frame::RawCanFrame, origin: Origin) {
        if matches!(origin, Origin::Loopback(sender) if sender == self.0.id) {
            return;
        }

        let target = id::field(frame.id(), id::Field::Ps) as u8;
        self.handle_request_for_claim(target);
    }

    fn handle_request_for_claim(&self, target: u8) {
        let (addr, name, ifname, eligible) = {
            let state = self.0.state.lock().unwrap();
            let eligible = state.claim == ClaimState::HaveAddr
                && (target == state.s_addr || target == id::GLOBAL_ADDR);
            (state.s_addr, state.name, state.ifname.clone(), eligible)
        };

        if !eligible {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let mut msg = IsobusMessage::new(dispatch::PGN_ADDR_CLAIMED, name.to_le_bytes().to_vec());
            msg.saddr = addr;
            msg.daddr = id::GLOBAL_ADDR;
            let _ = this.0.driver.send(&ifname, msg.to_frame(), this.0.id, true).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CanDriver, DispatchCallback, RegistrationId};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// An in-memory driver used purely to exercise the endpoint's claim
    /// machinery and send/recv paths without a real CAN interface.
    #[derive(Default)]
    struct MemDriver {
        regs: Mutex<HashMap<u64, (u32, u32, DispatchCallback)>>,
        next: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl CanDriver for MemDriver {
        async fn register(
            &self,
            _ifname: &str,
            can_id: u32,
            can_mask: u32,
            callback: DispatchCallback,
        ) -> Result<RegistrationId> {
            let id = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.regs.lock().unwrap().insert(id, (can_id, can_mask, callback));
            Ok(RegistrationId::for_test(id))
        }

        async fn unregister(&self, _ifname: &str, id: RegistrationId) -> Result<()> {
            self.regs.lock().unwrap().remove(&id.raw_for_test());
            Ok(())
        }

        async fn send(
            &self,
            _ifname: &str,
            frame: crate::frame::RawCanFrame,
            sender: EndpointId,
            loopback: bool,
        ) -> Result<()> {
            if loopback {
                let regs = self.regs.lock().unwrap();
                for (id, mask, cb) in regs.values() {
                    if (frame.id() & mask) == (id & mask) {
                        cb(frame, Origin::Loopback(sender));
                    }
                }
            }
            Ok(())
        }

        async fn is_up(&self, _ifname: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn err_mask_option_is_stored_and_applied_on_bind() {
        let mem = Arc::new(MemDriver::default());
        let driver: Arc<dyn CanDriver> = mem.clone();
        let ep = Endpoint::init(driver);

        ep.set_option(EndpointOption::ErrMask(0x0000_0004)).await.unwrap();
        assert_eq!(ep.get_option_err_mask(), 0x0000_0004);

        tokio::time::pause();
        let bind = tokio::spawn({
            let ep = ep.clone();
            async move { ep.bind("vcan0", 0x80).await }
        });
        tokio::time::advance(Duration::from_millis(500)).await;
        bind.await.unwrap().unwrap();

        let regs = mem.regs.lock().unwrap();
        assert!(regs
            .values()
            .any(|(id, mask, _)| *id == 0 && *mask == crate::frame::ERR_FLAG | 0x0000_0004));
    }

    #[tokio::test]
    async fn lone_endpoint_claims_preferred_address_after_quiet_wait() {
        let driver: Arc<dyn CanDriver> = Arc::new(MemDriver::default());
        let ep = Endpoint::init(driver);

        // Skip past the real wait period for a fast test.
        tokio::time::pause();
        let bind = tokio::spawn({
            let ep = ep.clone();
            async move { ep.bind("vcan0", 0x80).await }
        });
        tokio::time::advance(Duration::from_millis(500)).await;
        let result = bind.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(ep.source_address(), 0x80);
    }
}
