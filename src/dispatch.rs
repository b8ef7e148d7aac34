//! Installs an endpoint's filters against a [`crate::driver::CanDriver`] and
//! routes each matching frame back to the endpoint, grounded on
//! `isobus_enable_filters`/`isobus_enable_nmfilters`/`isobus_enable_allfilters`/
//! `isobus_enable_errfilter` and their rollback-on-failure structure.

use std::sync::Arc;

use crate::driver::{CanDriver, DispatchCallback, EndpointId, Origin, RegistrationId};
use crate::error::Result;
use crate::filter::IsobusFilter;
use crate::frame::RawCanFrame;
use crate::id;

/// PGN carrying an address-claimed announcement.
pub const PGN_ADDR_CLAIMED: u32 = 0x00EE00;
/// PGN carrying a request for a PGN (here, always a request-for-address-claimed).
pub const PGN_REQUEST: u32 = 0x00EA00;

/// A group of registrations installed together and rolled back together if
/// any single registration in the group fails.
struct Group(Vec<RegistrationId>);

/// All registrations an endpoint currently holds against its driver: the
/// user filter set plus the two mandatory network-management listeners.
#[derive(Default)]
pub struct Installed {
    groups: Vec<(String, Group)>,
}

impl Installed {
    /// Install `filters` as a single transactional group, plus the mandatory
    /// address-claimed and request-for-address-claimed listeners as two
    /// further groups, plus an optional fourth error-mask group when
    /// `err_mask` is non-zero. On any failure, every already-installed group
    /// (including ones from earlier in this call) is unwound in reverse
    /// order before the error is returned.
    pub async fn enable(
        driver: &Arc<dyn CanDriver>,
        ifname: &str,
        filters: &[IsobusFilter],
        err_mask: u32,
        on_user_frame: DispatchCallback,
        on_addr_claimed: DispatchCallback,
        on_request: DispatchCallback,
    ) -> Result<Self> {
        let mut installed = Installed::default();

        let user_group = match install_group(driver, ifname, filters, on_user_frame.clone()).await {
            Ok(group) => group,
            Err(error) => {
                installed.rollback(driver).await;
                return Err(error);
            }
        };
        installed.groups.push((ifname.to_owned(), user_group));

        let claimed_filter = IsobusFilter {
            pgn: PGN_ADDR_CLAIMED,
            pgn_mask: id::PGN1_MASK,
            daddr: id::GLOBAL_ADDR,
            daddr_mask: 0xFF,
            saddr: 0,
            saddr_mask: 0,
            inverted: false,
        };
        let claimed_group =
            match install_group(driver, ifname, &[claimed_filter], on_addr_claimed).await {
                Ok(group) => group,
                Err(error) => {
                    installed.rollback(driver).await;
                    return Err(error);
                }
            };
        installed.groups.push((ifname.to_owned(), claimed_group));

        let request_filter = IsobusFilter {
            pgn: PGN_REQUEST,
            pgn_mask: id::PGN1_MASK,
            daddr: 0,
            daddr_mask: 0,
            saddr: 0,
            saddr_mask: 0,
            inverted: false,
        };
        let request_group =
            match install_group(driver, ifname, &[request_filter], on_request).await {
                Ok(group) => group,
                Err(error) => {
                    installed.rollback(driver).await;
                    return Err(error);
                }
            };
        installed.groups.push((ifname.to_owned(), request_group));

        if err_mask != 0 {
            let err_group = match install_raw_group(
                driver,
                ifname,
                &[(0, crate::frame::ERR_FLAG | err_mask)],
                on_user_frame,
            )
            .await
            {
                Ok(group) => group,
                Err(error) => {
                    installed.rollback(driver).await;
                    return Err(error);
                }
            };
            installed.groups.push((ifname.to_owned(), err_group));
        }

        Ok(installed)
    }

    /// Uninstall every registration this endpoint holds.
    pub async fn disable(mut self, driver: &Arc<dyn CanDriver>) {
        self.rollback(driver).await;
    }

    async fn rollback(&mut self, driver: &Arc<dyn CanDriver>) {
        while let Some((ifname, group)) = self.groups.pop() {
            for id in group.0.into_iter().rev() {
                let _ = driver.unregister(&ifname, id).await;
            }
        }
    }
}

async fn install_group(
    driver: &Arc<dyn CanDriver>,
    ifname: &str,
    filters: &[IsobusFilter],
    callback: DispatchCallback,
) -> Result<Group> {
    let mut installed = Vec::with_capacity(filters.len());

    for filter in filters {
        let (can_id, can_mask) = match filter.to_raw() {
            Ok(pair) => pair,
            Err(error) => {
                unwind(driver, ifname, &installed).await;
                return Err(error);
            }
        };

        match driver
            .register(ifname, can_id, can_mask, callback.clone())
            .await
        {
            Ok(id) => installed.push(id),
            Err(error) => {
                unwind(driver, ifname, &installed).await;
                return Err(error);
            }
        }
    }

    Ok(Group(installed))
}

/// Like [`install_group`], but registers raw `(can_id, can_mask)` pairs
/// directly rather than translating [`IsobusFilter`]s — used for the
/// error-mask group, which is not PGN-shaped.
async fn install_raw_group(
    driver: &Arc<dyn CanDriver>,
    ifname: &str,
    pairs: &[(u32, u32)],
    callback: DispatchCallback,
) -> Result<Group> {
    let mut installed = Vec::with_capacity(pairs.len());

    for &(can_id, can_mask) in pairs {
        match driver
            .register(ifname, can_id, can_mask, callback.clone())
            .await
        {
            Ok(id) => installed.push(id),
            Err(error) => {
                unwind(driver, ifname, &installed).await;
                return Err(error);
            }
        }
    }

    Ok(Group(installed))
}

async fn unwind(driver: &Arc<dyn CanDriver>, ifname: &str, installed: &[RegistrationId]) {
    for id in installed.iter().rev() {
        let _ = driver.unregister(ifname, *id).await;
    }
}

/// The decision `user_rcv` makes about one inbound frame, applying the drop
/// rules from `isobus_rcv`: own-message suppression, EDP rejection, and DLC
/// validation.
#[must_use]
pub fn accept_user_frame(
    frame: &RawCanFrame,
    origin: Origin,
    self_id: EndpointId,
    recv_own_msgs: bool,
) -> bool {
    if let Origin::Loopback(sender) = origin {
        if sender == self_id && !recv_own_msgs {
            return false;
        }
    }

    if frame.can_dlc as usize > crate::frame::MAX_DLEN {
        return false;
    }

    if id::field(frame.id(), id::Field::Edp) != 0 {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Counts registrations per call rather than dispatching anything, just
    /// enough to exercise `Installed::enable`'s group-count behaviour.
    #[derive(Default)]
    struct CountingDriver {
        registered: Mutex<Vec<(u32, u32)>>,
        next: AtomicU64,
    }

    #[async_trait]
    impl CanDriver for CountingDriver {
        async fn register(
            &self,
            _ifname: &str,
            can_id: u32,
            can_mask: u32,
            _callback: DispatchCallback,
        ) -> crate::error::Result<RegistrationId> {
            self.registered.lock().unwrap().push((can_id, can_mask));
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            Ok(RegistrationId::for_test(id))
        }

        async fn unregister(&self, _ifname: &str, _id: RegistrationId) -> crate::error::Result<()> {
            Ok(())
        }

        async fn send(
            &self,
            _ifname: &str,
            _frame: RawCanFrame,
            _sender: EndpointId,
            _loopback: bool,
        ) -> crate::error::Result<()> {
            Ok(())
        }

        async fn is_up(&self, _ifname: &str) -> crate::error::Result<bool> {
            Ok(true)
        }
    }

    fn noop_callback() -> DispatchCallback {
        Arc::new(|_frame, _origin| {})
    }

    #[tokio::test]
    async fn zero_err_mask_installs_no_fourth_group() {
        let driver: Arc<dyn CanDriver> = Arc::new(CountingDriver::default());
        let installed = Installed::enable(
            &driver,
            "vcan0",
            &[IsobusFilter::match_all()],
            0,
            noop_callback(),
            noop_callback(),
            noop_callback(),
        )
        .await
        .unwrap();

        assert_eq!(installed.groups.len(), 3);
    }

    #[tokio::test]
    async fn nonzero_err_mask_installs_a_fourth_group_matching_can_err_flag() {
        let inner = Arc::new(CountingDriver::default());
        let driver: Arc<dyn CanDriver> = inner.clone();
        let installed = Installed::enable(
            &driver,
            "vcan0",
            &[IsobusFilter::match_all()],
            0x0000_0011,
            noop_callback(),
            noop_callback(),
            noop_callback(),
        )
        .await
        .unwrap();

        assert_eq!(installed.groups.len(), 4);

        let registered = inner.registered.lock().unwrap();
        let (can_id, can_mask) = registered.last().copied().unwrap();
        assert_eq!(can_id, 0);
        assert_eq!(can_mask, crate::frame::ERR_FLAG | 0x0000_0011);
    }

    #[test]
    fn own_message_dropped_without_recv_own_msgs() {
        let me = EndpointId::new();
        let frame = RawCanFrame::new(0x18EE_8081, &[]);
        assert!(!accept_user_frame(
            &frame,
            Origin::Loopback(me),
            me,
            false
        ));
        assert!(accept_user_frame(&frame, Origin::Loopback(me), me, true));
    }

    #[test]
    fn foreign_loopback_is_not_own_message() {
        let me = EndpointId::new();
        let other = EndpointId::new();
        let frame = RawCanFrame::new(0x18EE_8081, &[]);
        assert!(accept_user_frame(&frame, Origin::Loopback(other), me, false));
    }

    #[test]
    fn edp_set_frames_are_rejected() {
        let frame = RawCanFrame::new(0x1A00_0000, &[]);
        assert!(!accept_user_frame(&frame, Origin::Wire, EndpointId::new(), true));
    }

    #[test]
    fn wire_frames_from_the_bus_are_accepted() {
        let frame = RawCanFrame::new(0x18EE_8081, &[1, 2, 3]);
        assert!(accept_user_frame(&frame, Origin::Wire, EndpointId::new(), false));
    }
}
