//! ISO 11783 (ISOBUS) network management over raw extended-frame CAN.
//!
//! An [`Endpoint`] binds to a CAN interface, claims an address for itself
//! following the distributed arbitration procedure in ISO 11783-5 /
//! SAE J1939-81, and exchanges [`IsobusMessage`]s with the rest of the bus.
//! Several endpoints may share one interface; the [`CanDriver`] beneath them
//! multiplexes a single `CAN_RAW` socket in software.

#[macro_use]
extern crate log;

mod claim;
mod dispatch;
mod driver;
mod error;
mod filter;
mod frame;
mod id;
mod link;
mod message;
mod name;

pub mod endpoint;

pub use driver::{CanDriver, CanRawDriver, EndpointId};
pub use endpoint::{Endpoint, EndpointOption};
pub use error::{Error, Result};
pub use filter::IsobusFilter;
pub use frame::RawCanFrame;
pub use id::{pdu_fmt, PduFormat};
pub use link::{LinkEvent, LinkWatcher};
pub use message::{IsobusMessage, MsgFlags};
pub use name::{Name, NameBuilder};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn crate_exposes_an_endpoint_over_a_can_raw_driver() {
        let driver: Arc<dyn CanDriver> = Arc::new(CanRawDriver::new());
        let _endpoint = Endpoint::init(driver);
    }
}
