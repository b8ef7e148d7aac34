//! The 64-bit ISOBUS/J1939 NAME: a node's arbitration identity. Smaller NAME
//! wins contested addresses.

const ID_MASK: u64 = 0x0000_0000_001F_FFFF;
const ID_POS: u32 = 0;
const MAN_MASK: u64 = 0x0000_0000_FFE0_0000;
const MAN_POS: u32 = 21;
const ECU_MASK: u64 = 0x0000_0007_0000_0000;
const ECU_POS: u32 = 32;
const FINST_MASK: u64 = 0x0000_00F8_0000_0000;
const FINST_POS: u32 = 35;
const FUNC_MASK: u64 = 0x0000_FF00_0000_0000;
const FUNC_POS: u32 = 40;
const CLASS_MASK: u64 = 0x00FE_0000_0000_0000;
const CLASS_POS: u32 = 49;
const CINST_MASK: u64 = 0x0F00_0000_0000_0000;
const CINST_POS: u32 = 56;
const IG_MASK: u64 = 0x7000_0000_0000_0000;
const IG_POS: u32 = 60;
const SC_BIT: u64 = 1 << 63;

/// A 64-bit NAME, stored host-endian; packed little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(u64);

impl Name {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Decode a NAME from its little-endian 8-byte wire representation.
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Encode this NAME to its little-endian 8-byte wire representation.
    #[must_use]
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub fn identity(&self) -> u32 {
        ((self.0 & ID_MASK) >> ID_POS) as u32
    }

    #[must_use]
    pub fn manufacturer(&self) -> u16 {
        ((self.0 & MAN_MASK) >> MAN_POS) as u16
    }

    #[must_use]
    pub fn ecu_instance(&self) -> u8 {
        ((self.0 & ECU_MASK) >> ECU_POS) as u8
    }

    #[must_use]
    pub fn function_instance(&self) -> u8 {
        ((self.0 & FINST_MASK) >> FINST_POS) as u8
    }

    #[must_use]
    pub fn function(&self) -> u8 {
        ((self.0 & FUNC_MASK) >> FUNC_POS) as u8
    }

    #[must_use]
    pub fn class(&self) -> u8 {
        ((self.0 & CLASS_MASK) >> CLASS_POS) as u8
    }

    #[must_use]
    pub fn class_instance(&self) -> u8 {
        ((self.0 & CINST_MASK) >> CINST_POS) as u8
    }

    #[must_use]
    pub fn industry_group(&self) -> u8 {
        ((self.0 & IG_MASK) >> IG_POS) as u8
    }

    /// Whether this node may select an alternate address if its preferred
    /// address is already taken.
    #[must_use]
    pub fn is_self_configurable(&self) -> bool {
        self.0 & SC_BIT != 0
    }
}

/// Builds a NAME field by field.
#[derive(Debug, Default)]
pub struct NameBuilder {
    identity: u32,
    manufacturer: u16,
    ecu_instance: u8,
    function_instance: u8,
    function: u8,
    class: u8,
    class_instance: u8,
    industry_group: u8,
    self_configurable: bool,
}

impl NameBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn identity(mut self, v: u32) -> Self {
        self.identity = v & 0x001F_FFFF;
        self
    }

    #[must_use]
    pub fn manufacturer(mut self, v: u16) -> Self {
        self.manufacturer = v & 0x07FF;
        self
    }

    #[must_use]
    pub fn ecu_instance(mut self, v: u8) -> Self {
        self.ecu_instance = v & 0x07;
        self
    }

    #[must_use]
    pub fn function_instance(mut self, v: u8) -> Self {
        self.function_instance = v & 0x1F;
        self
    }

    #[must_use]
    pub fn function(mut self, v: u8) -> Self {
        self.function = v;
        self
    }

    #[must_use]
    pub fn class(mut self, v: u8) -> Self {
        self.class = v & 0x7F;
        self
    }

    #[must_use]
    pub fn class_instance(mut self, v: u8) -> Self {
        self.class_instance = v & 0x0F;
        self
    }

    #[must_use]
    pub fn industry_group(mut self, v: u8) -> Self {
        self.industry_group = v & 0x07;
        self
    }

    #[must_use]
    pub fn self_configurable(mut self, v: bool) -> Self {
        self.self_configurable = v;
        self
    }

    #[must_use]
    pub fn build(self) -> Name {
        let mut raw = u64::from(self.identity) << ID_POS
            | u64::from(self.manufacturer) << MAN_POS
            | u64::from(self.ecu_instance) << ECU_POS
            | u64::from(self.function_instance) << FINST_POS
            | u64::from(self.function) << FUNC_POS
            | u64::from(self.class) << CLASS_POS
            | u64::from(self.class_instance) << CINST_POS
            | u64::from(self.industry_group) << IG_POS;
        if self.self_configurable {
            raw |= SC_BIT;
        }
        Name(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_roundtrip() {
        let name = NameBuilder::new()
            .identity(0x1234)
            .manufacturer(0x321)
            .ecu_instance(3)
            .function_instance(7)
            .function(130)
            .class(17)
            .class_instance(2)
            .industry_group(2)
            .self_configurable(true)
            .build();

        assert_eq!(name.identity(), 0x1234);
        assert_eq!(name.manufacturer(), 0x321);
        assert_eq!(name.ecu_instance(), 3);
        assert_eq!(name.function_instance(), 7);
        assert_eq!(name.function(), 130);
        assert_eq!(name.class(), 17);
        assert_eq!(name.class_instance(), 2);
        assert_eq!(name.industry_group(), 2);
        assert!(name.is_self_configurable());
    }

    #[test]
    fn wire_roundtrip_is_little_endian() {
        let name = Name::new(0x0102_0304_0506_0708);
        let bytes = name.to_le_bytes();
        assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(Name::from_le_bytes(bytes), name);
    }

    #[test]
    fn lower_name_wins_arbitration() {
        let low = Name::new(10);
        let high = Name::new(20);
        assert!(low < high);
    }

    #[test]
    fn self_configurable_bit_is_isolated() {
        let plain = NameBuilder::new().identity(5).build();
        let sc = NameBuilder::new().identity(5).self_configurable(true).build();
        assert!(!plain.is_self_configurable());
        assert!(sc.is_self_configurable());
        assert_eq!(plain.identity(), sc.identity());
    }
}
