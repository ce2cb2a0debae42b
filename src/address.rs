use crate::constants::BD_ADDR_LENGTH;

/// A Bluetooth Device Address (`BD_ADDR`) identifying the peer of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BluetoothAddress(pub [u8; BD_ADDR_LENGTH]);

impl BluetoothAddress {
    /// Create a new Bluetooth address from bytes
    #[must_use]
    pub const fn new(addr: [u8; BD_ADDR_LENGTH]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BD_ADDR_LENGTH] {
        &self.0
    }
}

impl core::fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl From<[u8; BD_ADDR_LENGTH]> for BluetoothAddress {
    fn from(addr: [u8; BD_ADDR_LENGTH]) -> Self {
        Self(addr)
    }
}

impl From<BluetoothAddress> for [u8; BD_ADDR_LENGTH] {
    fn from(addr: BluetoothAddress) -> Self {
        addr.0
    }
}

impl From<BluetoothAddress> for bt_hci::param::BdAddr {
    fn from(addr: BluetoothAddress) -> Self {
        bt_hci::param::BdAddr::new(addr.0)
    }
}

impl From<bt_hci::param::BdAddr> for BluetoothAddress {
    fn from(bd_addr: bt_hci::param::BdAddr) -> Self {
        let mut bytes = [0u8; BD_ADDR_LENGTH];
        for (dst, src) in bytes.iter_mut().zip(bd_addr.raw().iter()) {
            *dst = *src;
        }
        Self(bytes)
    }
}
