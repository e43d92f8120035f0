//! Configuration-space byte order
//!
//! PCI configuration space is little-endian on the wire regardless of the
//! host. Backends hand back raw wire bytes; these helpers convert between
//! that order and host integers.

/// Host value of a little-endian 16-bit wire word
#[inline]
pub fn u16_from_wire(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

/// Host value of a little-endian 32-bit wire dword
#[inline]
pub fn u32_from_wire(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// Wire bytes for a host 16-bit value
#[inline]
pub fn u16_to_wire(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Wire bytes for a host 32-bit value
#[inline]
pub fn u32_to_wire(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Little-endian 16-bit field at `offset` of a config-space snapshot
#[inline]
pub fn read_u16_at(buf: &[u8], offset: usize) -> u16 {
    u16_from_wire([buf[offset], buf[offset + 1]])
}

/// Little-endian 32-bit field at `offset` of a config-space snapshot
#[inline]
pub fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
    u32_from_wire([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_order_is_little_endian() {
        assert_eq!(u16_from_wire([0x86, 0x80]), 0x8086);
        assert_eq!(u32_from_wire([0x00, 0x04, 0x06, 0x01]), 0x0106_0400);
        assert_eq!(u16_to_wire(0x1002), [0x02, 0x10]);
        assert_eq!(u32_to_wire(0xdead_beef), [0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_snapshot_fields() {
        let buf = [0x02, 0x10, 0x98, 0x67, 0x07, 0x00, 0x10, 0x00];
        assert_eq!(read_u16_at(&buf, 0), 0x1002);
        assert_eq!(read_u16_at(&buf, 2), 0x6798);
        assert_eq!(read_u32_at(&buf, 4), 0x0010_0007);
    }
}
