//! Branch-free lowercase hex rendering for path names.
//!
//! Nibbles are spread one per byte with a shift/mask ladder, then mapped to
//! ASCII for every byte at once.

const ONES64: u64 = 0x0101_0101_0101_0101;
const ONES32: u32 = 0x0101_0101;

#[inline]
fn nibbles_to_ascii64(x: u64) -> u64 {
    // 1 in every byte whose nibble is >= 10
    let letters = ((x + 0x0606_0606_0606_0606) >> 4) & ONES64;
    x + 0x3030_3030_3030_3030 + letters * 0x27
}

#[inline]
fn nibbles_to_ascii32(x: u32) -> u32 {
    let letters = ((x + 0x0606_0606) >> 4) & ONES32;
    x + 0x3030_3030 + letters * 0x27
}

/// Render 2 hex digits
#[inline]
pub fn put8(v: u8) -> [u8; 2] {
    let x = v as u16;
    let x = (x | (x << 4)) & 0x0F0F;
    let letters = ((x + 0x0606) >> 4) & 0x0101;
    (x + 0x3030 + letters * 0x27).to_be_bytes()
}

/// Render 4 hex digits
#[inline]
pub fn put16(v: u16) -> [u8; 4] {
    let x = v as u32;
    let x = (x | (x << 8)) & 0x00FF_00FF;
    let x = (x | (x << 4)) & 0x0F0F_0F0F;
    nibbles_to_ascii32(x).to_be_bytes()
}

/// Render 8 hex digits
#[inline]
pub fn put32(v: u32) -> [u8; 8] {
    let x = v as u64;
    let x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    let x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    let x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    nibbles_to_ascii64(x).to_be_bytes()
}

#[inline]
fn is_digit(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Parse exactly 2 lowercase hex digits
pub fn get8(s: &[u8]) -> Option<u8> {
    if s.len() != 2 || !s.iter().all(|b| is_digit(*b)) {
        return None;
    }
    let x = u16::from_be_bytes([s[0], s[1]]);
    let x = (x & 0x0F0F) + ((x >> 6) & 0x0101) * 9;
    Some(((x >> 4) | x) as u8)
}

/// Parse exactly 4 lowercase hex digits
pub fn get16(s: &[u8]) -> Option<u16> {
    let bytes: [u8; 4] = s.try_into().ok()?;
    if !bytes.iter().all(|b| is_digit(*b)) {
        return None;
    }
    let x = u32::from_be_bytes(bytes);
    let x = (x & 0x0F0F_0F0F) + ((x >> 6) & ONES32) * 9;
    let x = (x | (x >> 4)) & 0x00FF_00FF;
    let x = (x | (x >> 8)) & 0x0000_FFFF;
    Some(x as u16)
}

/// Parse exactly 8 lowercase hex digits
pub fn get32(s: &[u8]) -> Option<u32> {
    let bytes: [u8; 8] = s.try_into().ok()?;
    if !bytes.iter().all(|b| is_digit(*b)) {
        return None;
    }
    let x = u64::from_be_bytes(bytes);
    let x = (x & 0x0F0F_0F0F_0F0F_0F0F) + ((x >> 6) & ONES64) * 9;
    let x = (x | (x >> 4)) & 0x00FF_00FF_00FF_00FF;
    let x = (x | (x >> 8)) & 0x0000_FFFF_0000_FFFF;
    let x = (x | (x >> 16)) & 0x0000_0000_FFFF_FFFF;
    Some(x as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_format() {
        for v in [0u32, 1, 9, 10, 15, 16, 0xdead_beef, 0x0123_4567, u32::MAX] {
            assert_eq!(put32(v), format!("{:08x}", v).as_bytes(), "{v:#x}");
            assert_eq!(get32(&put32(v)), Some(v));
        }
        for v in [0u16, 0xa, 0xabcd, 0x1234, u16::MAX] {
            assert_eq!(put16(v), format!("{:04x}", v).as_bytes());
            assert_eq!(get16(&put16(v)), Some(v));
        }
        for v in 0..=255u8 {
            assert_eq!(put8(v), format!("{:02x}", v).as_bytes());
            assert_eq!(get8(&put8(v)), Some(v));
        }
    }

    #[test]
    fn test_rejects_uppercase_and_junk() {
        assert_eq!(get32(b"DEADBEEF"), None);
        assert_eq!(get32(b"0000000g"), None);
        assert_eq!(get32(b"0000000"), None);
        assert_eq!(get16(b"12 4"), None);
    }
}
