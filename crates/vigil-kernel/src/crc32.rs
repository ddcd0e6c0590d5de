//! Table-driven CRC-32 (IEEE 802.3, polynomial `0xEDB88320`).
//!
//! Used by the [memory guard](crate::memory_guard) purely as a corruption
//! detector over protected regions; it carries no cryptographic strength.

/// CRC-32 lookup table (IEEE polynomial), built at compile time.
const CRC32_TABLE: [u32; 256] = {
    let polynomial: u32 = 0xEDB8_8320;
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ polynomial;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Compute the CRC-32 (IEEE) checksum of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = u32::MAX;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
