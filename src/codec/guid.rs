//! Random GUID generation and formatting.

use rand::RngCore;

/// Generate a version-4, variant-1 GUID: 16 random bytes with the version
/// nibble forced to 4 and the variant bits to 10.
pub fn generate() -> [u8; 16] {
    let mut guid = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut guid);
    guid[6] = (guid[6] & 0x0F) | 0x40;
    guid[8] = (guid[8] & 0x3F) | 0x80;
    guid
}

/// Render a GUID in the canonical GPT text form. The first three groups
/// are stored little-endian on disk, so they are byte-swapped for
/// display.
pub fn format(guid: &[u8; 16]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        guid[3], guid[2], guid[1], guid[0],
        guid[5], guid[4],
        guid[7], guid[6],
        guid[8], guid[9],
        guid[10], guid[11], guid[12], guid[13], guid[14], guid[15],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::gpt::type_guid;

    #[test]
    fn version_and_variant_bits() {
        for _ in 0..64 {
            let guid = generate();
            assert_eq!(guid[6] & 0xF0, 0x40, "version nibble must be 4");
            assert_eq!(guid[8] & 0xC0, 0x80, "variant bits must be 10");
        }
    }

    #[test]
    fn consecutive_guids_differ() {
        assert_ne!(generate(), generate());
    }

    #[test]
    fn formats_known_guid() {
        assert_eq!(
            format(&type_guid::EFI_SYSTEM),
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
        );
    }
}
