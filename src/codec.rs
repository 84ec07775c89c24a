//! decoding of the binary objectGUID and objectSID attributes used by
//! Active Directory

use itertools::Itertools;

/// convert a binary objectGUID into its dashed string form
/// (e.g. `F5B1C3D2-...`)
///
/// the first three blocks are stored little endian, the last two as is;
/// returns `None` if the value is not exactly 16 bytes long
pub fn convert_object_guid_to_str(guid: &[u8]) -> Option<String> {
    if guid.len() != 16 {
        return None;
    }
    Some(format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{}-{}",
        guid[3],
        guid[2],
        guid[1],
        guid[0],
        guid[5],
        guid[4],
        guid[7],
        guid[6],
        hex::encode_upper(&guid[8..10]),
        hex::encode_upper(&guid[10..16]),
    ))
}

/// the inverse of [convert_object_guid_to_str]
pub fn parse_object_guid_str(guid: &str) -> Option<[u8; 16]> {
    let blocks: Vec<&str> = guid.split('-').collect();
    if blocks.len() != 5 || blocks.iter().map(|b| b.len()).collect::<Vec<_>>() != [8, 4, 4, 4, 12]
    {
        return None;
    }
    let mut bytes = [0u8; 16];
    let mut position = 0;
    for (index, block) in blocks.iter().enumerate() {
        let mut decoded = hex::decode(block).ok()?;
        if index < 3 {
            decoded.reverse();
        }
        bytes[position..position + decoded.len()].copy_from_slice(&decoded);
        position += decoded.len();
    }
    Some(bytes)
}

/// reshape a GUID string so it can be used in a search filter on a binary
/// objectGUID attribute: the byte pairs of the first three blocks are
/// reversed and every byte is written as `\XX`
///
/// values which are not made of five blocks are returned unchanged
pub fn format_guid_for_filter(guid: &str) -> String {
    let blocks: Vec<&str> = guid.split('-').collect();
    if blocks.len() != 5 {
        tracing::info!(
            "Passed string does not resemble a valid GUID. Known UUID ({}) probably does not match UUID configuration.",
            guid
        );
        return guid.to_string();
    }
    blocks
        .iter()
        .enumerate()
        .map(|(index, block)| {
            let pairs: Vec<String> = block
                .chars()
                .chunks(2)
                .into_iter()
                .map(|pair| pair.collect::<String>())
                .collect();
            let pairs: Box<dyn Iterator<Item = String>> = if index < 3 {
                Box::new(pairs.into_iter().rev())
            } else {
                Box::new(pairs.into_iter())
            };
            pairs.map(|pair| format!("\\{}", pair)).collect::<String>()
        })
        .collect()
}

/// convert a binary objectSID into the `S-R-A-S1-S2-...` string form
///
/// byte 0 is the revision, byte 1 the number of sub authorities, bytes 2-7
/// the big endian identifier authority, followed by the little endian 32 bit
/// sub authorities; returns an empty string on a length mismatch
pub fn convert_sid_to_str(sid: &[u8]) -> String {
    if sid.len() < 8 {
        return String::new();
    }
    let revision = sid[0];
    let sub_authority_count = sid[1] as usize;
    if sid.len() != 8 + 4 * sub_authority_count {
        return String::new();
    }
    let authority = sid[2..8]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    let sub_authorities = sid[8..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
    std::iter::once(format!("S-{}-{}", revision, authority))
        .chain(sub_authorities.map(|s| s.to_string()))
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_is_decoded_with_mixed_endianness() {
        let guid = hex::decode("d2c3b1f5a4b9c8d7e6f5a1b2c3d4e5f6").unwrap();
        assert_eq!(
            convert_object_guid_to_str(&guid).as_deref(),
            Some("F5B1C3D2-B9A4-D7C8-E6F5-A1B2C3D4E5F6")
        );
    }

    #[test]
    fn guid_decoding_is_lossless() {
        let guid: Vec<u8> = (0u8..16).map(|b| b.wrapping_mul(37).wrapping_add(5)).collect();
        let text = convert_object_guid_to_str(&guid).unwrap();
        assert_eq!(parse_object_guid_str(&text).unwrap().to_vec(), guid);
    }

    #[test]
    fn guid_of_wrong_length_is_rejected() {
        assert_eq!(convert_object_guid_to_str(&[1, 2, 3]), None);
        assert_eq!(parse_object_guid_str("not-a-guid"), None);
    }

    #[test]
    fn guid_is_formatted_for_filters() {
        assert_eq!(
            format_guid_for_filter("F5B1C3D2-B9A4-D7C8-E6F5-A1B2C3D4E5F6"),
            "\\D2\\C3\\B1\\F5\\A4\\B9\\C8\\D7\\E6\\F5\\A1\\B2\\C3\\D4\\E5\\F6"
        );
        assert_eq!(format_guid_for_filter("abc-def"), "abc-def");
    }

    #[test]
    fn sid_is_decoded() {
        let sid = hex::decode("010400000000000515000000a681e50e4d6c6c2bca32055f").unwrap();
        assert_eq!(
            convert_sid_to_str(&sid),
            "S-1-5-21-249921958-728525901-1594176202"
        );
    }

    #[test]
    fn sid_with_length_mismatch_is_empty() {
        let sid = hex::decode("010400000000000515000000a681e50e").unwrap();
        assert_eq!(convert_sid_to_str(&sid), "");
        assert_eq!(convert_sid_to_str(&[1]), "");
    }
}
