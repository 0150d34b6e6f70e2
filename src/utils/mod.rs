/// Compute CRC16 (XMODEM) hash over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Trim hash tags: the bytes between the first open delimiter and the first
/// close delimiter after it replace the key. A missing close or an empty tag
/// keeps the whole key.
pub fn trim_hash_tag<'a>(key: &'a [u8], hash_tag: Option<&[u8]>) -> &'a [u8] {
    let tag = match hash_tag {
        Some(tag) if tag.len() == 2 => tag,
        _ => return key,
    };

    let (start, end) = (tag[0], tag[1]);

    if let Some(begin) = key.iter().position(|&b| b == start) {
        if let Some(offset) = key[begin + 1..].iter().position(|&b| b == end) {
            if offset > 0 {
                let start_idx = begin + 1;
                return &key[start_idx..start_idx + offset];
            }
        }
    }
    key
}
