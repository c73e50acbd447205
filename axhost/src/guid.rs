// SPDX-License-Identifier: GPL-3.0-or-later

use windows_core::GUID;

/// Parses the registry form of a GUID (`{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`),
/// braces optional.
pub fn parse_guid(text: &str) -> Option<GUID> {
    let text = text.trim();
    let text = text
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .unwrap_or(text);
    if text.len() != 36 {
        return None;
    }
    let mut value = 0u128;
    for (i, byte) in text.bytes().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if byte != b'-' {
                    return None;
                }
            }
            _ => {
                let digit = char::from(byte).to_digit(16)?;
                value = (value << 4) | u128::from(digit);
            }
        }
    }
    Some(GUID::from_u128(value))
}

pub fn format_guid(guid: &GUID) -> String {
    let value = guid.to_u128();
    format!(
        "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
        value >> 96,
        (value >> 80) & 0xFFFF,
        (value >> 64) & 0xFFFF,
        (value >> 48) & 0xFFFF,
        value & 0xFFFF_FFFF_FFFF
    )
}
