// src/exec/encoding.rs

//! Legacy double-byte (GBK) detection and transcoding for step output and
//! Windows console scripts.

use std::borrow::Cow;

use encoding_rs::GBK;
use tracing::warn;

/// Windows code page identifier for simplified Chinese (GBK).
pub const CP_GBK: u32 = 936;

/// Whether `data` is plausibly GBK: ASCII bytes, or lead bytes `0x81..=0xFE`
/// each followed by a trail byte in `0x40..=0xFE` (excluding `0xF7`).
pub fn is_gbk(data: &[u8]) -> bool {
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b <= 0x7f {
            i += 1;
            continue;
        }
        let Some(&trail) = data.get(i + 1) else {
            return false;
        };
        if (0x81..=0xfe).contains(&b) && (0x40..=0xfe).contains(&trail) && trail != 0xf7 {
            i += 2;
        } else {
            return false;
        }
    }
    true
}

/// Decode GBK bytes to a UTF-8 string. Malformed sequences become U+FFFD.
pub fn gbk_to_utf8(data: &[u8]) -> String {
    let (text, _, had_errors) = GBK.decode(data);
    if had_errors {
        warn!("output line contained bytes outside GBK; replaced");
    }
    text.into_owned()
}

/// Encode `text` for a console using the GBK code page.
///
/// Characters with no GBK mapping are written as HTML numeric references by
/// `encoding_rs`; the result is logged.
pub fn utf8_to_gbk(text: &str) -> Cow<'_, [u8]> {
    let (bytes, _, had_errors) = GBK.encode(text);
    if had_errors {
        warn!("script content contains characters without a GBK mapping");
    }
    bytes
}

/// Active ANSI code page of the process, when the platform has one.
#[cfg(windows)]
pub fn active_code_page() -> Option<u32> {
    // SAFETY: GetACP takes no arguments and only reads process state.
    Some(unsafe { windows::Win32::Globalization::GetACP() })
}

#[cfg(not(windows))]
pub fn active_code_page() -> Option<u32> {
    None
}

/// Turn one raw output line into text.
///
/// The line is trimmed first. It is decoded as GBK when it is not valid
/// UTF-8 but looks like GBK, or when `force_gbk` is set (Windows console
/// shell on a GBK code page) and the line is not pure ASCII. Anything else is
/// decoded lossily as UTF-8.
pub fn normalize_line(raw: &[u8], force_gbk: bool) -> String {
    let trimmed = raw.trim_ascii();

    if trimmed.is_ascii() {
        // ASCII is identical in both encodings.
        return String::from_utf8_lossy(trimmed).into_owned();
    }

    if force_gbk {
        return gbk_to_utf8(trimmed);
    }

    match std::str::from_utf8(trimmed) {
        Ok(s) => s.to_string(),
        Err(_) if is_gbk(trimmed) => gbk_to_utf8(trimmed),
        Err(_) => String::from_utf8_lossy(trimmed).into_owned(),
    }
}
