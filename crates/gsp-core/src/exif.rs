//! Focal-length metadata.
//!
//! The predictor reads the camera focal length from JPEG Exif when
//! estimating geometry. Upstream metadata usually has the value but the
//! downloaded files often lack the tag, so the discover stage can inject a
//! minimal Exif APP1 segment (one FocalLength rational) into files that
//! have none. Only the structures needed for that one tag are implemented.

use std::path::Path;

/// FocalLength tag id in the Exif IFD.
const TAG_FOCAL_LENGTH: u16 = 0x920A;
/// Pointer from IFD0 to the Exif IFD.
const TAG_EXIF_IFD: u16 = 0x8769;

/// Parsed upstream focal length: raw display form, min, max, average.
/// Ranges like "24-70mm" keep their endpoints; plain values collapse.
pub fn parse_focal_length(value: &serde_json::Value) -> Option<(String, f64, f64, f64)> {
    match value {
        serde_json::Value::Number(n) => {
            let v = n.as_f64()?;
            (v > 0.0).then(|| (format!("{v}mm"), v, v, v))
        }
        serde_json::Value::String(s) => parse_focal_length_str(s),
        _ => None,
    }
}

fn parse_focal_length_str(s: &str) -> Option<(String, f64, f64, f64)> {
    let low = s.trim().to_ascii_lowercase();
    if low.is_empty() {
        return None;
    }
    let mut nums = Vec::new();
    let mut cur = String::new();
    for ch in low.chars() {
        if ch.is_ascii_digit() || (ch == '.' && !cur.contains('.') && !cur.is_empty()) {
            cur.push(ch);
        } else if !cur.is_empty() {
            if let Ok(v) = cur.parse::<f64>() {
                nums.push(v);
            }
            cur.clear();
        }
    }
    if !cur.is_empty() {
        if let Ok(v) = cur.parse::<f64>() {
            nums.push(v);
        }
    }
    if nums.is_empty() {
        return None;
    }
    let is_range = nums.len() >= 2 && (low.contains('-') || low.contains(" to "));
    if is_range {
        let mn = nums[0].min(nums[1]);
        let mx = nums[0].max(nums[1]);
        return Some((format!("{mn}-{mx}mm"), mn, mx, (mn + mx) / 2.0));
    }
    let v = nums[0];
    (v > 0.0).then(|| (format!("{v}mm"), v, v, v))
}

fn read_u16(bytes: &[u8], at: usize, le: bool) -> Option<u16> {
    let b: [u8; 2] = bytes.get(at..at + 2)?.try_into().ok()?;
    Some(if le {
        u16::from_le_bytes(b)
    } else {
        u16::from_be_bytes(b)
    })
}

fn read_u32(bytes: &[u8], at: usize, le: bool) -> Option<u32> {
    let b: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(if le {
        u32::from_le_bytes(b)
    } else {
        u32::from_be_bytes(b)
    })
}

/// Scan an IFD for a tag, returning its value/offset word. Entry layout:
/// tag(2) type(2) count(4) value(4).
fn find_tag(tiff: &[u8], ifd_offset: usize, le: bool, tag: u16) -> Option<u32> {
    let count = read_u16(tiff, ifd_offset, le)? as usize;
    for i in 0..count {
        let entry = ifd_offset + 2 + i * 12;
        if read_u16(tiff, entry, le)? == tag {
            return read_u32(tiff, entry + 8, le);
        }
    }
    None
}

/// True when a TIFF blob (Exif payload after the `Exif\0\0` marker) carries
/// a FocalLength tag in its Exif IFD.
fn tiff_has_focal_length(tiff: &[u8]) -> bool {
    let le = match tiff.get(0..2) {
        Some(b"II") => true,
        Some(b"MM") => false,
        _ => return false,
    };
    let Some(ifd0) = read_u32(tiff, 4, le) else {
        return false;
    };
    let Some(exif_ifd) = find_tag(tiff, ifd0 as usize, le, TAG_EXIF_IFD) else {
        return false;
    };
    find_tag(tiff, exif_ifd as usize, le, TAG_FOCAL_LENGTH).is_some()
}

/// Walk JPEG segments up to SOS, yielding (marker, payload range).
fn for_each_segment(bytes: &[u8], mut f: impl FnMut(u8, usize, usize) -> bool) {
    if bytes.len() < 2 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return;
    }
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return;
        }
        let marker = bytes[pos + 1];
        // SOS: entropy-coded data follows, no more tagged segments.
        if marker == 0xDA {
            return;
        }
        // Standalone markers without a length.
        if (0xD0..=0xD9).contains(&marker) {
            pos += 2;
            continue;
        }
        let Some(len) = read_u16(bytes, pos + 2, false) else {
            return;
        };
        let len = len as usize;
        if len < 2 || pos + 2 + len > bytes.len() {
            return;
        }
        if !f(marker, pos, pos + 2 + len) {
            return;
        }
        pos += 2 + len;
    }
}

/// True when the JPEG already carries an Exif APP1 with a FocalLength tag.
pub fn has_focal_length(path: &Path) -> bool {
    let Ok(bytes) = std::fs::read(path) else {
        return false;
    };
    let mut found = false;
    for_each_segment(&bytes, |marker, start, end| {
        if marker == 0xE1 {
            let payload = &bytes[start + 4..end];
            if payload.len() > 6 && &payload[..6] == b"Exif\0\0" {
                found = tiff_has_focal_length(&payload[6..]);
                return false;
            }
        }
        true
    });
    found
}

/// Build a minimal Exif APP1 segment carrying one FocalLength rational.
fn build_exif_app1(focal_mm: f64) -> Vec<u8> {
    // Little-endian TIFF. IFD0 holds the Exif-IFD pointer; the Exif IFD
    // holds FocalLength with its rational stored right after.
    let mut tiff: Vec<u8> = Vec::new();
    tiff.extend_from_slice(b"II");
    tiff.extend_from_slice(&42u16.to_le_bytes());
    tiff.extend_from_slice(&8u32.to_le_bytes()); // IFD0 offset

    // IFD0: 1 entry, Exif IFD pointer, next-IFD = 0.
    let ifd0_len = 2 + 12 + 4;
    let exif_ifd_offset = 8 + ifd0_len as u32;
    tiff.extend_from_slice(&1u16.to_le_bytes());
    tiff.extend_from_slice(&TAG_EXIF_IFD.to_le_bytes());
    tiff.extend_from_slice(&4u16.to_le_bytes()); // LONG
    tiff.extend_from_slice(&1u32.to_le_bytes());
    tiff.extend_from_slice(&exif_ifd_offset.to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes());

    // Exif IFD: 1 entry, FocalLength RATIONAL, value stored after the IFD.
    let value_offset = exif_ifd_offset + (2 + 12 + 4);
    tiff.extend_from_slice(&1u16.to_le_bytes());
    tiff.extend_from_slice(&TAG_FOCAL_LENGTH.to_le_bytes());
    tiff.extend_from_slice(&5u16.to_le_bytes()); // RATIONAL
    tiff.extend_from_slice(&1u32.to_le_bytes());
    tiff.extend_from_slice(&value_offset.to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes());

    let numerator = (focal_mm * 100.0).round().max(0.0) as u32;
    tiff.extend_from_slice(&numerator.to_le_bytes());
    tiff.extend_from_slice(&100u32.to_le_bytes());

    let mut payload = b"Exif\0\0".to_vec();
    payload.extend_from_slice(&tiff);

    let mut segment = vec![0xFF, 0xE1];
    segment.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    segment.extend_from_slice(&payload);
    segment
}

/// Insert a minimal FocalLength Exif segment right after SOI if the file
/// does not already carry the tag. Returns whether the file was modified.
pub fn inject_focal_length(path: &Path, focal_mm: f64) -> std::io::Result<bool> {
    if focal_mm <= 0.0 || has_focal_length(path) {
        return Ok(false);
    }
    let bytes = std::fs::read(path)?;
    if bytes.len() < 2 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Ok(false);
    }
    let segment = build_exif_app1(focal_mm);
    let mut out = Vec::with_capacity(bytes.len() + segment.len());
    out.extend_from_slice(&bytes[..2]);
    out.extend_from_slice(&segment);
    out.extend_from_slice(&bytes[2..]);
    std::fs::write(path, out)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_range_values() {
        let (raw, mn, mx, avg) =
            parse_focal_length(&serde_json::json!("24mm")).unwrap();
        assert_eq!((raw.as_str(), mn, mx, avg), ("24mm", 24.0, 24.0, 24.0));

        let (raw, mn, mx, avg) =
            parse_focal_length(&serde_json::json!("24-70mm")).unwrap();
        assert_eq!((raw.as_str(), mn, mx, avg), ("24-70mm", 24.0, 70.0, 47.0));

        let (_, _, _, avg) = parse_focal_length(&serde_json::json!(35.5)).unwrap();
        assert_eq!(avg, 35.5);

        assert!(parse_focal_length(&serde_json::json!("")).is_none());
        assert!(parse_focal_length(&serde_json::json!("zoom lens")).is_none());
        assert!(parse_focal_length(&serde_json::json!(0)).is_none());
        assert!(parse_focal_length(&serde_json::Value::Null).is_none());
    }

    /// Tiny but structurally valid JPEG: SOI, APP0 stub, SOS marker.
    fn minimal_jpeg() -> Vec<u8> {
        let mut b = vec![0xFF, 0xD8];
        b.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x4A, 0x46]); // APP0
        b.extend_from_slice(&[0xFF, 0xDA]); // SOS
        b.extend_from_slice(&[0x00, 0x00, 0xFF, 0xD9]);
        b
    }

    #[test]
    fn inject_then_detect_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = dir.path().join("x.jpg");
        std::fs::write(&p, minimal_jpeg()).unwrap();
        assert!(!has_focal_length(&p));

        assert!(inject_focal_length(&p, 47.0).unwrap());
        assert!(has_focal_length(&p));

        // Second injection is a no-op.
        assert!(!inject_focal_length(&p, 24.0).unwrap());

        // Original payload still present after the inserted segment.
        let bytes = std::fs::read(&p).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert!(bytes.windows(2).any(|w| w == [0xFF, 0xDA]));
    }

    #[test]
    fn non_jpeg_is_left_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = dir.path().join("x.png");
        std::fs::write(&p, b"\x89PNG\r\n").unwrap();
        assert!(!inject_focal_length(&p, 47.0).unwrap());
        assert!(!has_focal_length(&p));
    }

    #[test]
    fn app1_segment_is_well_formed() {
        let seg = build_exif_app1(47.0);
        assert_eq!(&seg[..2], &[0xFF, 0xE1]);
        let len = u16::from_be_bytes([seg[2], seg[3]]) as usize;
        assert_eq!(len + 2, seg.len());
        assert_eq!(&seg[4..10], b"Exif\0\0");
        assert!(tiff_has_focal_length(&seg[10..]));
    }
}
