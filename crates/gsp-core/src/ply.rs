//! Minimal PLY header handling.
//!
//! Some predictor outputs carry extra elements after `vertex` (camera
//! extrinsics/intrinsics) that the spz encoders reject. This module detects
//! that case and rewrites the file as a vertex-only binary-little-endian
//! PLY, preserving the vertex properties bit for bit (binary input) or
//! packing them (ascii input). List properties and unknown scalar types
//! are not supported and abort the rewrite.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ascii,
    BinaryLittleEndian,
}

/// Scalar property type with its on-disk width.
fn scalar_width(ty: &str) -> Option<usize> {
    match ty {
        "char" | "int8" | "uchar" | "uint8" => Some(1),
        "short" | "int16" | "ushort" | "uint16" => Some(2),
        "int" | "int32" | "uint" | "uint32" | "float" | "float32" => Some(4),
        "double" | "float64" => Some(8),
        _ => None,
    }
}

struct Header {
    format: Format,
    vertex_count: usize,
    /// (type, name) pairs of the vertex element, in order.
    vertex_props: Vec<(String, String)>,
    has_non_vertex: bool,
}

fn read_header(reader: &mut impl BufRead) -> Option<Header> {
    let mut format = None;
    let mut vertex_count = None;
    let mut vertex_props = Vec::new();
    let mut in_vertex = false;
    let mut seen_vertex = false;
    let mut has_non_vertex = false;

    loop {
        let mut raw = Vec::new();
        if reader.read_until(b'\n', &mut raw).ok()? == 0 {
            return None;
        }
        let line = String::from_utf8_lossy(&raw);
        let low = line.trim().to_ascii_lowercase();
        if low == "end_header" {
            break;
        }
        if let Some(rest) = low.strip_prefix("format ") {
            format = match rest.split_whitespace().next() {
                Some("ascii") => Some(Format::Ascii),
                Some("binary_little_endian") => Some(Format::BinaryLittleEndian),
                _ => None,
            };
        } else if let Some(rest) = low.strip_prefix("element ") {
            let mut parts = rest.split_whitespace();
            let name = parts.next()?;
            let count = parts.next()?;
            if name == "vertex" {
                vertex_count = count.parse().ok();
                in_vertex = true;
                seen_vertex = true;
            } else {
                in_vertex = false;
                if seen_vertex {
                    has_non_vertex = true;
                }
            }
        } else if in_vertex {
            if let Some(rest) = low.strip_prefix("property ") {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                if parts.len() < 2 {
                    continue;
                }
                if parts[0] == "list" {
                    return None;
                }
                vertex_props.push((parts[0].to_string(), parts[1].to_string()));
            }
        }
    }

    let format = format?;
    let vertex_count = vertex_count?;
    if vertex_count == 0 || vertex_props.is_empty() {
        return None;
    }
    if vertex_props.iter().any(|(t, _)| scalar_width(t).is_none()) {
        return None;
    }
    Some(Header {
        format,
        vertex_count,
        vertex_props,
        has_non_vertex,
    })
}

/// True when the file has elements after `vertex` (extrinsics, intrinsics)
/// that a splat encoder would choke on.
pub fn has_non_vertex_elements(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut reader = BufReader::new(file);
    read_header(&mut reader)
        .map(|h| h.has_non_vertex)
        .unwrap_or(false)
}

fn emit_header(out: &mut impl Write, h: &Header) -> std::io::Result<()> {
    writeln!(out, "ply")?;
    writeln!(out, "format binary_little_endian 1.0")?;
    writeln!(out, "comment vertex-only rewrite")?;
    writeln!(out, "element vertex {}", h.vertex_count)?;
    for (ty, name) in &h.vertex_props {
        writeln!(out, "property {ty} {name}")?;
    }
    writeln!(out, "end_header")?;
    Ok(())
}

fn write_ascii_value(out: &mut Vec<u8>, ty: &str, token: &str) -> Option<()> {
    let f: f64 = token.parse().ok()?;
    match ty {
        "char" | "int8" => out.push((f as i8) as u8),
        "uchar" | "uint8" => out.push(f as u8),
        "short" | "int16" => out.extend_from_slice(&(f as i16).to_le_bytes()),
        "ushort" | "uint16" => out.extend_from_slice(&(f as u16).to_le_bytes()),
        "int" | "int32" => out.extend_from_slice(&(f as i32).to_le_bytes()),
        "uint" | "uint32" => out.extend_from_slice(&(f as u32).to_le_bytes()),
        "float" | "float32" => out.extend_from_slice(&(f as f32).to_le_bytes()),
        "double" | "float64" => out.extend_from_slice(&f.to_le_bytes()),
        _ => return None,
    }
    Some(())
}

/// Rewrite `input` as `<stem>.vertexonly.binary.ply` next to it, dropping
/// everything after the vertex data. Reuses an existing non-empty output.
pub fn make_vertex_only_binary(input: &Path) -> Option<PathBuf> {
    let out_path = {
        let stem = input.file_stem()?.to_string_lossy();
        input.with_file_name(format!("{stem}.vertexonly.binary.ply"))
    };
    if std::fs::metadata(&out_path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
    {
        return Some(out_path);
    }

    let file = std::fs::File::open(input).ok()?;
    let mut reader = BufReader::new(file);
    let header = read_header(&mut reader)?;

    let mut out = std::fs::File::create(&out_path).ok()?;
    if emit_header(&mut out, &header).is_err() {
        let _ = std::fs::remove_file(&out_path);
        return None;
    }

    let wrote = match header.format {
        Format::BinaryLittleEndian => {
            let per_vertex: usize = header
                .vertex_props
                .iter()
                .map(|(t, _)| scalar_width(t).unwrap_or(0))
                .sum();
            let need = per_vertex * header.vertex_count;
            let mut data = vec![0u8; need];
            reader
                .read_exact(&mut data)
                .is_ok()
                .then(|| out.write_all(&data).is_ok())
                .unwrap_or(false)
        }
        Format::Ascii => {
            let mut buf = Vec::with_capacity(header.vertex_count * 32);
            let mut ok = true;
            'rows: for _ in 0..header.vertex_count {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    ok = false;
                    break;
                }
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() < header.vertex_props.len() {
                    ok = false;
                    break;
                }
                for ((ty, _), tok) in header.vertex_props.iter().zip(tokens.iter()) {
                    if write_ascii_value(&mut buf, ty, tok).is_none() {
                        ok = false;
                        break 'rows;
                    }
                }
            }
            ok && out.write_all(&buf).is_ok()
        }
    };

    if !wrote {
        let _ = std::fs::remove_file(&out_path);
        return None;
    }
    Some(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_binary_ply(path: &Path, trailer: &str) {
        let mut header = String::from(
            "ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
             property float x\nproperty float y\n",
        );
        header.push_str(trailer);
        header.push_str("end_header\n");
        let mut bytes = header.into_bytes();
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        // Trailing non-vertex payload the rewrite must drop.
        bytes.extend_from_slice(b"JUNK");
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn detects_non_vertex_elements() {
        let dir = tempfile::TempDir::new().unwrap();
        let plain = dir.path().join("plain.ply");
        write_binary_ply(&plain, "");
        assert!(!has_non_vertex_elements(&plain));

        let extra = dir.path().join("extra.ply");
        write_binary_ply(&extra, "element extrinsic 1\nproperty float m00\n");
        assert!(has_non_vertex_elements(&extra));
    }

    #[test]
    fn binary_rewrite_keeps_vertex_bytes_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("model.ply");
        write_binary_ply(&src, "element extrinsic 1\nproperty float m00\n");
        let out = make_vertex_only_binary(&src).unwrap();
        assert_eq!(out, dir.path().join("model.vertexonly.binary.ply"));

        let bytes = std::fs::read(&out).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let header_end = text.find("end_header\n").unwrap() + "end_header\n".len();
        assert!(text[..header_end].contains("element vertex 2"));
        assert!(!text[..header_end].contains("extrinsic"));
        let body = &bytes[header_end..];
        assert_eq!(body.len(), 16);
        assert_eq!(&body[0..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn ascii_rewrite_packs_little_endian() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("a.ply");
        std::fs::write(
            &src,
            "ply\nformat ascii 1.0\nelement vertex 2\nproperty float x\nproperty uchar r\n\
             end_header\n1.5 255\n-2.0 0\n",
        )
        .unwrap();
        let out = make_vertex_only_binary(&src).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let header_end = text.find("end_header\n").unwrap() + "end_header\n".len();
        let body = &bytes[header_end..];
        assert_eq!(body.len(), 10);
        assert_eq!(&body[0..4], &1.5f32.to_le_bytes());
        assert_eq!(body[4], 255);
        assert_eq!(&body[5..9], &(-2.0f32).to_le_bytes());
        assert_eq!(body[9], 0);
    }

    #[test]
    fn list_properties_abort_the_rewrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("l.ply");
        std::fs::write(
            &src,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty list uchar int idx\nend_header\n",
        )
        .unwrap();
        assert!(make_vertex_only_binary(&src).is_none());
    }

    #[test]
    fn truncated_binary_body_aborts() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("t.ply");
        let mut bytes = b"ply\nformat binary_little_endian 1.0\nelement vertex 4\n\
             property float x\nend_header\n"
            .to_vec();
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        std::fs::write(&src, bytes).unwrap();
        assert!(make_vertex_only_binary(&src).is_none());
    }
}
