//! Minimal NumPy `.npy` v1.0 container writer/reader.
//!
//! The format is a 6-byte magic, a version, a little-endian header length,
//! an ASCII dict (`descr`, `fortran_order`, `shape`) space-padded so the
//! payload starts on a 64-byte boundary, then the raw elements in C order,
//! little-endian. Only the two shapes the exporter emits are supported:
//! `float64` matrices and `int64` rank-3 cubes. The readers exist so tests
//! and inspection tooling can round-trip files without NumPy.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

fn header_bytes(descr: &str, shape_repr: &str) -> Vec<u8> {
    let dict = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape_repr}, }}");
    // 10 bytes of preamble + header must land on a 64-byte boundary; the
    // header ends with a newline.
    let unpadded = 10 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header = format!("{dict}{}\n", " ".repeat(padding));

    let mut out = Vec::with_capacity(10 + header.len());
    out.extend_from_slice(MAGIC);
    out.push(1); // major
    out.push(0); // minor
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out
}

/// Write a `(rows, cols)` float64 matrix.
pub fn write_f64_2d(path: &Path, data: &[f64], shape: (usize, usize)) -> Result<()> {
    if data.len() != shape.0 * shape.1 {
        bail!(
            "data length {} does not match shape ({}, {})",
            data.len(),
            shape.0,
            shape.1
        );
    }
    let mut bytes = header_bytes("<f8", &format!("({}, {})", shape.0, shape.1));
    bytes.reserve(data.len() * 8);
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    write_file(path, &bytes)
}

/// Write an `(n, rows, cols)` int64 cube.
pub fn write_i64_3d(path: &Path, data: &[i64], shape: (usize, usize, usize)) -> Result<()> {
    if data.len() != shape.0 * shape.1 * shape.2 {
        bail!(
            "data length {} does not match shape ({}, {}, {})",
            data.len(),
            shape.0,
            shape.1,
            shape.2
        );
    }
    let mut bytes = header_bytes("<i8", &format!("({}, {}, {})", shape.0, shape.1, shape.2));
    bytes.reserve(data.len() * 8);
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    write_file(path, &bytes)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn parse_header(bytes: &[u8], expected_descr: &str) -> Result<(Vec<usize>, usize)> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        bail!("not an npy file");
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let header = std::str::from_utf8(&bytes[10..10 + header_len]).context("non-ASCII header")?;
    if !header.contains(&format!("'descr': '{expected_descr}'")) {
        bail!("unexpected dtype in header: {header}");
    }
    let open = header.find('(').context("header missing shape")?;
    let close = header[open..].find(')').context("header missing shape")? + open;
    let shape: Vec<usize> = header[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().context("bad shape element"))
        .collect::<Result<_>>()?;
    Ok((shape, 10 + header_len))
}

/// Read back a float64 matrix written by [`write_f64_2d`].
pub fn read_f64_2d(path: &Path) -> Result<(Vec<f64>, (usize, usize))> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (shape, offset) = parse_header(&bytes, "<f8")?;
    if shape.len() != 2 {
        bail!("expected a rank-2 array, got shape {shape:?}");
    }
    let data = bytes[offset..]
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
        .collect::<Vec<f64>>();
    if data.len() != shape[0] * shape[1] {
        bail!("payload does not match shape {shape:?}");
    }
    Ok((data, (shape[0], shape[1])))
}

/// Read back an int64 cube written by [`write_i64_3d`].
pub fn read_i64_3d(path: &Path) -> Result<(Vec<i64>, (usize, usize, usize))> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (shape, offset) = parse_header(&bytes, "<i8")?;
    if shape.len() != 3 {
        bail!("expected a rank-3 array, got shape {shape:?}");
    }
    let data = bytes[offset..]
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().expect("8-byte chunk")))
        .collect::<Vec<i64>>();
    if data.len() != shape[0] * shape[1] * shape[2] {
        bail!("payload does not match shape {shape:?}");
    }
    Ok((data, (shape[0], shape[1], shape[2])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_matrix_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.npy");
        let data = vec![1.0, 2.0, f64::NAN, 4.0, 5.0, 6.0];
        write_f64_2d(&path, &data, (2, 3)).unwrap();

        let (back, shape) = read_f64_2d(&path).unwrap();
        assert_eq!(shape, (2, 3));
        assert_eq!(back[0], 1.0);
        assert!(back[2].is_nan());
        assert_eq!(back[5], 6.0);
    }

    #[test]
    fn i64_cube_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.npy");
        let data: Vec<i64> = (0..24).collect();
        write_i64_3d(&path, &data, (2, 3, 4)).unwrap();

        let (back, shape) = read_i64_3d(&path).unwrap();
        assert_eq!(shape, (2, 3, 4));
        assert_eq!(back, data);
    }

    #[test]
    fn header_is_64_byte_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        write_f64_2d(&path, &[1.0], (1, 1)).unwrap();
        let bytes = fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_f64_2d(&dir.path().join("x.npy"), &[1.0, 2.0], (2, 2)).is_err());
        assert!(write_i64_3d(&dir.path().join("y.npy"), &[1], (1, 1, 2)).is_err());
    }
}
