//! On-disk catalog file
//!
//! ```text
//! [magic "SNAPCAT1"][version: u32 LE][MessagePack payload]
//! ```
//!
//! Written atomically via temp + fsync + rename, so a crash leaves either
//! the previous or the new catalog, never a torn one.

use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Magic bytes at the start of a catalog file
pub const CATALOG_MAGIC: &[u8; 8] = b"SNAPCAT1";
/// Current catalog format version
pub const CATALOG_VERSION: u32 = 1;

const HEADER_SIZE: usize = 12;

/// Serialize `data` and atomically replace the file at `path`
pub fn write_catalog<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let payload = rmp_serde::to_vec_named(data)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("serialize error: {}", e)))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(CATALOG_MAGIC);
    buf.extend_from_slice(&CATALOG_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload);

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a catalog written by [`write_catalog`]
pub fn load_catalog<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let buf = fs::read(path)?;
    if buf.len() < HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "catalog too small",
        ));
    }
    if &buf[0..8] != CATALOG_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad catalog magic",
        ));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&buf[8..12]);
    let version = u32::from_le_bytes(version);
    if version != CATALOG_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported catalog version {}", version),
        ));
    }
    rmp_serde::from_slice(&buf[HEADER_SIZE..])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("decode error: {}", e)))
}
