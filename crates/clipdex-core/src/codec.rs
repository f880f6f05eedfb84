//! Raw `.f32` vector codec
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     D*4     [f32]       Vector components (Little Endian)
//! ```
//!
//! There is no header. The dimension is implied by the file length, so a file
//! whose length is not a multiple of 4 is corrupt. Callers that know `D`
//! should use [`read_vector_dim`].
//!
//! Writes never expose a partial file under the final name: bytes go to a
//! hidden temp sibling, are fsynced, then renamed over the target.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;

/// Size of one encoded component.
pub const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Suffix carried by in-flight temp files. Anything ending in it is garbage
/// once the writing process is gone.
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("corrupt vector file {path:?}: {len} bytes is not a multiple of 4")]
    Corrupt { path: PathBuf, len: usize },

    #[error("dimension mismatch in {path:?}: expected {expected}, got {actual}")]
    DimensionMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CodecError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the underlying failure is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Encode floats as a flat little-endian byte sequence.
pub fn encode_le(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * F32_BYTES);
    for &val in vector {
        out.extend_from_slice(&val.to_le_bytes());
    }
    out
}

/// Decode a flat little-endian byte sequence. Returns `None` when the length
/// is misaligned.
pub fn decode_le(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % F32_BYTES != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(F32_BYTES)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Write a vector to `path`, replacing any previous file atomically.
pub fn write_vector<P: AsRef<Path>>(path: P, vector: &[f32]) -> Result<(), CodecError> {
    let path = path.as_ref();
    atomic_write(path, &encode_le(vector)).map_err(|e| CodecError::io(path, e))
}

/// Read a vector; its dimension is `len / 4`.
pub fn read_vector<P: AsRef<Path>>(path: P) -> Result<Vec<f32>, CodecError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| CodecError::io(path, e))?;
    decode_le(&bytes).ok_or_else(|| CodecError::Corrupt {
        path: path.to_path_buf(),
        len: bytes.len(),
    })
}

/// Read a vector and require exactly `dim` components.
pub fn read_vector_dim<P: AsRef<Path>>(path: P, dim: usize) -> Result<Vec<f32>, CodecError> {
    let path = path.as_ref();
    let vector = read_vector(path)?;
    if vector.len() != dim {
        return Err(CodecError::DimensionMismatch {
            path: path.to_path_buf(),
            expected: dim,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

/// Read an `N x dim` row-major batch file.
pub fn read_matrix<P: AsRef<Path>>(path: P, dim: usize) -> Result<Vec<Vec<f32>>, CodecError> {
    let path = path.as_ref();
    let flat = read_vector(path)?;
    if dim == 0 || flat.len() % dim != 0 {
        return Err(CodecError::DimensionMismatch {
            path: path.to_path_buf(),
            expected: dim,
            actual: flat.len(),
        });
    }
    Ok(flat.chunks_exact(dim).map(|row| row.to_vec()).collect())
}

/// Temp sibling used while `path` is being written.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut nonce = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut nonce);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vector".to_string());
    let suffix: String = nonce.iter().map(|b| format!("{:02x}", b)).collect();
    path.with_file_name(format!(".{}.{}{}", name, suffix, TMP_SUFFIX))
}

/// Write-fsync-rename. On failure the temp file is removed and the previous
/// contents of `path` (if any) stay untouched.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = temp_path_for(path);
    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_parent(path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// True for a hidden in-flight sibling produced by [`temp_path_for`].
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TMP_SUFFIX)
}

/// Delete every temp sibling directly inside `dir` (no recursion) and return
/// the removed paths. A missing directory has nothing to sweep.
pub fn sweep_temp_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if !is_temp_name(&name.to_string_lossy()) || !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    removed.sort();
    Ok(removed)
}

/// Fsync the directory holding `path` so a rename survives power loss.
pub fn sync_parent(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
