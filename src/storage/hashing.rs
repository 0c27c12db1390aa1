//! Content-addressing digests
//!
//! All resource payloads are identified by their SHA256 digest, rendered as
//! lowercase hex. Files are digested in fixed-size chunks so large driver
//! payloads never have to be resident in memory just to be cataloged.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Chunk size for streamed file digests
const FILE_HASH_CHUNK: usize = 64 * 1024;

/// SHA256 digest of a byte slice, as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA256 digest of a file's contents, streamed in chunks.
pub fn sha256_file_hex(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FILE_HASH_CHUNK];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_hex_deterministic() {
        let data = b"driver payload bytes";
        assert_eq!(sha256_hex(data), sha256_hex(data));
    }

    #[test]
    fn test_file_hash_matches_slice_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        File::create(&path).unwrap().write_all(&data).unwrap();

        assert_eq!(sha256_file_hex(&path).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn test_file_hash_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        File::create(&path).unwrap();

        assert_eq!(sha256_file_hex(&path).unwrap(), sha256_hex(b""));
    }
}
