//! Post-burn verification.
//!
//! After a raw copy the first `image_len` bytes of the device must equal
//! the image exactly. Both sides are digested with SHA-256 in streaming
//! chunks so multi-gigabyte images never land in memory at once.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::report::ReportSink;

const CHUNK: usize = 4 * 1024 * 1024;

/// Digest the first `limit` bytes of `path`.
fn digest_prefix(path: &Path, limit: u64, sink: &dyn ReportSink) -> Result<[u8; 32]> {
    let mut file = File::open(path).map_err(|e| Error::file_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut remaining = limit;

    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let read = file
            .read(&mut buf[..want])
            .map_err(|e| Error::device_io(path, format!("read during verification: {e}")))?;
        if read == 0 {
            return Err(Error::device_io(
                path,
                format!("unexpected end of data with {remaining} bytes left to verify"),
            ));
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
        sink.progress(limit - remaining, limit);
    }

    Ok(hasher.finalize().into())
}

/// Compare the image digest against a read-back of the device.
pub fn verify_burn(image: &Path, device: &Path, sink: &dyn ReportSink) -> Result<()> {
    let len = std::fs::metadata(image)
        .map_err(|e| Error::file_io(image, e))?
        .len();

    sink.info(&format!("verifying {len} bytes written to {}", device.display()));

    let expected = digest_prefix(image, len, sink)?;
    let actual = digest_prefix(device, len, sink)?;

    if expected != actual {
        return Err(Error::device_io(
            device,
            "verification failed: device contents do not match the image",
        ));
    }

    sink.info("verification passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NullSink;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_of(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn identical_prefix_passes() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
        let image = file_of(&payload);

        // Device is larger than the image; only the prefix must match.
        let mut device_bytes = payload.clone();
        device_bytes.extend_from_slice(&[0xFFu8; 4096]);
        let device = file_of(&device_bytes);

        verify_burn(image.path(), device.path(), &NullSink).unwrap();
    }

    #[test]
    fn corrupted_byte_fails() {
        let payload = vec![0x42u8; 100_000];
        let image = file_of(&payload);

        let mut corrupted = payload.clone();
        corrupted[50_000] ^= 0x01;
        let device = file_of(&corrupted);

        assert!(matches!(
            verify_burn(image.path(), device.path(), &NullSink),
            Err(Error::DeviceIo { .. })
        ));
    }

    #[test]
    fn truncated_device_fails() {
        let payload = vec![0x42u8; 100_000];
        let image = file_of(&payload);
        let device = file_of(&payload[..50_000]);

        assert!(verify_burn(image.path(), device.path(), &NullSink).is_err());
    }
}
