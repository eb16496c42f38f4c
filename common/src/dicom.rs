use dicom_object::{DefaultDicomObject, OpenFileOptions, ReadError};
use std::io::Cursor;
use tracing::debug;

/// Reads a DICOM object from an in-memory byte buffer.
///
/// Slices arrive from the object store as raw blobs. The buffer is expected
/// to carry the 128-byte preamble and `DICM` magic, the same layout a file
/// on disk would have; a stream already starting at the file meta group is
/// accepted as well.
///
/// # Arguments
///
/// * `bytes` - The encoded DICOM stream
///
/// # Returns
///
/// * `Ok(DefaultDicomObject)` - The decoded DICOM object
/// * `Err(ReadError)` - If the buffer is not a readable DICOM stream
pub fn from_bytes(bytes: &[u8]) -> Result<DefaultDicomObject, ReadError> {
    debug!("Read DICOM data from {} byte buffer", bytes.len());
    // The reader path expects the stream to start at the "DICM" magic.
    let stream = if bytes.len() > 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    };
    OpenFileOptions::new().from_reader(Cursor::new(stream))
}
