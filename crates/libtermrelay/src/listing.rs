use std::io;
use std::path::Path;

use bytes::Bytes;
use termrelay_protocol::DirEntry;

/// Serialize the entries of `dir` into the payload streamed for a
/// directory-listing transfer. Entries are sorted by name.
pub fn serialize_directory(dir: &Path) -> io::Result<Bytes> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata().ok();
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.as_ref().is_some_and(|m| m.is_dir()),
            size: metadata.as_ref().map_or(0, |m| m.len()),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let payload = serde_json::to_vec(&entries).map_err(io::Error::other)?;
    Ok(Bytes::from(payload))
}

pub fn decode_listing(payload: &[u8]) -> Result<Vec<DirEntry>, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_is_sorted_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let payload = serialize_directory(dir.path()).unwrap();
        let entries = decode_listing(&payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "b.txt");
        assert!(!entries[1].is_dir);
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(serialize_directory(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn garbage_payload_does_not_decode() {
        assert!(decode_listing(b"\x00\x01not json").is_err());
    }
}
