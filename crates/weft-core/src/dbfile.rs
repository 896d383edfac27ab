//! Length-prefixed binary framing for the persisted databases.
//!
//! Every weft database file is a sequence of frames, each a little-endian
//! `u32` byte length followed by one bincode-encoded message. Most files
//! carry a single top-level message; flat list files (predicted-iroot
//! lists, run histories) carry one frame per entry.
//!
//! Load errors are surfaced as `io::Error` and treated as fatal by
//! callers; saves are best-effort at program exit.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Write one length-prefixed frame.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> io::Result<()> {
    let bytes = bincode::serialize(msg).map_err(io::Error::other)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::other("frame larger than 4 GiB"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&bytes)
}

/// Read one length-prefixed frame. Returns `Ok(None)` on clean EOF.
/// A frame truncated mid-record is an error.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    bincode::deserialize(&bytes)
        .map(Some)
        .map_err(io::Error::other)
}

/// Save a single top-level message to `path`, truncating.
pub fn save_message<T: Serialize>(path: &Path, msg: &T) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_frame(&mut w, msg)?;
    w.flush()
}

/// Load a single top-level message from `path`.
pub fn load_message<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let mut r = BufReader::new(File::open(path)?);
    read_frame(&mut r)?.ok_or_else(|| io::Error::other("empty database file"))
}

/// Save a flat list, one frame per entry.
pub fn save_list<T: Serialize>(path: &Path, entries: &[T]) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for entry in entries {
        write_frame(&mut w, entry)?;
    }
    w.flush()
}

/// Load a flat list written by [`save_list`].
pub fn load_list<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let mut r = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    while let Some(entry) = read_frame(&mut r)? {
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Msg {
        id: u32,
        name: String,
        flags: Vec<bool>,
    }

    fn sample(id: u32) -> Msg {
        Msg {
            id,
            name: format!("msg-{id}"),
            flags: vec![true, false],
        }
    }

    #[test]
    fn message_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.db");
        save_message(&path, &sample(7)).unwrap();
        let back: Msg = load_message(&path).unwrap();
        assert_eq!(back, sample(7));
    }

    #[test]
    fn list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.db");
        let entries: Vec<Msg> = (0..10).map(sample).collect();
        save_list(&path, &entries).unwrap();
        let back: Vec<Msg> = load_list(&path).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn empty_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        save_list::<Msg>(&path, &[]).unwrap();
        let back: Vec<Msg> = load_list(&path).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.db");
        save_message(&path, &sample(1)).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(load_message::<Msg>(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_message::<Msg>(&dir.path().join("nope.db")).is_err());
    }
}
