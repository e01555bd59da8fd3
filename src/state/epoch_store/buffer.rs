use std::fmt;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;

use bytesize::ByteSize;
use memmap2::Mmap;

/// Read-only bytes of a cache or dataset, either generated in this process
/// or mapped from a file written by an earlier one.
pub enum EpochBuffer {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for EpochBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(bytes) => bytes.as_slice(),
            Self::Mapped(mmap) => &mmap[..],
        }
    }
}

impl fmt::Debug for EpochBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Owned(_) => "Owned",
            Self::Mapped(_) => "Mapped",
        };
        f.debug_struct("EpochBuffer")
            .field("kind", &kind)
            .field("size", &ByteSize(self.len() as u64))
            .finish()
    }
}

/// Map the file at `path` if it holds exactly `expected_len` bytes.
///
/// Returns `Ok(None)` when there is no file or when its length is off, in
/// which case the caller regenerates and overwrites it.
pub(super) fn load(path: &Path, expected_len: usize) -> io::Result<Option<EpochBuffer>> {
    let file = match fs::OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len != expected_len as u64 {
        tracing::warn!(
            "Ignoring {} with unexpected size {} (want {})",
            path.display(),
            len,
            expected_len
        );
        return Ok(None);
    }

    // Files are only ever replaced through rename, never written in place,
    // so the mapped contents cannot change under us.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(EpochBuffer::Mapped(mmap)))
}

/// Write `bytes` to `path` through a temporary file and a rename, so
/// readers never see a partially written file.
pub(super) fn store(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_maps_the_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache-R1-e0-00");
        let bytes: Vec<u8> = (0..=255).collect();

        store(&path, &bytes).unwrap();
        assert!(!tmp_path(&path).exists());

        let loaded = load(&path, bytes.len()).unwrap().unwrap();
        assert!(matches!(loaded, EpochBuffer::Mapped(_)));
        assert_eq!(&bytes[..], &loaded[..]);
    }

    #[test]
    fn missing_or_truncated_files_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset-R1-e3-00");
        assert!(load(&path, 64).unwrap().is_none());

        store(&path, &[1, 2, 3]).unwrap();
        assert!(load(&path, 64).unwrap().is_none());
    }
}
