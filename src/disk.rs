//! Raw disk image management: sparse creation, import, grow-only resize.

use std::path::Path;

use crate::error::DiskError;

/// Create a sparse raw image of `size` bytes. The file must not pre-exist.
pub fn create_disk_image(path: &Path, size: u64) -> Result<(), DiskError> {
    if size == 0 {
        return Err(DiskError::InvalidSize("size must be non-zero".into()));
    }
    if path.exists() {
        return Err(DiskError::DiskAlreadyExists(path.to_path_buf()));
    }

    let file = std::fs::File::create_new(path).map_err(|e| DiskError::CreationFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    file.set_len(size).map_err(|e| DiskError::CreationFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    tracing::info!(path = %path.display(), size, "created disk image");
    Ok(())
}

/// Copy an existing image into the store (import with `--copy`).
pub fn copy_disk_image(source: &Path, dest: &Path) -> Result<u64, DiskError> {
    if !source.exists() {
        return Err(DiskError::FileNotFound(source.to_path_buf()));
    }
    if dest.exists() {
        return Err(DiskError::DiskAlreadyExists(dest.to_path_buf()));
    }
    std::fs::copy(source, dest).map_err(|e| DiskError::CopyFailed {
        path: dest.to_path_buf(),
        source: e,
    })
}

/// Symlink an existing image into the store (import in place).
pub fn link_disk_image(source: &Path, dest: &Path) -> Result<(), DiskError> {
    if !source.exists() {
        return Err(DiskError::FileNotFound(source.to_path_buf()));
    }
    if dest.exists() {
        return Err(DiskError::DiskAlreadyExists(dest.to_path_buf()));
    }
    std::os::unix::fs::symlink(source, dest).map_err(|e| DiskError::CopyFailed {
        path: dest.to_path_buf(),
        source: e,
    })
}

/// Virtual size of a raw image: the file length.
pub fn disk_virtual_size(path: &Path) -> Result<u64, DiskError> {
    let meta = std::fs::metadata(path).map_err(|_| DiskError::FileNotFound(path.to_path_buf()))?;
    Ok(meta.len())
}

/// Grow a raw image to `new_size` bytes. Shrinking is refused.
pub fn resize_disk_image(path: &Path, current_size: u64, new_size: u64) -> Result<(), DiskError> {
    if new_size <= current_size {
        return Err(DiskError::ResizeFailed(format!(
            "new size {} must be larger than current size {}",
            crate::util::format_size(new_size),
            crate::util::format_size(current_size),
        )));
    }
    if !path.exists() {
        return Err(DiskError::FileNotFound(path.to_path_buf()));
    }

    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| DiskError::ResizeFailed(format!("opening {}: {e}", path.display())))?;
    file.set_len(new_size)
        .map_err(|e| DiskError::ResizeFailed(format!("growing {}: {e}", path.display())))?;

    tracing::info!(path = %path.display(), new_size, "resized disk image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_makes_sparse_file_of_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let size = 4 * 1024 * 1024 * 1024u64;

        create_disk_image(&path, size).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, b"taken").unwrap();

        match create_disk_image(&path, 1024) {
            Err(DiskError::DiskAlreadyExists(p)) => assert_eq!(p, path),
            other => panic!("expected DiskAlreadyExists, got {other:?}"),
        }
    }

    #[test]
    fn resize_grows_but_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        create_disk_image(&path, 1024 * 1024).unwrap();

        assert!(matches!(
            resize_disk_image(&path, 1024 * 1024, 512 * 1024),
            Err(DiskError::ResizeFailed(_))
        ));
        assert!(matches!(
            resize_disk_image(&path, 1024 * 1024, 1024 * 1024),
            Err(DiskError::ResizeFailed(_))
        ));

        resize_disk_image(&path, 1024 * 1024, 8 * 1024 * 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * 1024 * 1024);
    }

    #[test]
    fn copy_requires_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.img");
        let dest = dir.path().join("disk.img");
        assert!(matches!(
            copy_disk_image(&missing, &dest),
            Err(DiskError::FileNotFound(_))
        ));
    }

    #[test]
    fn link_points_at_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("orig.img");
        std::fs::write(&source, b"data").unwrap();
        let dest = dir.path().join("disk.img");

        link_disk_image(&source, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
        assert!(std::fs::symlink_metadata(&dest).unwrap().is_symlink());
    }
}
