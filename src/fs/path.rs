//! The path resolver: `get_dir` walks a path one component at a time,
//! opening and closing each intermediate directory as it goes. The facade
//! operations that drive it (`create`/`open`/`remove`/`chdir`/`mkdir`/
//! `readdir`) live in `fs::mod` alongside the open [`InodeTable`] and
//! [`FreeMap`] they share.

use crate::error::{KernelError, Result};
use crate::fs::directory;
use crate::fs::freemap::{FreeMap, ROOT_DIR_SECTOR};
use crate::fs::inode::{InodeHandle, InodeTable};

/// Splits `path` against `cwd_sector`, opening and closing each
/// intermediate directory as resolution advances. Returns the final
/// directory (owned by the caller — must be closed) and the last path
/// component as an owned string, not yet looked up.
///
/// A leading `/` starts at the root; otherwise resolution starts at
/// `cwd_sector`. An empty path fails. A path of only slashes (e.g. `/`)
/// resolves to the root directory with last component `.`.
pub fn get_dir(
    inodes: &InodeTable,
    free_map: &FreeMap,
    cwd_sector: u32,
    path: &str,
) -> Result<(InodeHandle, String)> {
    if path.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let start_sector = if absolute { ROOT_DIR_SECTOR } else { cwd_sector };
    let mut current = inodes.open(start_sector)?;

    if parts.is_empty() {
        // Bare "/" (or any run of slashes): root itself, last component ".".
        return Ok((current, ".".to_string()));
    }

    for component in &parts[..parts.len() - 1] {
        let step: Result<Option<InodeHandle>> = (|| {
            if !current.inner().is_directory() {
                return Err(KernelError::NotADirectory);
            }
            if *component == "." {
                return Ok(None);
            }
            let sector = directory::lookup(inodes, &current, component)?;
            let next = inodes.open(sector)?;
            if !next.inner().is_directory() {
                let _ = inodes.close(free_map, next);
                return Err(KernelError::NotADirectory);
            }
            Ok(Some(next))
        })();
        match step {
            Ok(Some(next)) => {
                inodes.close(free_map, current)?;
                current = next;
            }
            Ok(None) => {}
            Err(e) => {
                inodes.close(free_map, current)?;
                return Err(e);
            }
        }
    }

    Ok((current, parts[parts.len() - 1].to_string()))
}
