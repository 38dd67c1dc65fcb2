//! Snapshot loading and saving.
//!
//! A snapshot is a record of address spaces (with optional parent
//! linkage for clones) and tasks, persisted as the workspace file
//! `snapshot`. Page contents live in one backing file per range under
//! `memory/`, sized exactly `limit - base`. Loading follows the original
//! order: create the space (cloning the parent if linked), map each
//! range read-write, stream the backing file in, then apply the real
//! permissions.

use crate::address_space::{AddressSpace, AddressSpaceError, PageRangeKind, Perms};
use crate::workspace::Workspace;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

/// Snapshot load/save failures; the consistency variants are fatal at
/// startup.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot file {path} does not exist")]
    MissingSnapshot { path: PathBuf },

    #[error("page backing file {path} does not exist")]
    MissingPageFile { path: PathBuf },

    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        source: bincode::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] bincode::Error),

    #[error("address space {id} appears twice in the snapshot")]
    DuplicateSpace { id: i64 },

    #[error("address space {id} references unknown parent {parent_id}")]
    DanglingParent { id: i64, parent_id: i64 },

    #[error("page range [{base:#x}, {limit:#x}) is empty or inverted")]
    EmptyRange { base: u64, limit: u64 },

    #[error("page file {path} is {actual} bytes, range needs {expected}")]
    PageFileSize {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("cannot copy snapshot byte into address space at {addr:#x}")]
    CopyFailed { addr: u64 },

    #[error("task references unknown address space {id}")]
    UnknownTaskSpace { id: i64 },

    #[error(transparent)]
    Space(#[from] AddressSpaceError),
}

/// One page range of an address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRangeRecord {
    pub base: u64,
    pub limit: u64,
    pub can_read: bool,
    pub can_write: bool,
    pub can_exec: bool,
    pub kind: PageRangeKind,
    /// Names the backing file under `<workspace>/memory/`.
    pub name: String,
}

impl PageRangeRecord {
    pub fn perms(&self) -> Perms {
        Perms::new(self.can_read, self.can_write, self.can_exec)
    }
}

/// One address space: an id, an optional parent (for CoW clones), and
/// its page ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceRecord {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub page_ranges: Vec<PageRangeRecord>,
}

/// One guest task (also called a thread in snapshots).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub pc: u64,
    /// Raw register bank, opaque to the snapshot layer.
    pub state: Vec<u8>,
    pub address_space_id: i64,
}

/// The persisted program description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSnapshot {
    pub arch: String,
    pub os: String,
    pub address_spaces: Vec<AddressSpaceRecord>,
    pub tasks: Vec<TaskRecord>,
}

/// Reads the snapshot record from a workspace.
pub fn read_snapshot(ws: &Workspace) -> Result<ProgramSnapshot, SnapshotError> {
    let path = ws.snapshot_path();
    if !path.exists() {
        return Err(SnapshotError::MissingSnapshot { path });
    }
    let bytes = std::fs::read(&path).map_err(|source| SnapshotError::Io {
        path: path.clone(),
        source,
    })?;
    let snapshot =
        bincode::deserialize(&bytes).map_err(|source| SnapshotError::Decode { path, source })?;
    Ok(snapshot)
}

/// Writes the snapshot record into a workspace.
pub fn write_snapshot(ws: &Workspace, snapshot: &ProgramSnapshot) -> Result<(), SnapshotError> {
    let path = ws.snapshot_path();
    let bytes = bincode::serialize(snapshot).map_err(SnapshotError::Encode)?;
    std::fs::write(&path, bytes).map_err(|source| SnapshotError::Io { path, source })
}

/// Builds every address space described by the snapshot, in order.
/// Returns the spaces plus the id-to-index mapping tasks resolve
/// through.
pub fn load_address_spaces(
    ws: &Workspace,
    snapshot: &ProgramSnapshot,
) -> Result<(Vec<AddressSpace>, HashMap<i64, usize>), SnapshotError> {
    let mut spaces: Vec<AddressSpace> = Vec::with_capacity(snapshot.address_spaces.len());
    let mut by_id: HashMap<i64, usize> = HashMap::new();

    for record in &snapshot.address_spaces {
        info!("initializing address space {}", record.id);
        if by_id.contains_key(&record.id) {
            return Err(SnapshotError::DuplicateSpace { id: record.id });
        }

        let mut space = match record.parent_id {
            Some(parent_id) => {
                let &parent_index =
                    by_id.get(&parent_id)
                        .ok_or(SnapshotError::DanglingParent {
                            id: record.id,
                            parent_id,
                        })?;
                spaces[parent_index].clone_with_id(record.id as u64)
            }
            None => AddressSpace::new(record.id as u64),
        };

        for range in &record.page_ranges {
            if range.limit <= range.base {
                return Err(SnapshotError::EmptyRange {
                    base: range.base,
                    limit: range.limit,
                });
            }
            let size = range.limit - range.base;
            // Map read-write first so the contents can be streamed in,
            // then apply the recorded permissions.
            space.add_map(
                range.base,
                size,
                Perms::RW,
                range.kind,
                range.name.clone(),
            )?;
            load_page_range(ws, &mut space, range)?;
            space.set_permissions(range.base, size, range.perms())?;
        }

        space.log_maps();
        by_id.insert(record.id, spaces.len());
        spaces.push(space);
    }

    Ok((spaces, by_id))
}

/// Streams one backing file into its range.
fn load_page_range(
    ws: &Workspace,
    space: &mut AddressSpace,
    range: &PageRangeRecord,
) -> Result<(), SnapshotError> {
    let path = ws.memory_path(&range.name);
    if !path.exists() {
        return Err(SnapshotError::MissingPageFile { path });
    }

    let expected = range.limit - range.base;
    let actual = std::fs::metadata(&path)
        .map_err(|source| SnapshotError::Io {
            path: path.clone(),
            source,
        })?
        .len();
    if actual != expected {
        return Err(SnapshotError::PageFileSize {
            path,
            expected,
            actual,
        });
    }

    debug!(
        "loading {} into [{:#x}, {:#x})",
        path.display(),
        range.base,
        range.limit
    );

    let mut file = std::fs::File::open(&path).map_err(|source| SnapshotError::Io {
        path: path.clone(),
        source,
    })?;
    let mut buf = [0u8; 4096];
    let mut addr = range.base;
    loop {
        let n = file.read(&mut buf).map_err(|source| SnapshotError::Io {
            path: path.clone(),
            source,
        })?;
        if n == 0 {
            break;
        }
        if !space.write(addr, &buf[..n]) {
            return Err(SnapshotError::CopyFailed { addr });
        }
        addr += n as u64;
    }
    Ok(())
}

/// Describes a live address space as a snapshot record. Ranges are
/// renamed `seg_<base>_<limit>` because permission splits may have
/// multiplied the original ranges.
pub fn describe_address_space(space: &AddressSpace, parent_id: Option<i64>) -> AddressSpaceRecord {
    AddressSpaceRecord {
        id: space.id() as i64,
        parent_id,
        page_ranges: space
            .maps()
            .map(|map| PageRangeRecord {
                base: map.base(),
                limit: map.limit(),
                can_read: map.perms().read,
                can_write: map.perms().write,
                can_exec: map.perms().exec,
                kind: map.kind(),
                name: format!("seg_{:x}_{:x}", map.base(), map.limit()),
            })
            .collect(),
    }
}

/// Writes one backing file per map of a live address space, named to
/// match [`describe_address_space`].
pub fn save_address_space_memory(
    ws: &Workspace,
    space: &AddressSpace,
) -> Result<(), SnapshotError> {
    for map in space.maps() {
        let name = format!("seg_{:x}_{:x}", map.base(), map.limit());
        let path = ws.memory_path(&name);
        std::fs::write(&path, map.contents()).map_err(|source| SnapshotError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}
