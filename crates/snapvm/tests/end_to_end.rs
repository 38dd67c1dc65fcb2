//! Whole-workspace flow: seed a runtime module and a snapshot on disk,
//! run the executor over them, and check what persists.

use snapvm_core::RegisterBank;
use snapvm_ir::Module;
use snapvm_runtime::snapshot::write_snapshot;
use snapvm_runtime::{
    AddressSpaceRecord, Executor, PageRangeKind, PageRangeRecord, ProgramSnapshot, TaskRecord,
    Workspace,
};

fn seed_workspace(ws: &Workspace, code: &[u8], pc: u64) {
    ws.ensure_dirs().unwrap();

    Module::runtime_seed(RegisterBank::MIN_LEN)
        .write_to(&ws.runtime_bitcode_path())
        .unwrap();

    let mut page = vec![0u8; 0x1000];
    page[..code.len()].copy_from_slice(code);
    std::fs::write(ws.memory_path("text"), &page).unwrap();

    let snapshot = ProgramSnapshot {
        arch: "x86".to_string(),
        os: "vxworks".to_string(),
        address_spaces: vec![AddressSpaceRecord {
            id: 1,
            parent_id: None,
            page_ranges: vec![PageRangeRecord {
                base: 0x1000,
                limit: 0x2000,
                can_read: true,
                can_write: true,
                can_exec: true,
                kind: PageRangeKind::Anonymous,
                name: "text".to_string(),
            }],
        }],
        tasks: vec![TaskRecord {
            pc,
            state: vec![0; RegisterBank::MIN_LEN],
            address_space_id: 1,
        }],
    };
    write_snapshot(ws, &snapshot).unwrap();
}

#[test]
fn workspace_runs_and_persists_lifted_code() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    seed_workspace(&ws, &[0x90, 0x90, 0xF4], 0x1000);

    {
        let mut exec = Executor::from_workspace(ws.clone()).unwrap();
        exec.run();
        exec.shutdown().unwrap();
        assert_eq!(exec.cached_traces(), 1);
    }

    // The local module exists and carries the lifted trace.
    let local = Module::read_from(&ws.local_runtime_bitcode_path()).unwrap();
    assert_eq!(local.functions.len(), 1);
    let func = local.functions.values().next().unwrap();
    assert_eq!(func.entry_pc, 0x1000);
    assert!(func.name.starts_with("$1000_"));
}

#[test]
fn missing_snapshot_fails_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.ensure_dirs().unwrap();
    Module::runtime_seed(RegisterBank::MIN_LEN)
        .write_to(&ws.runtime_bitcode_path())
        .unwrap();

    assert!(Executor::from_workspace(ws).is_err());
}

#[test]
fn missing_runtime_module_fails_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.ensure_dirs().unwrap();

    assert!(Executor::from_workspace(ws).is_err());
}

#[test]
fn invalid_arch_string_fails_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    seed_workspace(&ws, &[0xF4], 0x1000);

    // Corrupt the arch string.
    let mut snapshot = snapvm_runtime::snapshot::read_snapshot(&ws).unwrap();
    snapshot.arch = "mips".to_string();
    write_snapshot(&ws, &snapshot).unwrap();

    assert!(Executor::from_workspace(ws).is_err());
}
