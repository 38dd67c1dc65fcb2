//! Snapshot round-trip: load, save, reload, and compare what the guest
//! would observe.

use snapvm_runtime::snapshot::{
    describe_address_space, load_address_spaces, read_snapshot, save_address_space_memory,
    write_snapshot,
};
use snapvm_runtime::{
    AddressSpaceRecord, PageRangeKind, PageRangeRecord, ProgramSnapshot, TaskRecord, Workspace,
};

fn range(base: u64, limit: u64, perms: (bool, bool, bool), name: &str) -> PageRangeRecord {
    PageRangeRecord {
        base,
        limit,
        can_read: perms.0,
        can_write: perms.1,
        can_exec: perms.2,
        kind: PageRangeKind::Anonymous,
        name: name.to_string(),
    }
}

#[test]
fn loading_saving_and_reloading_preserves_contents_and_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.ensure_dirs().unwrap();

    // Two ranges with distinct contents and permissions, one task.
    let mut code = vec![0u8; 0x1000];
    for (i, byte) in code.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let mut data = vec![0u8; 0x2000];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 13) as u8;
    }
    std::fs::write(ws.memory_path("code"), &code).unwrap();
    std::fs::write(ws.memory_path("data"), &data).unwrap();

    let mut state = vec![0u8; 96];
    for (i, byte) in state.iter_mut().enumerate() {
        *byte = i as u8;
    }

    let original = ProgramSnapshot {
        arch: "x86".to_string(),
        os: "vxworks".to_string(),
        address_spaces: vec![AddressSpaceRecord {
            id: 1,
            parent_id: None,
            page_ranges: vec![
                range(0x1000, 0x2000, (true, false, true), "code"),
                range(0x8000, 0xa000, (true, true, false), "data"),
            ],
        }],
        tasks: vec![TaskRecord {
            pc: 0x1000,
            state: state.clone(),
            address_space_id: 1,
        }],
    };
    write_snapshot(&ws, &original).unwrap();

    // First load.
    let loaded = read_snapshot(&ws).unwrap();
    let (spaces, _) = load_address_spaces(&ws, &loaded).unwrap();

    // Save into a second workspace.
    let dir2 = tempfile::tempdir().unwrap();
    let ws2 = Workspace::new(dir2.path());
    ws2.ensure_dirs().unwrap();
    let resaved = ProgramSnapshot {
        arch: loaded.arch.clone(),
        os: loaded.os.clone(),
        address_spaces: spaces
            .iter()
            .map(|space| describe_address_space(space, None))
            .collect(),
        tasks: loaded.tasks.clone(),
    };
    for space in &spaces {
        save_address_space_memory(&ws2, space).unwrap();
    }
    write_snapshot(&ws2, &resaved).unwrap();

    // Reload from the second workspace.
    let reloaded = read_snapshot(&ws2).unwrap();
    let (spaces2, _) = load_address_spaces(&ws2, &reloaded).unwrap();

    // Task state round-trips byte for byte.
    assert_eq!(reloaded.tasks, original.tasks);
    assert_eq!(reloaded.arch, original.arch);
    assert_eq!(reloaded.os, original.os);

    // Every mapped byte and every permission answer matches.
    assert_eq!(spaces.len(), spaces2.len());
    for (a, b) in spaces.iter().zip(spaces2.iter()) {
        let ranges_a: Vec<_> = a.maps().map(|m| (m.base(), m.limit(), m.perms())).collect();
        let ranges_b: Vec<_> = b.maps().map(|m| (m.base(), m.limit(), m.perms())).collect();
        assert_eq!(ranges_a, ranges_b);

        for map in a.maps() {
            for addr in map.base()..map.limit() {
                assert_eq!(a.can_read(addr), b.can_read(addr));
                if a.can_read(addr) {
                    assert_eq!(a.read_byte(addr), b.read_byte(addr), "byte at {:#x}", addr);
                }
            }
        }
    }

    // Spot-check actual content against the source files.
    let code_space = &spaces2[0];
    assert_eq!(code_space.read_byte(0x1005), Some(code[5]));
    assert_eq!(code_space.read_byte(0x8007), Some(data[7]));
}

#[test]
fn describe_reflects_permission_splits() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.ensure_dirs().unwrap();

    std::fs::write(ws.memory_path("m"), vec![0u8; 0x3000]).unwrap();
    let snapshot = ProgramSnapshot {
        arch: "x86".into(),
        os: "vxworks".into(),
        address_spaces: vec![AddressSpaceRecord {
            id: 1,
            parent_id: None,
            page_ranges: vec![range(0x1000, 0x4000, (true, true, false), "m")],
        }],
        tasks: vec![],
    };
    write_snapshot(&ws, &snapshot).unwrap();

    let (mut spaces, _) = load_address_spaces(&ws, &snapshot).unwrap();
    spaces[0]
        .set_permissions(0x2000, 0x1000, snapvm_runtime::Perms::RX)
        .unwrap();

    let record = describe_address_space(&spaces[0], None);
    assert_eq!(record.page_ranges.len(), 3);
    assert!(record.page_ranges[1].can_exec);
    assert!(!record.page_ranges[1].can_write);
    // Names regenerate from the split ranges.
    assert_eq!(record.page_ranges[1].name, "seg_2000_3000");
}
