use refork::bridges::{FileIndex, StorageIndex};
use std::fs;

/// FileIndex logs through slog-scope; keep that quiet here.
fn quietly<T>(f: impl FnOnce() -> T) -> T {
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    slog_scope::scope(&logger, f)
}

#[test]
fn records_and_restores_the_position() {
    quietly(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data.log");
        let index_file = dir.path().join("data.index");
        let index = FileIndex::new(data.clone(), index_file);

        // A fresh tree: nothing saved, nothing written, restore passes.
        index.restore().expect("restore on an empty state");
        assert_eq!(None, index.saved_position().expect("read back"));

        fs::write(&data, b"0123456789").expect("writing data");
        index.save().expect("save");
        assert_eq!(Some(10), index.saved_position().expect("read back"));
        index.restore().expect("restore");
    })
}

#[test]
fn save_overwrites_the_previous_record() {
    quietly(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data.log");
        let index_file = dir.path().join("data.index");
        let index = FileIndex::new(data.clone(), index_file);

        fs::write(&data, b"abc").expect("writing data");
        index.save().expect("first save");
        fs::write(&data, b"abcdef").expect("appending data");
        index.save().expect("second save");
        assert_eq!(Some(6), index.saved_position().expect("read back"));
    })
}

#[test]
fn refuses_an_index_ahead_of_the_data() {
    quietly(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data.log");
        let index_file = dir.path().join("data.index");
        let index = FileIndex::new(data.clone(), index_file);

        fs::write(&data, b"0123").expect("writing data");
        index.save().expect("save");

        // The data file shrank behind the index's back; a fresh child must
        // not silently resume from a position that no longer exists.
        fs::write(&data, b"01").expect("truncating data");
        assert!(index.restore().is_err());
    })
}
