// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the filter manager: intake, rename resolution,
//! offset persistence, and shutdown, driven through the public API against
//! a real temporary filesystem.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::tempdir;

use filetail::{FilterManager, LogHandler, TailConfig};

/// Handler that records every delivered line with the path it came from.
#[derive(Default)]
struct Collector {
    lines: Mutex<Vec<(PathBuf, String)>>,
}

impl Collector {
    fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    fn entries(&self) -> Vec<(PathBuf, String)> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogHandler for Collector {
    fn handle_line(&self, path: &Path, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((path.to_path_buf(), line.to_string()));
    }
}

fn test_config(dir: &Path) -> TailConfig {
    TailConfig {
        poll_interval: Duration::from_millis(10),
        ..TailConfig::new(dir.join("offsets.json"))
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn append(path: &Path, line: &str) {
    let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    writeln!(f, "{line}").unwrap();
}

fn snapshot_entries(state_path: &Path) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(state_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    parsed["entries"].as_array().unwrap().clone()
}

#[test]
fn multi_filter_independence() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let all = Arc::new(Collector::default());
    let apps = Arc::new(Collector::default());
    mgr.add_filter("all", &logs, vec!["*.log".into()], all.clone())
        .unwrap();
    mgr.add_filter("apps", &logs, vec!["app.*".into()], apps.clone())
        .unwrap();

    let path = logs.join("app.log");
    std::fs::write(&path, "hello\n").unwrap();
    mgr.new_follower(&path).unwrap();

    // One physical file, two matching filters: two follows.
    assert_eq!(mgr.followed(), 2);
    wait_until(|| all.lines().len() == 1 && apps.lines().len() == 1);

    mgr.close().unwrap();

    // Each follow persisted its own offset entry.
    let entries = snapshot_entries(&dir.path().join("offsets.json"));
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry["offset"].as_u64().unwrap(), 6);
    }
    let mut filters: Vec<&str> = entries
        .iter()
        .map(|e| e["filter"].as_str().unwrap())
        .collect();
    filters.sort_unstable();
    assert_eq!(filters, vec!["all", "apps"]);
}

#[test]
fn new_follower_forces_fresh_offset() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let path = logs.join("app.log");
    std::fs::write(&path, "one\ntwo\n").unwrap();

    // First run consumes everything and snapshots at shutdown.
    {
        let mgr = FilterManager::new(test_config(dir.path())).unwrap();
        let collector = Arc::new(Collector::default());
        mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
            .unwrap();
        mgr.load_file(&path).unwrap();
        wait_until(|| collector.lines().len() == 2);
        mgr.close().unwrap();
    }

    // A `new_follower` notification discards the persisted offset.
    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let collector = Arc::new(Collector::default());
    mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
        .unwrap();
    mgr.new_follower(&path).unwrap();
    wait_until(|| collector.lines().len() == 2);
    assert_eq!(collector.lines(), vec!["one", "two"]);
    mgr.close().unwrap();
}

#[test]
fn load_file_resumes_from_snapshot() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let path = logs.join("app.log");
    std::fs::write(&path, "old\n").unwrap();

    {
        let mgr = FilterManager::new(test_config(dir.path())).unwrap();
        let collector = Arc::new(Collector::default());
        mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
            .unwrap();
        mgr.load_file(&path).unwrap();
        wait_until(|| collector.lines().len() == 1);
        mgr.close().unwrap();
    }

    append(&path, "new");

    // Second run resumes past the already-consumed bytes.
    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let collector = Arc::new(Collector::default());
    mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
        .unwrap();
    mgr.load_file(&path).unwrap();
    wait_until(|| !collector.lines().is_empty());
    assert_eq!(collector.lines(), vec!["new"]);
    mgr.close().unwrap();
}

#[test]
fn truncation_resets_persisted_offset() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let path = logs.join("app.log");
    std::fs::write(&path, "a long first line\n").unwrap();

    {
        let mgr = FilterManager::new(test_config(dir.path())).unwrap();
        let collector = Arc::new(Collector::default());
        mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
            .unwrap();
        mgr.load_file(&path).unwrap();
        wait_until(|| collector.lines().len() == 1);
        mgr.close().unwrap();
    }

    // The file shrank between runs: sanitation rewinds to the start.
    std::fs::write(&path, "tiny\n").unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let collector = Arc::new(Collector::default());
    mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
        .unwrap();
    mgr.load_file(&path).unwrap();
    wait_until(|| !collector.lines().is_empty());
    assert_eq!(collector.lines(), vec!["tiny"]);
    mgr.close().unwrap();
}

#[test]
fn stale_state_garbage_collected() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let kept = logs.join("kept.log");
    let doomed = logs.join("doomed.log");
    std::fs::write(&kept, "k\n").unwrap();
    std::fs::write(&doomed, "d\n").unwrap();

    {
        let mgr = FilterManager::new(test_config(dir.path())).unwrap();
        let collector = Arc::new(Collector::default());
        mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
            .unwrap();
        mgr.load_file(&kept).unwrap();
        mgr.load_file(&doomed).unwrap();
        wait_until(|| collector.lines().len() == 2);
        mgr.close().unwrap();
    }
    assert_eq!(snapshot_entries(&dir.path().join("offsets.json")).len(), 2);

    std::fs::remove_file(&doomed).unwrap();

    // Construction drops the entry for the missing file; it never resurfaces.
    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    mgr.close().unwrap();
    let entries = snapshot_entries(&dir.path().join("offsets.json"));
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0]["path"].as_str().unwrap(),
        kept.to_str().unwrap()
    );
}

#[test]
fn rename_within_filter_preserves_follower_and_offset() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let old_path = logs.join("app-1.log");
    std::fs::write(&old_path, "first\n").unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let collector = Arc::new(Collector::default());
    mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
        .unwrap();
    mgr.load_file(&old_path).unwrap();
    wait_until(|| collector.lines().len() == 1);

    // Rename to a name that still satisfies the filter.
    let new_path = logs.join("app-2.log");
    std::fs::rename(&old_path, &new_path).unwrap();
    mgr.rename_follower(&old_path).unwrap();
    assert_eq!(mgr.followed(), 1);

    // The follower was rekeyed, not recreated: appended lines flow with no
    // re-read of the first one, now attributed to the new path.
    append(&new_path, "second");
    wait_until(|| collector.lines().len() == 2);
    let entries = collector.entries();
    assert_eq!(entries[1], (new_path.clone(), "second".to_string()));

    mgr.close().unwrap();

    let persisted = snapshot_entries(&dir.path().join("offsets.json"));
    assert_eq!(persisted.len(), 1);
    assert_eq!(
        persisted[0]["path"].as_str().unwrap(),
        new_path.to_str().unwrap()
    );
    assert_eq!(persisted[0]["offset"].as_u64().unwrap(), 13);
}

#[test]
fn rename_detected_via_new_notification() {
    // The watcher reports the new name as a brand-new file; identity-based
    // rename detection rekeys instead of double-following.
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let old_path = logs.join("app-1.log");
    std::fs::write(&old_path, "first\n").unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let collector = Arc::new(Collector::default());
    mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
        .unwrap();
    mgr.load_file(&old_path).unwrap();
    wait_until(|| collector.lines().len() == 1);

    let new_path = logs.join("app-2.log");
    std::fs::rename(&old_path, &new_path).unwrap();
    mgr.new_follower(&new_path).unwrap();

    assert_eq!(mgr.followed(), 1);
    append(&new_path, "second");
    wait_until(|| collector.lines().len() == 2);
    assert_eq!(collector.lines(), vec!["first", "second"]);

    mgr.close().unwrap();
}

#[test]
fn rotation_out_of_pattern_then_fresh_file() {
    // Classic logrotate shape: app.log rotates to app.log.1 (no longer
    // matching *.log) and a fresh app.log appears later.
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let live = logs.join("app.log");
    std::fs::write(&live, "rotated away\n").unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let collector = Arc::new(Collector::default());
    mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
        .unwrap();
    mgr.load_file(&live).unwrap();
    wait_until(|| collector.lines().len() == 1);

    // Rotate: app.log -> app.log.1, which *.log does not match.
    std::fs::rename(&live, logs.join("app.log.1")).unwrap();
    mgr.rename_follower(&live).unwrap();
    assert_eq!(mgr.followed(), 0, "migration away must tear down the follower");

    // A fresh app.log gets its own independent notification.
    std::fs::write(&live, "fresh start\n").unwrap();
    mgr.new_follower(&live).unwrap();
    assert_eq!(mgr.followed(), 1);
    wait_until(|| collector.lines().len() == 2);
    assert_eq!(collector.lines()[1], "fresh start");

    mgr.close().unwrap();
    let persisted = snapshot_entries(&dir.path().join("offsets.json"));
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0]["offset"].as_u64().unwrap(), 12);
}

#[test]
fn rename_across_filters_restarts_stream() {
    let dir = tempdir().unwrap();
    let dir_a = dir.path().join("a");
    let dir_b = dir.path().join("b");
    std::fs::create_dir(&dir_a).unwrap();
    std::fs::create_dir(&dir_b).unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let coll_a = Arc::new(Collector::default());
    let coll_b = Arc::new(Collector::default());
    mgr.add_filter("a", &dir_a, vec!["*.log".into()], coll_a.clone())
        .unwrap();
    mgr.add_filter("b", &dir_b, vec!["*.log".into()], coll_b.clone())
        .unwrap();

    let old_path = dir_a.join("x.log");
    std::fs::write(&old_path, "seen by a\n").unwrap();
    mgr.load_file(&old_path).unwrap();
    wait_until(|| coll_a.lines().len() == 1);

    // Move the file into filter b's directory.
    let new_path = dir_b.join("x.log");
    std::fs::rename(&old_path, &new_path).unwrap();
    mgr.rename_follower(&old_path).unwrap();

    // A different filter means a new logical stream: fresh follower at 0.
    assert_eq!(mgr.followed(), 1);
    wait_until(|| coll_b.lines().len() == 1);
    assert_eq!(coll_b.lines(), vec!["seen by a"]);

    mgr.close().unwrap();
    let persisted = snapshot_entries(&dir.path().join("offsets.json"));
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0]["filter"].as_str().unwrap(), "b");
}

#[test]
fn rename_to_deleted_file_removes_follower() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let path = logs.join("app.log");
    std::fs::write(&path, "going away\n").unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    let collector = Arc::new(Collector::default());
    mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
        .unwrap();
    mgr.load_file(&path).unwrap();
    wait_until(|| collector.lines().len() == 1);

    // The file vanishes entirely; identity search finds nothing.
    std::fs::remove_file(&path).unwrap();
    mgr.rename_follower(&path).unwrap();
    assert_eq!(mgr.followed(), 0);

    mgr.close().unwrap();
    assert!(snapshot_entries(&dir.path().join("offsets.json")).is_empty());
}

#[test]
fn remove_follower_tears_down_all_filters() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    mgr.add_filter("all", &logs, vec!["*.log".into()], Arc::new(Collector::default()))
        .unwrap();
    mgr.add_filter("apps", &logs, vec!["app.*".into()], Arc::new(Collector::default()))
        .unwrap();

    let path = logs.join("app.log");
    std::fs::write(&path, "x\n").unwrap();
    mgr.load_file(&path).unwrap();
    assert_eq!(mgr.followed(), 2);

    mgr.remove_follower(&path).unwrap();
    assert_eq!(mgr.followed(), 0);

    mgr.close().unwrap();
    assert!(snapshot_entries(&dir.path().join("offsets.json")).is_empty());
}

#[test]
fn close_is_idempotent() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let path = logs.join("app.log");
    std::fs::write(&path, "x\n").unwrap();

    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    mgr.add_filter("logs", &logs, vec!["*.log".into()], Arc::new(Collector::default()))
        .unwrap();
    mgr.load_file(&path).unwrap();

    mgr.close().unwrap();
    mgr.close().unwrap();
    assert_eq!(mgr.followed(), 0);
    assert_eq!(mgr.filters(), 0);
}

#[test]
fn snapshot_round_trip_with_sanitation() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let steady = logs.join("steady.log");
    let shrunk = logs.join("shrunk.log");
    let gone = logs.join("gone.log");
    std::fs::write(&steady, "stays put\n").unwrap();
    std::fs::write(&shrunk, "long content here\n").unwrap();
    std::fs::write(&gone, "disappears\n").unwrap();

    {
        let mgr = FilterManager::new(test_config(dir.path())).unwrap();
        let collector = Arc::new(Collector::default());
        mgr.add_filter("logs", &logs, vec!["*.log".into()], collector.clone())
            .unwrap();
        for p in [&steady, &shrunk, &gone] {
            mgr.load_file(p).unwrap();
        }
        wait_until(|| collector.lines().len() == 3);
        mgr.close().unwrap();
    }

    std::fs::write(&shrunk, "s\n").unwrap();
    std::fs::remove_file(&gone).unwrap();

    // Reconstructing from the same store yields the sanitized map: the
    // missing file dropped, the shrunken one rewound, the steady one intact.
    let mgr = FilterManager::new(test_config(dir.path())).unwrap();
    mgr.close().unwrap();

    let entries = snapshot_entries(&dir.path().join("offsets.json"));
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        let path = entry["path"].as_str().unwrap();
        let offset = entry["offset"].as_u64().unwrap();
        if path == steady.to_str().unwrap() {
            assert_eq!(offset, 10);
        } else {
            assert_eq!(path, shrunk.to_str().unwrap());
            assert_eq!(offset, 0);
        }
    }
}
