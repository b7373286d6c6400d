//! End-to-end scenarios driving the memoizer through real child
//! processes and a real on-disk cache.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use stoke_core::{
    BuildError, FailureKind, Feedback, Memo, MemoConfig, NotifyKind, OpKind, Sink, SpawnCmd,
    SpawnSpec, Status, WriteSpec,
};
use tempfile::TempDir;

const SH: &str = "/bin/sh";

struct Build {
    memo: Memo,
    spawn_starts: Rc<Cell<usize>>,
}

fn build(root: &Path, workdir: &Path) -> Build {
    let spawn_starts = Rc::new(Cell::new(0));
    let counter = spawn_starts.clone();
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    let mut config = MemoConfig::new(root.join("cache"), root.join("trash"));
    config.cwd = Some(workdir.to_path_buf());
    config.env = env;
    config.jobs = 2;
    config.feedback = Some(Box::new(move |f| {
        if matches!(f, Feedback::SpawnStart { .. }) {
            counter.set(counter.get() + 1);
        }
    }));
    Build {
        memo: Memo::new(config).unwrap(),
        spawn_starts,
    }
}

fn sh(script: &str) -> SpawnCmd {
    SpawnCmd::new(SH, ["-c", script])
}

fn quiet() -> SpawnSpec {
    SpawnSpec {
        stdout: Sink::Null,
        stderr: Sink::Null,
        ..SpawnSpec::default()
    }
}

#[test]
fn second_build_revives_instead_of_spawning() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let out = workdir.join("out.txt");

    let exits = Rc::new(Cell::new(None));
    {
        let b = build(tmp.path(), &workdir);
        let exits_cb = exits.clone();
        let op = b.memo.spawn(
            sh("echo hello > out.txt"),
            SpawnSpec {
                writes: std::iter::once(out.clone()).collect(),
                ..quiet()
            },
            move |_m, code| {
                exits_cb.set(Some(code));
                Ok(())
            },
        );
        b.memo.stir(true);
        assert!(b.memo.status().is_ok());
        assert_eq!(exits.get(), Some(0));
        assert_eq!(b.spawn_starts.get(), 1);
        assert!(!op.borrow().revived);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
    }

    // Same inputs: the operation must come back from the cache without a
    // child process being started.
    fs::remove_file(&out).unwrap();
    {
        let b = build(tmp.path(), &workdir);
        let op = b.memo.spawn(
            sh("echo hello > out.txt"),
            SpawnSpec {
                writes: std::iter::once(out.clone()).collect(),
                ..quiet()
            },
            |_m, code| {
                assert_eq!(code, 0);
                Ok(())
            },
        );
        b.memo.stir(true);
        assert!(b.memo.status().is_ok());
        assert_eq!(b.spawn_starts.get(), 0);
        assert!(op.borrow().revived);
        assert_eq!(op.borrow().status, Status::Done);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
    }
}

#[test]
fn missing_read_fails_the_operation() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let missing = workdir.join("nonexistent.h");

    let b = build(tmp.path(), &workdir);
    // The client believes the header exists and declares it ready; the
    // reviver then discovers it cannot be hashed.
    b.memo.file_ready(&missing);
    let ran = Rc::new(Cell::new(false));
    let ran2 = ran.clone();
    let op = b.memo.spawn(
        sh("true"),
        SpawnSpec {
            reads: std::iter::once(missing.clone()).collect(),
            ..quiet()
        },
        move |_m, _code| {
            ran2.set(true);
            Ok(())
        },
    );
    b.memo.stir(true);

    assert_eq!(
        op.borrow().status,
        Status::Failed(FailureKind::MissingReads(vec![missing]))
    );
    assert!(!ran.get());
    assert_eq!(b.memo.status(), Err(BuildError::Failures));
}

#[test]
fn missing_write_aborts_downstream_readers() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let a_out = workdir.join("a.out");

    let b = build(tmp.path(), &workdir);
    let producer = b.memo.spawn(
        sh("true"), // exits 0 without creating a.out
        SpawnSpec {
            writes: std::iter::once(a_out.clone()).collect(),
            ..quiet()
        },
        |_m, _code| Ok(()),
    );
    let reader_ran = Rc::new(Cell::new(false));
    let reader_ran2 = reader_ran.clone();
    let reader = b.memo.read(&a_out, move |_m, _data| {
        reader_ran2.set(true);
        Ok(())
    });
    b.memo.stir(true);

    assert_eq!(
        producer.borrow().status,
        Status::Failed(FailureKind::MissingWrites(vec![a_out]))
    );
    assert_eq!(reader.borrow().status, Status::Aborted);
    assert!(!reader_ran.get());
    assert_eq!(b.memo.status(), Err(BuildError::Failures));
}

#[test]
fn read_write_cycle_is_reported() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let x = workdir.join("x");
    let y = workdir.join("y");

    let b = build(tmp.path(), &workdir);
    let a = b.memo.spawn(
        sh("true"),
        SpawnSpec {
            reads: std::iter::once(y.clone()).collect(),
            writes: std::iter::once(x.clone()).collect(),
            ..quiet()
        },
        |_m, _code| Ok(()),
    );
    let c = b.memo.spawn(
        sh("true"),
        SpawnSpec {
            reads: std::iter::once(x.clone()).collect(),
            writes: std::iter::once(y.clone()).collect(),
            ..quiet()
        },
        |_m, _code| Ok(()),
    );
    b.memo.stir(true);

    let mut expected = vec![a.borrow().id, c.borrow().id];
    expected.sort_unstable();
    assert_eq!(b.memo.status(), Err(BuildError::Cycle(expected)));
    assert_eq!(b.spawn_starts.get(), 0);
}

#[test]
fn unproduced_read_reports_never_became_ready() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let p = workdir.join("input.txt");

    let b = build(tmp.path(), &workdir);
    b.memo.read(&p, |_m, _data| Ok(()));
    b.memo.stir(true);
    assert_eq!(
        b.memo.status(),
        Err(BuildError::NeverBecameReady(vec![p]))
    );
}

#[test]
fn file_ready_unblocks_waiters() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let input = workdir.join("input.txt");
    fs::write(&input, b"seed").unwrap();

    let b = build(tmp.path(), &workdir);
    let got = Rc::new(Cell::new(false));
    let got2 = got.clone();
    b.memo.wait_files(vec![input.clone()], move |_m| {
        got2.set(true);
        Ok(())
    });
    b.memo.file_ready(&input);
    b.memo.stir(true);
    assert!(got.get());
    assert!(b.memo.status().is_ok());
}

#[test]
fn write_stamp_discriminates_cache_keys() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let target = workdir.join("gen.txt");
    let runs = Rc::new(Cell::new(0));

    let produce = |b: &Build, stamp: &str, bytes: &'static [u8], runs: Rc<Cell<usize>>| {
        b.memo.write(
            &target,
            WriteSpec {
                stamp: stamp.to_string(),
                ..WriteSpec::default()
            },
            move || {
                runs.set(runs.get() + 1);
                Ok(bytes.to_vec())
            },
        );
        b.memo.stir(true);
        assert!(b.memo.status().is_ok());
    };

    let b = build(tmp.path(), &workdir);
    produce(&b, "v1", b"first", runs.clone());
    assert_eq!(runs.get(), 1);
    assert_eq!(fs::read(&target).unwrap(), b"first");

    // Same stamp revives without invoking the producer.
    fs::remove_file(&target).unwrap();
    let b = build(tmp.path(), &workdir);
    produce(&b, "v1", b"first", runs.clone());
    assert_eq!(runs.get(), 1);
    assert_eq!(fs::read(&target).unwrap(), b"first");

    // A different stamp is a different key and runs.
    let b = build(tmp.path(), &workdir);
    produce(&b, "v2", b"second", runs.clone());
    assert_eq!(runs.get(), 2);
    assert_eq!(fs::read(&target).unwrap(), b"second");
}

#[test]
fn writes_become_ready_before_reader_continuations() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let f = workdir.join("stage1.txt");

    let b = build(tmp.path(), &workdir);
    let seen = Rc::new(Cell::new(false));
    let seen2 = seen.clone();
    // Reader first, so it has to wait for the writer.
    b.memo.read(&f, move |_m, data| {
        assert_eq!(data, b"staged");
        seen2.set(true);
        Ok(())
    });
    b.memo.write(&f, WriteSpec::default(), || Ok(b"staged".to_vec()));
    b.memo.stir(true);
    assert!(seen.get());
    assert!(b.memo.status().is_ok());
}

#[test]
fn spawn_all_discovers_and_revives_an_output_tree() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let out_root = workdir.join("out");
    let script = "mkdir -p out/sub && echo a > out/a.txt && echo b > out/sub/b.txt";

    {
        let b = build(tmp.path(), &workdir);
        let op = b
            .memo
            .spawn_all(sh(script), &out_root, quiet(), |_m, _code| Ok(()));
        b.memo.stir(true);
        assert!(b.memo.status().is_ok());
        assert_eq!(b.spawn_starts.get(), 1);
        let writes = op.borrow().writes.clone();
        assert!(writes.contains(&out_root.join("a.txt")));
        assert!(writes.contains(&out_root.join("sub/b.txt")));
    }

    fs::remove_dir_all(&out_root).unwrap();
    {
        let b = build(tmp.path(), &workdir);
        let op = b
            .memo
            .spawn_all(sh(script), &out_root, quiet(), |_m, _code| Ok(()));
        b.memo.stir(true);
        assert!(b.memo.status().is_ok());
        assert_eq!(b.spawn_starts.get(), 0);
        assert!(op.borrow().revived);
        assert_eq!(fs::read_to_string(out_root.join("a.txt")).unwrap(), "a\n");
        assert_eq!(
            fs::read_to_string(out_root.join("sub/b.txt")).unwrap(),
            "b\n"
        );
    }
}

#[test]
fn copy_and_mkdir_and_delete_flow() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let src = workdir.join("src.c");
    fs::write(&src, b"int main(void) { return 0; }\n").unwrap();
    let staging = workdir.join("staging");
    let dst = staging.join("src.c");

    let b = build(tmp.path(), &workdir);
    b.memo.file_ready(&src);
    let made = Rc::new(Cell::new(false));
    let made2 = made.clone();
    b.memo.mkdir(&staging, 0o755, move |_m| {
        made2.set(true);
        Ok(())
    });
    b.memo.copy(&src, &dst, stoke_core::CopySpec::default());
    b.memo.stir(true);
    assert!(made.get());
    assert_eq!(fs::read(&dst).unwrap(), fs::read(&src).unwrap());

    let deleted = Rc::new(Cell::new(false));
    let deleted2 = deleted.clone();
    b.memo.delete(&dst, move |_m| {
        deleted2.set(true);
        Ok(())
    });
    b.memo.stir(true);
    assert!(deleted.get());
    assert!(!dst.exists());
    assert!(b.memo.status().is_ok());
}

#[test]
fn fail_in_continuation_is_a_deliberate_failure() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let input = workdir.join("input.txt");
    fs::write(&input, b"bad contents").unwrap();

    let b = build(tmp.path(), &workdir);
    b.memo.file_ready(&input);
    b.memo.read(&input, |m, data| {
        if data != b"expected" {
            return Err(m.fail("input file has unexpected contents"));
        }
        Ok(())
    });
    b.memo.stir(true);

    assert!(b.memo.has_failures());
    assert_eq!(b.memo.status(), Err(BuildError::Failures));
    // The failure surfaced through a notification op, not a panic report.
    let fails: Vec<String> = b
        .memo
        .ops()
        .iter()
        .filter_map(|op| match &op.borrow().kind {
            OpKind::Notify(n) if n.kind == NotifyKind::Fail => Some(n.msg.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(fails.len(), 1);
    assert!(fails[0].contains("unexpected contents"));
}

#[test]
fn identical_spawns_in_one_build_execute_once() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let out = workdir.join("stamp.txt");

    let b = build(tmp.path(), &workdir);
    let spec = |out: &PathBuf| SpawnSpec {
        writes: std::iter::once(out.clone()).collect(),
        ..quiet()
    };
    b.memo
        .spawn(sh("echo once > stamp.txt"), spec(&out), |_m, _c| Ok(()));
    b.memo.stir(true);
    b.memo
        .spawn(sh("echo once > stamp.txt"), spec(&out), |_m, _c| Ok(()));
    b.memo.stir(true);

    assert!(b.memo.status().is_ok());
    assert_eq!(b.spawn_starts.get(), 1);
    let ops = b.memo.ops();
    let revived: Vec<bool> = ops
        .iter()
        .filter(|op| matches!(op.borrow().kind, OpKind::Spawn(_)))
        .map(|op| op.borrow().revived)
        .collect();
    assert_eq!(revived, vec![false, true]);
}

#[test]
fn futures_fire_after_their_fiber_completes() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let input = workdir.join("input.txt");
    fs::write(&input, b"42").unwrap();

    let b = build(tmp.path(), &workdir);
    b.memo.file_ready(&input);
    let input2 = input.clone();
    let fut: stoke_core::Future<usize> = stoke_core::Future::of_fiber(&b.memo, move |m, k| {
        m.read(&input2, move |m, data| k(m, data.len()));
        Ok(())
    });
    let observed = Rc::new(Cell::new(None));
    let observed2 = observed.clone();
    fut.await_det(&b.memo, move |_m, len| {
        observed2.set(Some(*len));
        Ok(())
    });
    b.memo.stir(true);
    assert_eq!(observed.get(), Some(2));
    assert_eq!(*fut.value().unwrap(), 2);
}

#[test]
fn double_set_future_panics() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("build");
    fs::create_dir_all(&workdir).unwrap();
    let b = build(tmp.path(), &workdir);
    let fut: stoke_core::Future<u8> = stoke_core::Future::new();
    fut.set(&b.memo, 1);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        fut.set(&b.memo, 2);
    }));
    assert!(result.is_err());
}
