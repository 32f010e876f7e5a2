use std::fs::OpenOptions as FsOpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::Result;
use tempfile::TempDir;

use burrow::{Cursor, Error, OpenOptions, DB};

fn scratch(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

#[test]
fn create_put_commit_read() -> Result<()> {
    let (_dir, path) = scratch("widgets.db");
    let db = OpenOptions::new().page_size(4096).open(&path)?;
    {
        let mut tx = db.tx(true)?;
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"a", b"1")?;
        tx.commit()?;
    }
    let tx = db.tx(false)?;
    let b = tx.bucket(b"widgets")?;
    assert_eq!(b.get(b"a"), Some(&b"1"[..]));
    // initial four pages plus at least one new page after the commit
    assert!(tx.size() >= 5 * 4096);
    Ok(())
}

#[test]
fn reopen_preserves_committed_state() -> Result<()> {
    let (_dir, path) = scratch("reopen.db");
    {
        let db = DB::open(&path)?;
        db.update(|tx| {
            let b = tx.create_bucket(b"data")?;
            b.put(b"hello", b"world")?;
            b.put(b"gone", b"soon")?;
            Ok(())
        })?;
        db.update(|tx| tx.bucket_mut(b"data")?.delete(b"gone"))?;
    }
    let db = DB::open(&path)?;
    db.view(|tx| {
        let b = tx.bucket(b"data")?;
        assert_eq!(b.get(b"hello"), Some(&b"world"[..]));
        assert_eq!(b.get(b"gone"), None);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn ten_thousand_keys_iterate_in_order() -> Result<()> {
    let (_dir, path) = scratch("ordered.db");
    let db = OpenOptions::new().page_size(4096).open(&path)?;
    {
        let mut tx = db.tx(true)?;
        let b = tx.create_bucket(b"kv")?;
        // visit 0..10000 in a scrambled but complete order
        let n = 10_000u64;
        for i in 0..n {
            let j = (i * 7919) % n;
            b.put(
                format!("k{:04}", j).as_bytes(),
                format!("v{}", j).as_bytes(),
            )?;
        }
        tx.commit()?;
    }

    let tx = db.tx(false)?;
    let b = tx.bucket(b"kv")?;

    let mut count = 0u64;
    let mut prev: Option<Vec<u8>> = None;
    for (k, _) in b.cursor() {
        if let Some(p) = &prev {
            assert!(p.as_slice() < k, "cursor out of order");
        }
        prev = Some(k.to_vec());
        count += 1;
    }
    assert_eq!(count, 10_000);

    let mut c = b.cursor();
    let (k, v) = c.seek(b"k5000").expect("seek hit");
    assert_eq!(k, b"k5000");
    assert_eq!(v, Some(&b"v5000"[..]));

    // partial match lands on the next key in order
    let (k, v) = c.seek(b"k4999z").expect("seek partial");
    assert_eq!(k, b"k5000");
    assert_eq!(v, Some(&b"v5000"[..]));
    Ok(())
}

#[test]
fn readers_keep_their_snapshot() -> Result<()> {
    let (_dir, path) = scratch("mvcc.db");
    let db = OpenOptions::new().page_size(4096).open(&path)?;
    db.update(|tx| {
        let b = tx.create_bucket(b"kv")?;
        for i in 0..500u32 {
            b.put(format!("k{:03}", i).as_bytes(), b"v")?;
        }
        Ok(())
    })?;

    let t1 = db.tx(false)?;
    let before = t1.size();

    // another transaction deletes everything
    db.update(|tx| {
        let b = tx.bucket_mut(b"kv")?;
        for i in 0..500u32 {
            b.delete(format!("k{:03}", i).as_bytes())?;
        }
        Ok(())
    })?;

    // the old reader still sees every key
    let b = t1.bucket(b"kv")?;
    for i in 0..500u32 {
        assert!(b.get(format!("k{:03}", i).as_bytes()).is_some());
    }
    drop(b);
    t1.rollback()?;

    // with the reader gone, freed pages get recycled instead of growing
    // the file
    db.update(|tx| {
        let b = tx.bucket_mut(b"kv")?;
        for i in 0..500u32 {
            b.put(format!("n{:03}", i).as_bytes(), b"v")?;
        }
        Ok(())
    })?;
    let after = db.view(|tx| Ok(tx.size()))?;
    assert!(
        after <= before + 16 * 4096,
        "file grew from {} to {} despite reclaimable pages",
        before,
        after
    );
    Ok(())
}

#[test]
fn nested_buckets_survive_reopen() -> Result<()> {
    let (_dir, path) = scratch("nested.db");
    {
        let db = DB::open(&path)?;
        db.update(|tx| {
            let a = tx.create_bucket(b"a")?;
            let b = a.create_bucket(b"b")?;
            b.put(b"k", b"v")?;
            Ok(())
        })?;
    }
    let db = DB::open(&path)?;
    db.view(|tx| {
        let a = tx.bucket(b"a")?;
        let b = a.bucket(b"b").ok_or(Error::BucketNotFound)?;
        assert_eq!(b.get(b"k"), Some(&b"v"[..]));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn fill_percent_packs_appends_tighter() -> Result<()> {
    let fill = |path: &PathBuf, fill_percent: Option<f64>| -> Result<u64> {
        let db = OpenOptions::new().page_size(4096).open(path)?;
        {
            let mut tx = db.tx(true)?;
            let b = tx.create_bucket(b"seq")?;
            if let Some(f) = fill_percent {
                b.set_fill_percent(f);
            }
            for i in 0..1000u32 {
                b.put(format!("key{:08}", i).as_bytes(), b"0123456789abcdef")?;
            }
            tx.commit()?;
        }
        let size = db.view(|tx| Ok(tx.size()))?;
        Ok(size)
    };

    let (_d1, p1) = scratch("packed.db");
    let (_d2, p2) = scratch("default.db");
    let packed = fill(&p1, Some(1.0))?;
    let default = fill(&p2, None)?;
    assert!(
        packed <= default,
        "fill_percent=1.0 used {} bytes, default used {}",
        packed,
        default
    );
    Ok(())
}

#[test]
fn corrupt_meta_falls_back_to_twin() -> Result<()> {
    let (_dir, path) = scratch("twometa.db");
    {
        let db = OpenOptions::new().page_size(4096).open(&path)?;
        // txid 2 lands in meta slot 0
        db.update(|tx| {
            tx.create_bucket(b"first")?;
            Ok(())
        })?;
    }

    // flip one bit inside meta page 0's checksum
    {
        let mut f = FsOpenOptions::new().read(true).write(true).open(&path)?;
        f.seek(SeekFrom::Start(72))?;
        let mut byte = [0u8; 1];
        f.read_exact(&mut byte)?;
        byte[0] ^= 0x01;
        f.seek(SeekFrom::Start(72))?;
        f.write_all(&byte)?;
        f.sync_all()?;
    }

    {
        let db = OpenOptions::new().page_size(4096).open(&path)?;
        // slot 0 is invalid, so the previous-good meta (txid 1) wins and
        // the bucket from the damaged commit is gone
        db.view(|tx| {
            assert!(matches!(tx.bucket(b"first"), Err(Error::BucketNotFound)));
            Ok(())
        })?;
        // a fresh commit (txid 2 again) rewrites slot 0 as current
        db.update(|tx| {
            tx.create_bucket(b"second")?;
            Ok(())
        })?;
    }
    let db = DB::open(&path)?;
    db.view(|tx| {
        tx.bucket(b"second")?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn delete_all_keeps_an_empty_root() -> Result<()> {
    let (_dir, path) = scratch("drain.db");
    let db = DB::open(&path)?;
    db.update(|tx| {
        let b = tx.create_bucket(b"kv")?;
        for i in 0..10u32 {
            b.put(format!("k{}", i).as_bytes(), b"v")?;
        }
        Ok(())
    })?;
    db.update(|tx| {
        let b = tx.bucket_mut(b"kv")?;
        for i in 0..10u32 {
            b.delete(format!("k{}", i).as_bytes())?;
        }
        Ok(())
    })?;
    db.view(|tx| {
        let b = tx.bucket(b"kv")?;
        assert_eq!(b.cursor().count(), 0);
        Ok(())
    })?;
    // the emptied bucket still accepts writes
    db.update(|tx| tx.bucket_mut(b"kv")?.put(b"again", b"v"))?;
    db.view(|tx| {
        assert_eq!(tx.bucket(b"kv")?.get(b"again"), Some(&b"v"[..]));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn argument_violations_surface_as_typed_errors() -> Result<()> {
    let (_dir, path) = scratch("errors.db");
    let db = DB::open(&path)?;
    let mut tx = db.tx(true)?;
    let b = tx.create_bucket(b"kv")?;
    b.put(b"plain", b"value")?;

    assert!(matches!(b.put(b"", b"v"), Err(Error::KeyRequired)));
    let long_key = vec![b'x'; 32769];
    assert!(matches!(b.put(&long_key, b"v"), Err(Error::KeyTooLarge)));

    b.create_bucket(b"sub")?;
    assert!(matches!(b.put(b"sub", b"v"), Err(Error::IncompatibleValue)));
    assert!(matches!(b.delete(b"sub"), Err(Error::IncompatibleValue)));
    assert!(matches!(
        b.create_bucket(b"sub"),
        Err(Error::BucketExists)
    ));
    assert!(matches!(
        b.create_bucket(b"plain"),
        Err(Error::IncompatibleValue)
    ));
    assert!(matches!(
        b.delete_bucket(b"missing"),
        Err(Error::BucketNotFound)
    ));
    assert!(matches!(
        b.delete_bucket(b"plain"),
        Err(Error::IncompatibleValue)
    ));
    assert!(matches!(b.create_bucket(b""), Err(Error::BucketNameRequired)));

    assert!(!b.put_if_absent(b"plain", b"other")?);
    assert_eq!(b.get(b"plain"), Some(&b"value"[..]));
    tx.commit()?;

    // writes through a read-only transaction are rejected
    let mut tx = db.tx(false)?;
    assert!(matches!(
        tx.bucket_mut(b"kv")?.put(b"k", b"v"),
        Err(Error::TxReadOnly)
    ));
    Ok(())
}

#[test]
fn read_only_open_rejects_writers() -> Result<()> {
    let (_dir, path) = scratch("ro.db");
    {
        let db = DB::open(&path)?;
        db.update(|tx| {
            tx.create_bucket(b"kv")?;
            Ok(())
        })?;
    }
    let db = OpenOptions::new().read_only(true).open(&path)?;
    assert!(db.is_read_only());
    assert!(matches!(db.tx(true), Err(Error::DatabaseReadOnly)));
    db.view(|tx| {
        tx.bucket(b"kv")?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn prev_walks_the_exact_inverse_of_next() -> Result<()> {
    let (_dir, path) = scratch("inverse.db");
    let db = DB::open(&path)?;
    db.update(|tx| {
        let b = tx.create_bucket(b"kv")?;
        for i in 0..257u32 {
            b.put(format!("k{:05}", i * 3).as_bytes(), b"v")?;
        }
        Ok(())
    })?;
    db.view(|tx| {
        let b = tx.bucket(b"kv")?;
        let mut forward: Vec<Vec<u8>> = Vec::new();
        {
            let mut c = b.cursor();
            let mut item = c.first();
            while let Some((k, _)) = item {
                forward.push(k.to_vec());
                item = c.next();
            }
        }
        let mut backward: Vec<Vec<u8>> = Vec::new();
        {
            let mut c = b.cursor();
            let mut item = Cursor::last(&mut c);
            while let Some((k, _)) = item {
                backward.push(k.to_vec());
                item = Cursor::prev(&mut c);
            }
        }
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 257);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn buckets_iterator_sees_only_sub_buckets() -> Result<()> {
    let (_dir, path) = scratch("mixed.db");
    let db = DB::open(&path)?;
    db.update(|tx| {
        let b = tx.create_bucket(b"mixed")?;
        b.put(b"alpha", b"1")?;
        b.create_bucket(b"beta")?;
        b.put(b"gamma", b"2")?;
        b.create_bucket(b"delta")?;
        Ok(())
    })?;
    db.view(|tx| {
        let b = tx.bucket(b"mixed")?;
        let names: Vec<Vec<u8>> = b.buckets().map(|n| n.to_vec()).collect();
        assert_eq!(names, vec![b"beta".to_vec(), b"delta".to_vec()]);

        let keys: Vec<Vec<u8>> = b.cursor().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![b"alpha".to_vec(), b"gamma".to_vec()]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn update_rolls_back_on_error() -> Result<()> {
    let (_dir, path) = scratch("rollback.db");
    let db = DB::open(&path)?;
    db.update(|tx| {
        tx.create_bucket(b"kv")?;
        Ok(())
    })?;

    let failed: burrow::Result<()> = db.update(|tx| {
        tx.bucket_mut(b"kv")?.put(b"phantom", b"v")?;
        Err(Error::KeyRequired)
    });
    assert!(failed.is_err());

    db.view(|tx| {
        assert_eq!(tx.bucket(b"kv")?.get(b"phantom"), None);
        Ok(())
    })?;
    // the database remains usable on the prior snapshot
    db.update(|tx| tx.bucket_mut(b"kv")?.put(b"real", b"v"))?;
    db.view(|tx| {
        assert_eq!(tx.bucket(b"kv")?.get(b"real"), Some(&b"v"[..]));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn explicit_rollback_discards_writes() -> Result<()> {
    let (_dir, path) = scratch("discard.db");
    let db = DB::open(&path)?;
    db.update(|tx| {
        tx.create_bucket(b"kv")?;
        Ok(())
    })?;
    {
        let mut tx = db.tx(true)?;
        tx.bucket_mut(b"kv")?.put(b"temp", b"v")?;
        tx.rollback()?;
    }
    {
        // dropping without commit rolls back too
        let mut tx = db.tx(true)?;
        tx.bucket_mut(b"kv")?.put(b"temp2", b"v")?;
    }
    db.view(|tx| {
        let b = tx.bucket(b"kv")?;
        assert_eq!(b.get(b"temp"), None);
        assert_eq!(b.get(b"temp2"), None);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn large_values_span_overflow_pages() -> Result<()> {
    let (_dir, path) = scratch("overflow.db");
    let db = OpenOptions::new().page_size(4096).open(&path)?;
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    db.update(|tx| {
        let b = tx.create_bucket(b"blobs")?;
        b.put(b"big", &big)?;
        b.put(b"small", b"s")?;
        Ok(())
    })?;
    let db2 = {
        drop(db);
        DB::open(&path)?
    };
    db2.view(|tx| {
        let b = tx.bucket(b"blobs")?;
        assert_eq!(b.get(b"big"), Some(&big[..]));
        assert_eq!(b.get(b"small"), Some(&b"s"[..]));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn sequences_persist_across_commits() -> Result<()> {
    let (_dir, path) = scratch("seq.db");
    {
        let db = DB::open(&path)?;
        db.update(|tx| {
            let b = tx.create_bucket(b"jobs")?;
            assert_eq!(b.next_sequence()?, 1);
            assert_eq!(b.next_sequence()?, 2);
            Ok(())
        })?;
    }
    let db = DB::open(&path)?;
    db.update(|tx| {
        let b = tx.bucket_mut(b"jobs")?;
        assert_eq!(b.sequence(), 2);
        assert_eq!(b.next_sequence()?, 3);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn delete_bucket_recurses_and_reclaims() -> Result<()> {
    let (_dir, path) = scratch("prune.db");
    let db = DB::open(&path)?;
    db.update(|tx| {
        let outer = tx.create_bucket(b"outer")?;
        outer.put(b"key", b"v")?;
        let inner = outer.create_bucket(b"inner")?;
        for i in 0..300u32 {
            inner.put(format!("k{:03}", i).as_bytes(), b"payload-payload")?;
        }
        inner.create_bucket(b"deepest")?;
        Ok(())
    })?;
    db.update(|tx| tx.bucket_mut(b"outer")?.delete_bucket(b"inner"))?;
    db.view(|tx| {
        let outer = tx.bucket(b"outer")?;
        assert!(outer.bucket(b"inner").is_none());
        assert_eq!(outer.get(b"key"), Some(&b"v"[..]));
        Ok(())
    })?;

    // deleting at the root works the same way
    db.update(|tx| tx.delete_bucket(b"outer"))?;
    db.view(|tx| {
        assert!(matches!(tx.bucket(b"outer"), Err(Error::BucketNotFound)));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn unsynced_freelist_is_rebuilt_and_materialized() -> Result<()> {
    let (_dir, path) = scratch("nofsync.db");
    {
        let db = OpenOptions::new().no_freelist_sync(true).open(&path)?;
        db.update(|tx| {
            let b = tx.create_bucket(b"kv")?;
            for i in 0..100u32 {
                b.put(format!("k{:03}", i).as_bytes(), b"v")?;
            }
            Ok(())
        })?;
        db.update(|tx| {
            let b = tx.bucket_mut(b"kv")?;
            for i in 0..50u32 {
                b.delete(format!("k{:03}", i).as_bytes())?;
            }
            Ok(())
        })?;
    }
    // reopening with a synced freelist rebuilds it by reachability and
    // commits once to put it on disk
    {
        let db = DB::open(&path)?;
        db.view(|tx| {
            let b = tx.bucket(b"kv")?;
            assert_eq!(b.get(b"k000"), None);
            assert_eq!(b.get(b"k099"), Some(&b"v"[..]));
            Ok(())
        })?;
    }
    let db = DB::open(&path)?;
    db.view(|tx| {
        assert_eq!(tx.bucket(b"kv")?.cursor().count(), 50);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn commit_handlers_run_after_success() -> Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let (_dir, path) = scratch("hooks.db");
    let db = DB::open(&path)?;
    let fired = Arc::new(AtomicBool::new(false));
    {
        let mut tx = db.tx(true)?;
        tx.create_bucket(b"kv")?;
        let flag = fired.clone();
        tx.on_commit(move || flag.store(true, Ordering::SeqCst));
        tx.commit()?;
    }
    assert!(fired.load(Ordering::SeqCst));

    let fired = Arc::new(AtomicBool::new(false));
    {
        let mut tx = db.tx(true)?;
        tx.bucket_mut(b"kv")?.put(b"k", b"v")?;
        let flag = fired.clone();
        tx.on_commit(move || flag.store(true, Ordering::SeqCst));
        tx.rollback()?;
    }
    assert!(!fired.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn concurrent_readers_while_writing() -> Result<()> {
    let (_dir, path) = scratch("threads.db");
    let db = DB::open(&path)?;
    db.update(|tx| {
        let b = tx.create_bucket(b"kv")?;
        for i in 0..200u32 {
            b.put(format!("k{:03}", i).as_bytes(), b"v0")?;
        }
        Ok(())
    })?;

    let mut readers = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        readers.push(std::thread::spawn(move || {
            for _ in 0..20 {
                db.view(|tx| {
                    let b = tx.bucket(b"kv")?;
                    let n = b.cursor().count();
                    assert_eq!(n, 200, "snapshot must always hold 200 keys");
                    Ok(())
                })
                .expect("read tx");
            }
        }));
    }
    for round in 0..10u32 {
        db.update(|tx| {
            let b = tx.bucket_mut(b"kv")?;
            for i in 0..200u32 {
                b.put(
                    format!("k{:03}", i).as_bytes(),
                    format!("v{}", round).as_bytes(),
                )?;
            }
            Ok(())
        })?;
    }
    for r in readers {
        r.join().expect("reader thread");
    }
    Ok(())
}
