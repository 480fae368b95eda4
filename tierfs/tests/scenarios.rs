mod common;

use common::{names, stores, vp};
use tierfs::fs::EntryKind;
use tierfs::tier::Tier;
use tierfs::{TierError, TierFs};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn grows_past_threshold_then_shrinks_back() {
    let st = stores(512);
    let fs = TierFs::new(st.config.clone());
    let x = vp("/x");

    fs.create(&x, 0o644, 0).await.unwrap();
    fs.write(&x, 0, &[b'a'; 100]).await.unwrap();
    assert_eq!(fs.locate(&x).await.unwrap().tier, Tier::Fast);
    assert_eq!(fs.getattr(&x).await.unwrap().size, 100);

    fs.write(&x, 100, &[b'b'; 500]).await.unwrap();
    let loc = fs.locate(&x).await.unwrap();
    assert_eq!(loc.tier, Tier::Slow);
    let attr = fs.getattr(&x).await.unwrap();
    assert_eq!(attr.size, 600);
    assert_eq!(attr.kind, EntryKind::RegularFile);
    assert!(st.fast.join(".tier~meta~x").exists());
    assert_eq!(std::fs::metadata(&loc.physical).unwrap().len(), 600);

    let attr = fs.truncate(&x, 10).await.unwrap();
    assert_eq!(attr.size, 10);
    assert_eq!(fs.locate(&x).await.unwrap().tier, Tier::Fast);
    assert_eq!(std::fs::read(st.fast.join("x")).unwrap(), vec![b'a'; 10]);
    assert_eq!(names(&st.fast), vec!["x"]);
    assert!(names(&st.slow).is_empty());
}

#[tokio::test]
async fn tier_follows_size() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    for (i, len) in [0usize, 1, 63, 64, 65, 300].into_iter().enumerate() {
        let path = vp(&format!("/f{i}"));
        fs.create(&path, 0o644, 0).await.unwrap();
        if len > 0 {
            fs.write(&path, 0, &pattern(len)).await.unwrap();
        }
        let expected = if len >= 64 { Tier::Slow } else { Tier::Fast };
        assert_eq!(fs.locate(&path).await.unwrap().tier, expected, "len {len}");
        assert_eq!(fs.getattr(&path).await.unwrap().size, len as u64);
    }
}

#[tokio::test]
async fn reads_return_what_was_written() {
    let st = stores(128);
    let fs = TierFs::new(st.config.clone());
    for (name, len) in [("/small", 100usize), ("/large", 1000)] {
        let path = vp(name);
        let data = pattern(len);
        fs.create(&path, 0o644, 0).await.unwrap();
        assert_eq!(fs.write(&path, 0, &data).await.unwrap() as usize, len);
        let got = fs.read(&path, 0, len as u32).await.unwrap();
        assert_eq!(&got[..], &data[..]);
        // Short read at end of file.
        let tail = fs.read(&path, len as u64 - 10, 64).await.unwrap();
        assert_eq!(&tail[..], &data[len - 10..]);
        assert!(fs.read(&path, len as u64 + 5, 8).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn truncate_demote_keeps_prefix() {
    let st = stores(256);
    let fs = TierFs::new(st.config.clone());
    let path = vp("/data");
    let data = pattern(700);
    fs.create(&path, 0o644, 0).await.unwrap();
    fs.write(&path, 0, &data).await.unwrap();
    assert_eq!(fs.locate(&path).await.unwrap().tier, Tier::Slow);

    // Still above threshold: stays in the slow store, shadow follows.
    assert_eq!(fs.truncate(&path, 300).await.unwrap().size, 300);
    assert_eq!(fs.locate(&path).await.unwrap().tier, Tier::Slow);

    fs.truncate(&path, 200).await.unwrap();
    assert_eq!(fs.locate(&path).await.unwrap().tier, Tier::Fast);
    assert_eq!(std::fs::read(st.fast.join("data")).unwrap(), &data[..200]);
    assert_eq!(names(&st.fast), vec!["data"]);
    assert!(names(&st.slow).is_empty());

    // Extending by truncate promotes again.
    fs.truncate(&path, 1024).await.unwrap();
    assert_eq!(fs.locate(&path).await.unwrap().tier, Tier::Slow);
    let got = fs.read(&path, 0, 1024).await.unwrap();
    assert_eq!(&got[..200], &data[..200]);
    assert!(got[200..].iter().all(|&b| b == 0));
}

#[tokio::test]
async fn shrinking_write_never_demotes() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    let path = vp("/w");
    fs.create(&path, 0o644, 0).await.unwrap();
    fs.write(&path, 0, &pattern(100)).await.unwrap();
    fs.write(&path, 0, b"tiny").await.unwrap();
    assert_eq!(fs.locate(&path).await.unwrap().tier, Tier::Slow);
    assert_eq!(fs.getattr(&path).await.unwrap().size, 100);
}

#[tokio::test]
async fn rename_of_slow_file_keeps_bytes_in_place() {
    let st = stores(512);
    let fs = TierFs::new(st.config.clone());
    fs.mkdir(&vp("/a"), 0o755).await.unwrap();
    let big = vp("/a/big");
    let renamed = vp("/a/renamed");
    let data = pattern(2000);
    fs.create(&big, 0o644, 0).await.unwrap();
    fs.write(&big, 0, &data).await.unwrap();
    let before = fs.locate(&big).await.unwrap();
    assert_eq!(before.tier, Tier::Slow);

    fs.rename(&big, &renamed).await.unwrap();

    let after = fs.locate(&renamed).await.unwrap();
    assert_eq!(after.tier, Tier::Slow);
    assert_eq!(after.physical, before.physical);
    assert_eq!(&fs.read(&renamed, 0, 4096).await.unwrap()[..], &data[..]);
    fs.access(&renamed, libc::R_OK).await.unwrap();
    assert!(fs.getattr(&big).await.unwrap_err().is_not_found());
    assert!(fs.access(&big, libc::F_OK).await.unwrap_err().is_not_found());
    assert_eq!(names(&st.fast.join("a")), vec![".tier~meta~renamed", "renamed"]);
}

#[tokio::test]
async fn rename_over_existing_files() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    let (a, b, c) = (vp("/a"), vp("/b"), vp("/c"));
    for p in [&a, &b, &c] {
        fs.create(p, 0o644, 0).await.unwrap();
    }
    fs.write(&a, 0, &pattern(100)).await.unwrap();
    fs.write(&b, 0, &pattern(200)).await.unwrap();
    fs.write(&c, 0, b"small").await.unwrap();
    let b_slow = fs.locate(&b).await.unwrap().physical;

    // Slow over slow: the replaced file's slow bytes go away.
    fs.rename(&a, &b).await.unwrap();
    assert!(!b_slow.exists());
    assert_eq!(fs.getattr(&b).await.unwrap().size, 100);

    // Fast over slow.
    fs.rename(&c, &b).await.unwrap();
    assert_eq!(fs.locate(&b).await.unwrap().tier, Tier::Fast);
    assert_eq!(&fs.read(&b, 0, 64).await.unwrap()[..], b"small");
    assert_eq!(names(&st.fast), vec!["b"]);
    assert!(names(&st.slow).is_empty());
}

#[tokio::test]
async fn rename_file_onto_directory_is_refused() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    fs.mkdir(&vp("/d"), 0o755).await.unwrap();
    fs.create(&vp("/f"), 0o644, 0).await.unwrap();
    fs.write(&vp("/f"), 0, &pattern(100)).await.unwrap();
    assert!(matches!(
        fs.rename(&vp("/f"), &vp("/d")).await,
        Err(TierError::IsADirectory(_))
    ));
    assert!(matches!(
        fs.rename(&vp("/d"), &vp("/f")).await,
        Err(TierError::NotADirectory(_))
    ));
    assert_eq!(fs.locate(&vp("/f")).await.unwrap().tier, Tier::Slow);
}

#[tokio::test]
async fn directory_rename_carries_slow_files() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    fs.mkdir(&vp("/d"), 0o755).await.unwrap();
    fs.create(&vp("/d/f"), 0o644, 0).await.unwrap();
    fs.write(&vp("/d/f"), 0, &pattern(100)).await.unwrap();
    fs.rename(&vp("/d"), &vp("/e")).await.unwrap();
    assert_eq!(fs.locate(&vp("/e/f")).await.unwrap().tier, Tier::Slow);
    assert_eq!(fs.getattr(&vp("/e/f")).await.unwrap().size, 100);
}

#[tokio::test]
async fn deleting_slow_file_removes_every_artifact() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    fs.mkdir(&vp("/d"), 0o755).await.unwrap();
    let path = vp("/d/big");
    fs.create(&path, 0o644, 0).await.unwrap();
    fs.write(&path, 0, &pattern(500)).await.unwrap();
    assert_eq!(fs.locate(&path).await.unwrap().tier, Tier::Slow);

    fs.unlink(&path).await.unwrap();
    assert!(names(&st.fast.join("d")).is_empty());
    assert!(names(&st.slow.join("d")).is_empty());
    assert!(fs.getattr(&path).await.unwrap_err().is_not_found());
    fs.rmdir(&vp("/d")).await.unwrap();
}

#[tokio::test]
async fn listings_hide_tier_artifacts() {
    let st = stores(32);
    let fs = TierFs::new(st.config.clone());
    for (name, len) in [("/s", 10usize), ("/b1", 40), ("/b2", 400)] {
        fs.create(&vp(name), 0o644, 0).await.unwrap();
        fs.write(&vp(name), 0, &pattern(len)).await.unwrap();
    }
    fs.mkdir(&vp("/dir"), 0o755).await.unwrap();
    fs.symlink(std::path::Path::new("/b1"), &vp("/link")).await.unwrap();

    let mut entries = fs.readdir(&vp("/")).await.unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let listed: Vec<_> = entries
        .iter()
        .map(|e| (e.name.to_string_lossy().into_owned(), e.kind))
        .collect();
    assert_eq!(
        listed,
        vec![
            ("b1".to_string(), EntryKind::RegularFile),
            ("b2".to_string(), EntryKind::RegularFile),
            ("dir".to_string(), EntryKind::Directory),
            ("link".to_string(), EntryKind::Symlink),
            ("s".to_string(), EntryKind::RegularFile),
        ]
    );
    assert!(names(&st.fast).iter().any(|n| n.starts_with(".tier~")));
}

#[tokio::test]
async fn getattr_is_idempotent() {
    let st = stores(512);
    let fs = TierFs::new(st.config.clone());
    for (name, len) in [("/tiny", 8usize), ("/fast", 100), ("/slow", 600)] {
        let path = vp(name);
        fs.create(&path, 0o644, 0).await.unwrap();
        fs.write(&path, 0, &pattern(len)).await.unwrap();
        let first = fs.getattr(&path).await.unwrap();
        let second = fs.getattr(&path).await.unwrap();
        assert_eq!(first, second);
    }
}

#[tokio::test]
async fn user_data_shaped_like_a_record_stays_ordinary() {
    let st = stores(512);
    let fs = TierFs::new(st.config.clone());
    let doc = vp("/doc");
    let mut body = b"TIERFS\0IND".to_vec();
    body.extend_from_slice(&[b'z'; 40]);

    fs.create(&doc, 0o644, 0).await.unwrap();
    fs.write(&doc, 0, &body).await.unwrap();
    assert_eq!(fs.locate(&doc).await.unwrap().tier, Tier::Fast);
    assert_eq!(fs.getattr(&doc).await.unwrap().size, 50);
    assert_eq!(&fs.read(&doc, 0, 512).await.unwrap()[..], &body[..]);

    // Same bytes with a complete header and an absolute target.
    let forged = vp("/forged");
    let mut record = b"TIERFS\0IND\x01\n".to_vec();
    record.extend_from_slice(st.slow.join("forged").as_os_str().as_encoded_bytes());
    fs.create(&forged, 0o644, 0).await.unwrap();
    fs.write(&forged, 0, &record).await.unwrap();
    let loc = fs.locate(&forged).await.unwrap();
    assert_eq!(loc.tier, Tier::Fast);
    assert_eq!(loc.physical, st.fast.join("forged"));

    fs.unlink(&doc).await.unwrap();
    fs.unlink(&forged).await.unwrap();
    assert!(names(&st.fast).is_empty());
}

#[tokio::test]
async fn empty_write_past_threshold_keeps_file_fast() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    let x = vp("/x");
    fs.create(&x, 0o644, 0).await.unwrap();
    fs.write(&x, 0, &pattern(10)).await.unwrap();

    assert_eq!(fs.write(&x, 1000, &[]).await.unwrap(), 0);
    assert_eq!(fs.locate(&x).await.unwrap().tier, Tier::Fast);
    assert_eq!(fs.getattr(&x).await.unwrap().size, 10);
    assert!(names(&st.slow).is_empty());

    assert!(fs.write(&vp("/missing"), 0, &[]).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn truncate_up_promotes_before_growing() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    let x = vp("/x");
    fs.create(&x, 0o644, 0).await.unwrap();
    fs.write(&x, 0, &pattern(10)).await.unwrap();

    let attr = fs.truncate(&x, 100).await.unwrap();
    assert_eq!(attr.size, 100);
    let loc = fs.locate(&x).await.unwrap();
    assert_eq!(loc.tier, Tier::Slow);
    let data = std::fs::read(&loc.physical).unwrap();
    assert_eq!(&data[..10], &pattern(10)[..]);
    assert!(data[10..].iter().all(|&b| b == 0));
}

#[tokio::test]
async fn slow_attributes_come_from_shadow() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    let path = vp("/big");
    fs.create(&path, 0o640, 0).await.unwrap();
    fs.write(&path, 0, &pattern(128)).await.unwrap();
    let loc = fs.locate(&path).await.unwrap();

    // Touching the slow file behind the filesystem's back is not observed.
    std::fs::OpenOptions::new()
        .append(true)
        .open(&loc.physical)
        .and_then(|mut f| std::io::Write::write_all(&mut f, b"xx"))
        .unwrap();
    assert_eq!(fs.getattr(&path).await.unwrap().size, 128);

    // The next write through the filesystem refreshes it.
    fs.write(&path, 0, b"y").await.unwrap();
    assert_eq!(fs.getattr(&path).await.unwrap().size, 130);
}

#[tokio::test]
async fn reserved_names_are_refused() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    assert!(matches!(
        tierfs::VirtualPath::new("/.tier~meta~x"),
        Err(TierError::ReservedName(_))
    ));
    let root = tierfs::VirtualPath::root();
    assert!(root.join(std::ffi::OsStr::new(".tier~tmp~y")).is_err());
    assert!(fs.readdir(&root).await.unwrap().is_empty());
}

#[tokio::test]
async fn promoted_file_mirrors_directory_in_slow_store() {
    let st = stores(16);
    let fs = TierFs::new(st.config.clone());
    fs.mkdir(&vp("/a"), 0o755).await.unwrap();
    fs.mkdir(&vp("/a/b"), 0o755).await.unwrap();
    fs.create(&vp("/a/b/name"), 0o644, 0).await.unwrap();
    fs.write(&vp("/a/b/name"), 0, &pattern(64)).await.unwrap();
    let loc = fs.locate(&vp("/a/b/name")).await.unwrap();
    assert_eq!(loc.physical, st.slow.join("a/b/name"));
    assert!(st.fast.join("a/b/.tier~meta~name").exists());
}

#[tokio::test]
async fn reused_name_does_not_clobber_renamed_slow_file() {
    let st = stores(16);
    let fs = TierFs::new(st.config.clone());
    let (a, b) = (vp("/a"), vp("/b"));
    fs.create(&a, 0o644, 0).await.unwrap();
    fs.write(&a, 0, &[1u8; 32]).await.unwrap();
    fs.rename(&a, &b).await.unwrap();

    // slow/a still holds /b's bytes.
    fs.create(&a, 0o644, 0).await.unwrap();
    fs.write(&a, 0, &[2u8; 32]).await.unwrap();
    assert_ne!(
        fs.locate(&a).await.unwrap().physical,
        fs.locate(&b).await.unwrap().physical
    );
    assert_eq!(&fs.read(&b, 0, 64).await.unwrap()[..], &[1u8; 32]);
    assert_eq!(&fs.read(&a, 0, 64).await.unwrap()[..], &[2u8; 32]);
}

#[tokio::test]
async fn hard_errors_map_to_stable_errnos() {
    let st = stores(64);
    let fs = TierFs::new(st.config.clone());
    let missing = fs.getattr(&vp("/missing")).await.unwrap_err();
    assert_eq!(missing.errno(), libc::ENOENT);
    fs.mkdir(&vp("/d"), 0o755).await.unwrap();
    assert_eq!(fs.mkdir(&vp("/d"), 0o755).await.unwrap_err().errno(), libc::EEXIST);
    fs.create(&vp("/d/f"), 0o644, 0).await.unwrap();
    assert_eq!(fs.rmdir(&vp("/d")).await.unwrap_err().errno(), libc::ENOTEMPTY);
    assert_eq!(fs.unlink(&vp("/d")).await.unwrap_err().errno(), libc::EISDIR);
    assert_eq!(fs.read(&vp("/d"), 0, 1).await.unwrap_err().errno(), libc::EISDIR);
}
