//! Streaming `.tar.gz` archives of prefixes with [`ssfs::ArchiveStream`]
use crate::fixture::{blocking, io_error_kind, memory_fs};
use crate::Result;
use assert_matches::assert_matches;
use more_asserts::*;
use ssfs::{ArchiveEntry, ArchiveSummary, ErrorKind, SsfsError};
use ssfs_testing::logging::test_with_logging;
use ssfs_testing::tar::{extract_intact_entries, extract_tar_gz, has_end_marker};
use ssfs_testing::test_data::{make_test_data, validate_archive_entries, TestObject};
use std::io::Read;

/// Read an archive to the end and close it, returning the archive data and the outcome of the
/// close
async fn read_archive(
    mut archive: ssfs::ArchiveStream,
) -> Result<(Vec<u8>, ssfs::Result<ArchiveSummary>)> {
    blocking(move || {
        let mut data = Vec::new();
        archive.read_to_end(&mut data)?;
        let outcome = archive.close();

        Result::<_>::Ok((data, outcome))
    })
    .await
}

/// Macro which generates tests that archive a prefix of a bucket and verify the archive, varying
/// only the objects in the bucket, the prefix, and the objects expected in the archive (in
/// listing order).
macro_rules! archive_and_verify_test {
    ($test_name:ident {
        @bucket_contents: [$($key:expr => $size:expr),*],
        @prefix: $prefix:expr,
        @expected_objects: [$($expected_key:expr),*]
    }) => {
        #[test]
        fn $test_name() -> Result<()> {
            test_with_logging(async move {
                let (store, fs) = memory_fs();
                let test_data = make_test_data(&store, vec![
                    $(TestObject::new($key, $size)),*
                ]);
                let expected_keys: Vec<&str> = vec![$($expected_key),*];

                let archive = fs.open_archive($prefix).await?;

                let key_prefix = $prefix.strip_prefix('/').unwrap_or($prefix);
                let expected_entries = expected_keys
                    .iter()
                    .map(|key| ArchiveEntry {
                        name: key.strip_prefix(key_prefix).unwrap().to_string(),
                        key: key.to_string(),
                    })
                    .collect::<Vec<_>>();
                assert_eq!(expected_entries, archive.entries());

                let (data, outcome) = read_archive(archive).await?;
                let summary = outcome?;

                assert_eq!(expected_keys.len(), summary.entries);
                assert_eq!(
                    expected_keys
                        .iter()
                        .map(|key| test_data[*key].data.len() as u64)
                        .sum::<u64>(),
                    summary.bytes
                );

                let entries = extract_tar_gz(&data)?;
                validate_archive_entries(&test_data, key_prefix, &entries, expected_keys.iter().copied())?;
                assert!(has_end_marker(&data)?);

                for entry in &entries {
                    let key = format!("{key_prefix}{}", entry.name);
                    let modified_at = store.modified_at(&key).unwrap();
                    assert_eq!(modified_at.timestamp() as u64, entry.mtime);
                }

                assert_eq!(store.sessions_opened(), store.sessions_closed());

                Ok(())
            })
        }
    };
}

archive_and_verify_test!(prefix_with_nested_objects {
    @bucket_contents: [
        "photos/a.jpg" => "10 KiB",
        "photos/2023/b.jpg" => "100 KiB",
        "photos/2023/c.jpg" => "0 B",
        "other/d.txt" => "1 KiB"
    ],
    @prefix: "/photos/",
    @expected_objects: ["photos/2023/b.jpg", "photos/2023/c.jpg", "photos/a.jpg"]
});

archive_and_verify_test!(prefix_without_leading_slash {
    @bucket_contents: [
        "photos/a.jpg" => "10 KiB",
        "other/d.txt" => "1 KiB"
    ],
    @prefix: "photos/",
    @expected_objects: ["photos/a.jpg"]
});

archive_and_verify_test!(whole_bucket {
    @bucket_contents: [
        "photos/a.jpg" => "10 KiB",
        "other/d.txt" => "1 KiB",
        "top.bin" => "1 MiB"
    ],
    @prefix: "/",
    @expected_objects: ["other/d.txt", "photos/a.jpg", "top.bin"]
});

archive_and_verify_test!(empty_prefix {
    @bucket_contents: [
        "photos/a.jpg" => "10 KiB"
    ],
    @prefix: "/nothing/here/",
    @expected_objects: []
});

archive_and_verify_test!(empty_bucket {
    @bucket_contents: [],
    @prefix: "/",
    @expected_objects: []
});

archive_and_verify_test!(many_large_objects {
    @bucket_contents: [
        "data/0.bin" => "2 MiB",
        "data/1.bin" => "1 MiB",
        "data/2.bin" => "3 MiB",
        "data/3.bin" => "1 B"
    ],
    @prefix: "/data/",
    @expected_objects: ["data/0.bin", "data/1.bin", "data/2.bin", "data/3.bin"]
});

archive_and_verify_test!(long_names {
    @bucket_contents: [
        "long/this-is-a-very-long-directory-name-which-goes-on-and-on/and-another-one-which-is-not-much-shorter/finally-a-file-name-which-pushes-it-over-the-edge.txt" => "1 KiB"
    ],
    @prefix: "/long/",
    @expected_objects: ["long/this-is-a-very-long-directory-name-which-goes-on-and-on/and-another-one-which-is-not-much-shorter/finally-a-file-name-which-pushes-it-over-the-edge.txt"]
});

/// An object whose key is the prefix itself has no name in the archive, so it's left out
#[test]
fn directory_marker_is_skipped() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("photos/", Vec::new());
        store.insert("photos/a.jpg", vec![1u8; 100]);

        let archive = fs.open_archive("/photos/").await?;
        assert_eq!(
            vec!["a.jpg"],
            archive
                .entries()
                .iter()
                .map(|entry| entry.name.as_str())
                .collect::<Vec<_>>()
        );

        let (data, outcome) = read_archive(archive).await?;
        assert_eq!(1, outcome?.entries);
        assert_eq!(1, extract_tar_gz(&data)?.len());

        Ok(())
    })
}

/// When reading one of the objects fails, the archive stops right there, with everything before it
/// intact, and no session is left open
#[test]
fn failed_entry_truncates_archive() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        let test_data = make_test_data(
            &store,
            vec![
                TestObject::new("data/a.bin", "100 KiB"),
                TestObject::new("data/b.bin", "10 KiB"),
                TestObject::new("data/c.bin", "50 KiB"),
                TestObject::new("data/d.bin", "10 KiB"),
            ],
        );
        store.fail_get("data/c.bin");

        let archive = fs.open_archive("/data/").await?;
        assert_eq!(4, archive.entries().len());

        let (data, outcome) = read_archive(archive).await?;

        let e = outcome.unwrap_err();
        assert_eq!(ErrorKind::UpstreamFailure, e.kind());
        assert_matches!(e, SsfsError::Backend { key, .. } if key == "data/c.bin");

        let entries = extract_tar_gz(&data)?;
        validate_archive_entries(&test_data, "data/", &entries, ["data/a.bin", "data/b.bin"])?;
        assert!(!has_end_marker(&data)?);

        assert_eq!(store.sessions_opened(), store.sessions_closed());

        Ok(())
    })
}

/// When an object's body fails partway through, the entries before it are intact, the partial
/// entry and everything after it are missing, and no session is left open
#[test]
fn failed_body_truncates_archive() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        let test_data = make_test_data(
            &store,
            vec![
                TestObject::new("data/a.bin", "100 KiB"),
                TestObject::new("data/b.bin", "10 KiB"),
                TestObject::new("data/c.bin", "50 KiB"),
                TestObject::new("data/d.bin", "10 KiB"),
            ],
        );
        store.fail_body_after("data/c.bin", 20_000);

        let archive = fs.open_archive("/data/").await?;
        let (data, outcome) = read_archive(archive).await?;

        let e = outcome.unwrap_err();
        assert_eq!(ErrorKind::UpstreamFailure, e.kind());
        assert_matches!(e, SsfsError::AppendArchiveEntry { key, .. } if key == "data/c.bin");

        let entries = extract_intact_entries(&data)?;
        validate_archive_entries(&test_data, "data/", &entries, ["data/a.bin", "data/b.bin"])?;
        assert!(!has_end_marker(&data)?);

        assert_eq!(store.sessions_opened(), store.sessions_closed());
        assert_eq!(3, store.sessions_opened());

        Ok(())
    })
}

/// Keys which aren't tidy relative paths are still archived, under their names exactly as they
/// appear after the prefix
#[test]
fn unusual_keys_are_archived() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        let test_data = make_test_data(
            &store,
            vec![
                TestObject::new("data///z.bin", "1 KiB"),
                TestObject::new("data/a.bin", "1 KiB"),
                TestObject::new("data/x/../y.bin", "1 KiB"),
            ],
        );

        let archive = fs.open_archive("/data/").await?;
        assert_eq!(
            vec!["z.bin", "a.bin", "x/../y.bin"],
            archive
                .entries()
                .iter()
                .map(|entry| entry.name.as_str())
                .collect::<Vec<_>>()
        );

        let (data, outcome) = read_archive(archive).await?;
        assert_eq!(3, outcome?.entries);

        let entries = extract_tar_gz(&data)?;
        assert_eq!(
            vec!["z.bin", "a.bin", "x/../y.bin"],
            entries
                .iter()
                .map(|entry| entry.name.as_str())
                .collect::<Vec<_>>()
        );
        for (entry, key) in entries
            .iter()
            .zip(["data///z.bin", "data/a.bin", "data/x/../y.bin"])
        {
            assert_eq!(test_data[key].data, entry.data, "contents of '{key}'");
        }
        assert!(has_end_marker(&data)?);

        Ok(())
    })
}

/// An object deleted after the archive was opened is still in the listing, so the archive fails
/// when it gets to it
#[test]
fn archive_membership_is_a_snapshot() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        make_test_data(
            &store,
            vec![
                TestObject::new("data/a.bin", "1 KiB"),
                TestObject::new("data/b.bin", "1 KiB"),
            ],
        );

        let archive = fs.open_archive("/data/").await?;

        store.insert("data/c.bin", vec![0u8; 100]);
        store.remove("data/b.bin");

        assert_eq!(2, archive.entries().len());

        let (data, outcome) = read_archive(archive).await?;

        assert_eq!(ErrorKind::NotFound, outcome.unwrap_err().kind());
        let entries = extract_tar_gz(&data)?;
        assert_eq!(1, entries.len());
        assert_eq!("a.bin", entries[0].name);

        Ok(())
    })
}

/// Closing before reading the whole archive stops the producer, and says so
#[test]
fn early_close_abandons_archive() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        make_test_data(
            &store,
            vec![
                TestObject::new("data/a.bin", "1 MiB"),
                TestObject::new("data/b.bin", "1 MiB"),
                TestObject::new("data/c.bin", "1 MiB"),
            ],
        );

        let mut archive = fs.open_archive("/data/").await?;

        blocking(move || {
            let mut buf = [0u8; 100];
            archive.read_exact(&mut buf)?;

            assert_matches!(archive.close(), Err(SsfsError::ArchiveAbandoned { .. }));

            let e = archive.read(&mut buf).unwrap_err();
            assert_eq!(ErrorKind::ClosedHandle, io_error_kind(&e));
            assert_eq!(ErrorKind::ClosedHandle, archive.close().unwrap_err().kind());

            Result::<_>::Ok(())
        })
        .await?;

        // The producer has exited by the time `close` returns, and it didn't get far
        assert_eq!(store.sessions_opened(), store.sessions_closed());
        assert_le!(store.sessions_opened(), 2);

        Ok(())
    })
}

#[test]
fn summary_counts_entries_and_bytes() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("data/a.bin", vec![1u8; 10]);

        let archive = fs.open_archive("/data/").await?;
        let (_data, outcome) = read_archive(archive).await?;

        assert_eq!(
            ArchiveSummary {
                entries: 1,
                bytes: 10
            },
            outcome?
        );

        Ok(())
    })
}
