//! Malformed paths and prefixes are rejected before the object store is ever called
use crate::fixture::memory_fs;
use crate::Result;
use ssfs::ErrorKind;
use ssfs_testing::logging::test_with_logging;

const INVALID_OBJECT_PATHS: &[&str] = &["foo", "", "/", "/foo\\bar.txt", "\\foo", "foo/bar/"];

const INVALID_PREFIXES: &[&str] = &["photos", "", "/photos", "/photos\\2023/", "\\"];

#[test]
fn invalid_object_paths() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("foo", vec![1u8; 10]);

        for path in INVALID_OBJECT_PATHS {
            println!("Trying invalid path '{path}'");

            assert_eq!(
                ErrorKind::InvalidArgument,
                fs.open(path).await.unwrap_err().kind()
            );
            assert_eq!(
                ErrorKind::InvalidArgument,
                fs.create(path).await.unwrap_err().kind()
            );
            assert_eq!(
                ErrorKind::InvalidArgument,
                fs.stat(path).await.unwrap_err().kind()
            );
        }

        assert_eq!(0, store.calls());

        Ok(())
    })
}

#[test]
fn invalid_prefixes() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("photos/a.jpg", vec![1u8; 10]);

        for prefix in INVALID_PREFIXES {
            println!("Trying invalid prefix '{prefix}'");

            assert_eq!(
                ErrorKind::InvalidArgument,
                fs.open_archive(prefix).await.unwrap_err().kind()
            );
        }

        assert_eq!(0, store.calls());

        Ok(())
    })
}
