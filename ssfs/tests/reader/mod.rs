//! Reading objects through [`ssfs::ObjectReader`]
use crate::fixture::{blocking, io_error_kind, memory_fs};
use crate::Result;
use assert_matches::assert_matches;
use ssfs::{ErrorKind, SsfsError};
use ssfs_testing::{logging::test_with_logging, test_data::random_data};
use std::io::{Read, Seek, SeekFrom};

#[test]
fn read_whole_object() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        let data = random_data(100 * 1024);
        store.insert("foo/bar.bin", data.clone());

        let mut reader = fs.open("/foo/bar.bin").await?;
        assert_eq!(data.len() as u64, reader.info().size);
        assert_eq!("foo/bar.bin", reader.info().name());
        assert_eq!(0o644, reader.info().mode());
        assert!(!reader.info().is_dir());

        let read_data = blocking(move || {
            let mut read_data = Vec::new();
            reader.read_to_end(&mut read_data)?;
            reader.close()?;

            Result::<_>::Ok(read_data)
        })
        .await?;

        assert_eq!(data, read_data);
        assert_eq!(store.sessions_opened(), store.sessions_closed());

        Ok(())
    })
}

#[test]
fn read_empty_object() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("empty", Vec::new());

        let mut reader = fs.open("/empty").await?;

        let read_data = blocking(move || {
            let mut read_data = Vec::new();
            reader.read_to_end(&mut read_data)?;
            reader.close()?;

            Result::<_>::Ok(read_data)
        })
        .await?;

        assert!(read_data.is_empty());

        Ok(())
    })
}

#[test]
fn open_missing_object_is_not_found() -> Result<()> {
    test_with_logging(async move {
        let (_store, fs) = memory_fs();

        let e = fs.open("/does/not/exist").await.unwrap_err();

        assert_eq!(ErrorKind::NotFound, e.kind());
        assert_matches!(e, SsfsError::ObjectNotFound { key, .. } if key == "does/not/exist");

        Ok(())
    })
}

#[test]
fn read_at_does_not_move_cursor() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        let data = random_data(10_000);
        store.insert("foo", data.clone());

        let mut reader = fs.open("/foo").await?;

        blocking(move || {
            let mut buf = [0u8; 10];
            reader.read_exact(&mut buf)?;
            assert_eq!(&data[..10], &buf[..]);

            let mut random_access = [0u8; 100];
            assert_eq!(100, reader.read_at(&mut random_access, 5000)?);
            assert_eq!(&data[5000..5100], &random_access[..]);

            // The sequential read picks up where it left off
            reader.read_exact(&mut buf)?;
            assert_eq!(&data[10..20], &buf[..]);

            // Reading across the end of the object is a short read
            assert_eq!(50, reader.read_at(&mut random_access, 9950)?);
            assert_eq!(&data[9950..], &random_access[..50]);

            assert_eq!(0, reader.read_at(&mut random_access, 10_000)?);
            assert_eq!(0, reader.read_at(&mut random_access, 20_000)?);

            reader.close()?;

            Result::<_>::Ok(())
        })
        .await?;

        assert_eq!(store.sessions_opened(), store.sessions_closed());

        Ok(())
    })
}

#[test]
fn seek_and_read() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        let data = random_data(50_000);
        store.insert("foo", data.clone());

        let mut reader = fs.open("/foo").await?;

        blocking(move || {
            let mut buf = [0u8; 100];

            assert_eq!(1000, reader.seek(SeekFrom::Start(1000))?);
            reader.read_exact(&mut buf)?;
            assert_eq!(&data[1000..1100], &buf[..]);

            assert_eq!(1050, reader.seek(SeekFrom::Current(-50))?);
            reader.read_exact(&mut buf)?;
            assert_eq!(&data[1050..1150], &buf[..]);

            assert_eq!(49_990, reader.seek(SeekFrom::End(-10))?);
            let mut tail = Vec::new();
            reader.read_to_end(&mut tail)?;
            assert_eq!(&data[49_990..], &tail[..]);

            // Seeking past the end is allowed, there's just nothing there
            assert_eq!(60_000, reader.seek(SeekFrom::End(10_000))?);
            assert_eq!(0, reader.read(&mut buf)?);

            // Seeking before the start is not
            let e = reader.seek(SeekFrom::Current(-100_000)).unwrap_err();
            assert_eq!(std::io::ErrorKind::InvalidInput, e.kind());
            assert_eq!(ErrorKind::InvalidArgument, io_error_kind(&e));
            assert_eq!(60_000, reader.stream_position()?);

            // Seeking back to the start reads the whole object again
            reader.rewind()?;
            let mut all = Vec::new();
            reader.read_to_end(&mut all)?;
            assert_eq!(data, all);

            reader.close()?;

            Result::<_>::Ok(())
        })
        .await?;

        assert_eq!(store.sessions_opened(), store.sessions_closed());

        Ok(())
    })
}

#[test]
fn operations_after_close_fail() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("foo", random_data(1000));

        let mut reader = fs.open("/foo").await?;

        blocking(move || {
            reader.close()?;

            let mut buf = [0u8; 10];
            let e = reader.read(&mut buf).unwrap_err();
            assert_eq!(std::io::ErrorKind::BrokenPipe, e.kind());
            assert_eq!(ErrorKind::ClosedHandle, io_error_kind(&e));

            let e = reader.read_at(&mut buf, 0).unwrap_err();
            assert_eq!(ErrorKind::ClosedHandle, io_error_kind(&e));

            let e = reader.seek(SeekFrom::Start(0)).unwrap_err();
            assert_eq!(ErrorKind::ClosedHandle, io_error_kind(&e));

            assert_eq!(ErrorKind::ClosedHandle, reader.stat().unwrap_err().kind());
            assert_matches!(reader.close(), Err(SsfsError::HandleClosed { .. }));

            Result::<_>::Ok(())
        })
        .await?;

        Ok(())
    })
}

#[test]
fn stat_after_removal_is_not_found() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("foo", random_data(1000));

        let mut reader = fs.open("/foo").await?;
        store.remove("foo");

        blocking(move || {
            // The metadata from when it was opened is still there
            assert_eq!(1000, reader.info().size);

            assert_eq!(ErrorKind::NotFound, reader.stat().unwrap_err().kind());

            reader.close()?;

            Result::<_>::Ok(())
        })
        .await?;

        Ok(())
    })
}

#[test]
fn stat_reports_current_metadata() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("foo", random_data(1000));

        let info = fs.stat("/foo").await?;
        assert_eq!("foo", info.key);
        assert_eq!(1000, info.len());
        assert_eq!(store.modified_at("foo"), Some(info.modified_at));

        let mut reader = fs.open("/foo").await?;
        store.insert("foo", random_data(2000));

        blocking(move || {
            assert_eq!(1000, reader.info().size);
            assert_eq!(2000, reader.stat()?.size);

            reader.close()?;

            Result::<_>::Ok(())
        })
        .await?;

        Ok(())
    })
}
