//! Writing objects through [`ssfs::ObjectWriter`]
use crate::fixture::{blocking, io_error_kind, memory_fs};
use crate::Result;
use assert_matches::assert_matches;
use rand::prelude::*;
use ssfs::{ErrorKind, SsfsError};
use ssfs_testing::{logging::test_with_logging, test_data::random_data};
use std::io::{Read, Write};
use std::time::Duration;

#[test]
fn write_then_read_round_trip() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        let data = random_data(1024 * 1024);

        let mut writer = fs.create("/round/trip.bin").await?;
        assert_eq!("round/trip.bin", writer.key());

        let info = {
            let data = data.clone();

            blocking(move || {
                // Write in randomly-sized pieces, some bigger and some smaller than the pipe
                let mut rand = rand::thread_rng();
                let mut remaining = &data[..];

                while !remaining.is_empty() {
                    let len = rand.gen_range(1..=remaining.len().min(20_000));
                    assert_eq!(len, writer.write(&remaining[..len])?);
                    remaining = &remaining[len..];
                }

                writer.flush()?;

                Result::<_>::Ok(writer.close()?)
            })
            .await?
        };

        assert_eq!("round/trip.bin", info.key);
        assert_eq!(data.len() as u64, info.size);
        assert_eq!(1, store.puts_completed());

        let mut reader = fs.open("/round/trip.bin").await?;
        let read_data = blocking(move || {
            let mut read_data = Vec::new();
            reader.read_to_end(&mut read_data)?;
            reader.close()?;

            Result::<_>::Ok(read_data)
        })
        .await?;

        assert_eq!(data, read_data);

        Ok(())
    })
}

#[test]
fn close_without_writes_creates_empty_object() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();

        let mut writer = fs.create("/empty").await?;
        let info = blocking(move || writer.close()).await?;

        assert_eq!(0, info.size);
        assert_eq!(Some(bytes::Bytes::new()), store.object("empty"));

        Ok(())
    })
}

/// `close` must not return until the store has the object, even if the store is slow
#[test]
fn close_waits_for_upload() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.set_delay(Duration::from_millis(20));
        let data = random_data(100 * 1024);

        let mut writer = fs.create("/slow").await?;

        {
            let data = data.clone();
            blocking(move || {
                writer.write_all(&data)?;

                Result::<_>::Ok(writer.close()?)
            })
            .await?;
        }

        assert_eq!(1, store.puts_completed());
        assert_eq!(Some(data.as_slice()), store.object("slow").as_deref());

        Ok(())
    })
}

/// A single write much larger than the pipe, into a store that reads slowly, is accepted without
/// deadlocking or corrupting the data
#[test]
fn large_write_into_slow_store() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.set_delay(Duration::from_millis(1));
        let data = random_data(2 * 1024 * 1024);

        let mut writer = fs.create("/big").await?;

        let info = {
            let data = data.clone();
            blocking(move || {
                assert_eq!(data.len(), writer.write(&data)?);

                Result::<_>::Ok(writer.close()?)
            })
            .await?
        };

        assert_eq!(data.len() as u64, info.size);
        assert_eq!(Some(data.as_slice()), store.object("big").as_deref());

        Ok(())
    })
}

#[test]
fn replaces_existing_object() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.insert("foo", random_data(5000));
        let data = random_data(100);

        let mut writer = fs.create("/foo").await?;

        // Until the upload completes the old object is still there
        assert_eq!(5000, fs.stat("/foo").await?.size);

        {
            let data = data.clone();
            blocking(move || {
                writer.write_all(&data)?;

                Result::<_>::Ok(writer.close()?)
            })
            .await?;
        }

        assert_eq!(Some(data.as_slice()), store.object("foo").as_deref());

        Ok(())
    })
}

#[test]
fn rejected_upload_is_reported_by_close() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();
        store.fail_put("rejected");

        let mut writer = fs.create("/rejected").await?;

        blocking(move || {
            writer.write_all(&random_data(10_000))?;

            let e = writer.close().unwrap_err();
            assert_eq!(ErrorKind::UpstreamFailure, e.kind());
            assert_matches!(e, SsfsError::Backend { .. });

            // The failure is final
            assert_matches!(writer.close(), Err(SsfsError::HandleClosed { .. }));

            Result::<_>::Ok(())
        })
        .await?;

        assert_eq!(None, store.object("rejected"));
        assert_eq!(0, store.puts_completed());

        Ok(())
    })
}

#[test]
fn writes_after_close_fail() -> Result<()> {
    test_with_logging(async move {
        let (_store, fs) = memory_fs();

        let mut writer = fs.create("/foo").await?;

        blocking(move || {
            writer.write_all(b"hello")?;
            writer.close()?;

            let e = writer.write(b"world").unwrap_err();
            assert_eq!(std::io::ErrorKind::BrokenPipe, e.kind());
            assert_eq!(ErrorKind::ClosedHandle, io_error_kind(&e));

            let e = writer.flush().unwrap_err();
            assert_eq!(ErrorKind::ClosedHandle, io_error_kind(&e));

            assert_eq!(ErrorKind::ClosedHandle, writer.close().unwrap_err().kind());

            Result::<_>::Ok(())
        })
        .await?;

        Ok(())
    })
}

#[test]
fn dropped_writer_creates_nothing() -> Result<()> {
    test_with_logging(async move {
        let (store, fs) = memory_fs();

        let mut writer = fs.create("/abandoned").await?;

        blocking(move || {
            writer.write_all(&random_data(10_000))?;
            drop(writer);

            Result::<_>::Ok(())
        })
        .await?;

        // Give the cancelled upload task a chance to run to completion
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(None, store.object("abandoned"));
        assert_eq!(0, store.puts_completed());

        Ok(())
    })
}
