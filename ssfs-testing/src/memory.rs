//! An in-memory [`ObjectStore`] which records how it's used, and can be told to misbehave.
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use ssfs::{ObjectBody, ObjectInfo, ObjectStore, SsfsError, UploadBody};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Size of the chunks object data is streamed in, in both directions
const CHUNK_SIZE: usize = 16 * 1024;

/// A bucket that lives in memory.
///
/// Clones share the same objects and counters.  Objects are listed in key order, like S3 does.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,

    /// Sleep this long before every chunk read or written
    delay: Mutex<Option<Duration>>,

    failing_gets: Mutex<HashSet<String>>,

    /// Keys whose body streams fail after yielding this many bytes
    failing_bodies: Mutex<HashMap<String, usize>>,
    failing_puts: Mutex<HashSet<String>>,

    calls: AtomicUsize,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    puts_completed: AtomicUsize,
}

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    modified_at: DateTime<Utc>,
}

impl StoredObject {
    fn info(&self, key: &str) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: self.data.len() as u64,
            modified_at: self.modified_at,
        }
    }
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bucket: bucket.into(),
                ..Default::default()
            }),
        }
    }

    /// A copy of this store as the trait object `ssfs` expects
    pub fn boxed(&self) -> Box<dyn ObjectStore> {
        Box::new(self.clone())
    }

    /// Store an object directly, without going through the [`ObjectStore`] API or the counters.
    ///
    /// The modification time is truncated to whole seconds, the resolution of a tar header.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        let modified_at =
            DateTime::<Utc>::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default();

        self.inner.objects.lock().unwrap().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                modified_at,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|object| object.data)
    }

    /// The data of an object, if it exists
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.data.clone())
    }

    pub fn modified_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.modified_at)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Slow down every chunk of data read from or written to this store
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = Some(delay);
    }

    /// Make every `get` of `key` fail
    pub fn fail_get(&self, key: impl Into<String>) {
        self.inner.failing_gets.lock().unwrap().insert(key.into());
    }

    /// Make every `get` of `key` succeed, but its body stream fail once `bytes` bytes of the
    /// body have been yielded
    pub fn fail_body_after(&self, key: impl Into<String>, bytes: usize) {
        self.inner
            .failing_bodies
            .lock()
            .unwrap()
            .insert(key.into(), bytes);
    }

    /// Make every `put` of `key` fail, after the whole body was read
    pub fn fail_put(&self, key: impl Into<String>) {
        self.inner.failing_puts.lock().unwrap().insert(key.into());
    }

    /// Number of calls to any [`ObjectStore`] method
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Number of successful `get` calls, each of which started a read session
    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Number of read sessions which were dropped
    pub fn sessions_closed(&self) -> usize {
        self.inner.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn puts_completed(&self) -> usize {
        self.inner.puts_completed.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn delay(&self) -> Option<Duration> {
        *self.inner.delay.lock().unwrap()
    }

    fn lookup(&self, key: &str) -> ssfs::Result<StoredObject> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| SsfsError::not_found(&self.inner.bucket, key))
    }
}

/// Counts a read session as closed when the body stream holding it is dropped
struct Session {
    store: Arc<Inner>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.store.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    async fn stat(&self, key: &str) -> ssfs::Result<ObjectInfo> {
        self.record_call();

        Ok(self.lookup(key)?.info(key))
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> ssfs::Result<ObjectBody> {
        self.record_call();

        if self.inner.failing_gets.lock().unwrap().contains(key) {
            return Err(SsfsError::backend(
                key,
                std::io::Error::other("injected get failure"),
            ));
        }

        let object = self.lookup(key)?;
        let info = object.info(key);

        let size = object.data.len() as u64;
        let range = range.unwrap_or(0..size);
        let start = range.start.min(size) as usize;
        let end = range.end.clamp(range.start, size) as usize;
        let data = object.data.slice(start..end);

        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let session = Session {
            store: self.inner.clone(),
        };
        let delay = self.delay();
        let fail_after = self.inner.failing_bodies.lock().unwrap().get(key).copied();
        let key = key.to_string();

        let data = futures::stream::unfold(
            (data, session, fail_after),
            move |(mut data, session, fail_after)| {
                let key = key.clone();

                async move {
                    if data.is_empty() {
                        return None;
                    }

                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }

                    if fail_after == Some(0) {
                        // Nothing more comes after the failure
                        let e = SsfsError::backend(
                            key,
                            std::io::Error::other("injected body failure"),
                        );

                        return Some((Err(e), (Bytes::new(), session, None)));
                    }

                    let len = CHUNK_SIZE.min(data.len());
                    let len = fail_after.map_or(len, |remaining| len.min(remaining));
                    let chunk = data.split_to(len);

                    Some((
                        Ok(chunk),
                        (data, session, fail_after.map(|remaining| remaining - len)),
                    ))
                }
            },
        )
        .boxed();

        Ok(ObjectBody { info, data })
    }

    async fn put(
        &self,
        key: &str,
        mut body: UploadBody,
        _size_hint: Option<u64>,
    ) -> ssfs::Result<ObjectInfo> {
        self.record_call();

        let mut data = BytesMut::new();
        let delay = self.delay();

        loop {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut chunk = vec![0u8; CHUNK_SIZE];
            let bytes_read = body
                .read(&mut chunk)
                .await
                .map_err(|e| SsfsError::backend(key, e))?;

            if bytes_read == 0 {
                break;
            }

            data.extend_from_slice(&chunk[..bytes_read]);
        }

        if self.inner.failing_puts.lock().unwrap().contains(key) {
            return Err(SsfsError::backend(
                key,
                std::io::Error::other("injected put failure"),
            ));
        }

        self.insert(key, data.freeze());
        self.inner.puts_completed.fetch_add(1, Ordering::SeqCst);

        Ok(self.lookup(key)?.info(key))
    }

    fn list(&self, prefix: &str, recursive: bool) -> BoxStream<'static, ssfs::Result<ObjectInfo>> {
        self.record_call();

        let objects = self
            .inner
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| {
                key.strip_prefix(prefix)
                    .map(|rest| recursive || !rest.contains('/'))
                    .unwrap_or(false)
            })
            .map(|(key, object)| Ok(object.info(key)))
            .collect::<Vec<_>>();

        futures::stream::iter(objects).boxed()
    }
}
