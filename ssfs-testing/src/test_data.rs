//! Create random test data in a [`MemoryStore`] and check it against what was read back
use crate::memory::MemoryStore;
use crate::tar::ExtractedEntry;
use crate::Result;
use rand::prelude::*;
use sha2::Digest;
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object spec with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key: key.into(),
            size: size.get_bytes() as usize,
        }
    }
}

/// A [`TestObject`] along with the data that was stored in it
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

pub fn random_data(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill(&mut data[..]);

    data
}

pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&sha2::Sha256::digest(data));

    hash
}

/// Store each test object, filled with random data, in `store`.
///
/// The objects are inserted directly, so this doesn't count as calls to the store.  The returned
/// map is keyed by object key.
pub fn make_test_data(
    store: &MemoryStore,
    objects: impl IntoIterator<Item = TestObject>,
) -> HashMap<String, TestObjectWithData> {
    let mut test_objects = HashMap::new();

    for TestObject { key, size } in objects {
        let data = random_data(size);
        store.insert(key.clone(), data.clone());

        let object = TestObjectWithData {
            key: key.clone(),
            hash: hash(&data),
            data,
        };

        assert!(
            test_objects.insert(key.clone(), object).is_none(),
            "BUG: test data contains the same key '{key}' more than once"
        );
    }

    test_objects
}

/// Check that the archive entries are exactly the objects with `expected_keys`, in that order,
/// named relative to `prefix`, and with the right contents.
#[track_caller]
pub fn validate_archive_entries<'a>(
    test_data: &HashMap<String, TestObjectWithData>,
    prefix: &str,
    entries: &[ExtractedEntry],
    expected_keys: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let expected_keys = expected_keys.into_iter().collect::<Vec<_>>();

    let names = entries
        .iter()
        .map(|entry| entry.name.as_str())
        .collect::<Vec<_>>();
    let expected_names = expected_keys
        .iter()
        .map(|key| key.strip_prefix(prefix).unwrap_or(key))
        .collect::<Vec<_>>();
    assert_eq!(expected_names, names, "archive entries don't match");

    for (entry, key) in entries.iter().zip(expected_keys) {
        let object = test_data
            .get(key)
            .unwrap_or_else(|| panic!("BUG: test expects key '{key}' which isn't in test data"));

        assert_eq!(object.data.len() as u64, entry.size, "size of '{key}'");
        assert_eq!(object.hash, hash(&entry.data), "contents of '{key}'");
        assert_eq!(0o644, entry.mode, "mode of '{key}'");
        assert_eq!(tar::EntryType::Regular, entry.entry_type, "type of '{key}'");
    }

    Ok(())
}
