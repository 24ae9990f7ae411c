//! The rules for the paths callers use to name objects and prefixes.
//!
//! Object keys never start with `/`, but callers name single objects with a leading `/` as if
//! they were absolute paths in a filesystem, and name prefixes with a trailing `/` as if they were
//! directories.  Backslashes are rejected everywhere so Windows-style paths can't be confused for
//! keys.
use crate::Result;
use snafu::prelude::*;

/// Validate the path of a single object and translate it into the object key.
pub(crate) fn object_key(path: &str) -> Result<&str> {
    let key = path.strip_prefix('/').unwrap_or_default();

    ensure!(
        !key.is_empty() && !path.contains('\\'),
        crate::error::InvalidObjectPathSnafu { path }
    );

    Ok(key)
}

/// Validate a prefix and translate it into the key prefix to list.
///
/// A leading `/` is optional and is removed, so `/` on its own means the whole bucket.
pub(crate) fn key_prefix(prefix: &str) -> Result<&str> {
    ensure!(
        prefix.ends_with('/') && !prefix.contains('\\'),
        crate::error::InvalidPrefixSnafu { prefix }
    );

    Ok(prefix.strip_prefix('/').unwrap_or(prefix))
}

/// The name under which the object `key`, found by listing `prefix`, is stored in an archive.
///
/// Every leading `/` left after the prefix is removed too, so names in the archive are always
/// relative.  Returns `None` if nothing is left of the key.
pub(crate) fn archive_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let name = key.strip_prefix(prefix).unwrap_or(key);
    let name = name.trim_start_matches('/');

    (!name.is_empty()).then_some(name)
}
