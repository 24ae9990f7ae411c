#![doc = include_str!("../README.md")]

mod archive;
mod async_bridge;
mod config;
mod error;
mod fs;
mod objstore;
mod path;
mod reader;
mod util;
mod writer;

pub use archive::{ArchiveEntry, ArchiveStream, ArchiveSummary};
pub use async_bridge::ByteStream;
pub use config::Config;
pub use error::{ErrorKind, Result, SsfsError};
pub use fs::ObjectFs;
pub use objstore::{ObjectBody, ObjectInfo, ObjectStore, UploadBody};
pub use reader::ObjectReader;
pub use writer::ObjectWriter;

