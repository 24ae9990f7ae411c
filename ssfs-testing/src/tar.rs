//! Test helpers for taking apart the gzipped tar archives `ssfs` produces, so their contents can
//! be validated against the expected test data.
use crate::Result;
use std::io::Read;

/// One entry read back from an archive
#[derive(Clone, Debug)]
pub struct ExtractedEntry {
    pub name: String,
    pub size: u64,
    pub mtime: u64,
    pub mode: u32,
    pub entry_type: tar::EntryType,
    pub data: Vec<u8>,
}

/// Decompress a gzip stream
pub fn gunzip(archive: &[u8]) -> Result<Vec<u8>> {
    let mut tar = Vec::new();
    flate2::read::GzDecoder::new(archive).read_to_end(&mut tar)?;

    Ok(tar)
}

/// Read every entry of a `.tar.gz` archive.
///
/// An archive which ends after a complete entry but without the tar end marker is read without
/// error, so this can be used to check what a failed archive contained up to the failure.
pub fn extract_tar_gz(archive: &[u8]) -> Result<Vec<ExtractedEntry>> {
    let tar = gunzip(archive)?;
    let mut archive = tar::Archive::new(&tar[..]);
    let mut entries = Vec::new();

    println!("Tar archive contents:");
    for result in archive.entries()? {
        let mut entry = result?;
        let header = entry.header().clone();

        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        println!("  {} ({} bytes)", name, data.len());

        entries.push(ExtractedEntry {
            name,
            size: header.size()?,
            mtime: header.mtime()?,
            mode: header.mode()?,
            entry_type: header.entry_type(),
            data,
        });
    }

    Ok(entries)
}

/// Read the entries of a `.tar.gz` archive that failed partway through an entry.
///
/// Only the entries which are complete, in order up to the first one that isn't, are returned.
pub fn extract_intact_entries(archive: &[u8]) -> Result<Vec<ExtractedEntry>> {
    let tar = gunzip(archive)?;
    let mut archive = tar::Archive::new(&tar[..]);
    let mut entries = Vec::new();

    for result in archive.entries()? {
        let Ok(mut entry) = result else {
            break;
        };
        let header = entry.header().clone();
        let size = header.size()?;

        let mut data = Vec::new();
        if entry.read_to_end(&mut data).is_err() || data.len() as u64 != size {
            break;
        }

        entries.push(ExtractedEntry {
            name: entry.path()?.to_string_lossy().into_owned(),
            size,
            mtime: header.mtime()?,
            mode: header.mode()?,
            entry_type: header.entry_type(),
            data,
        });
    }

    Ok(entries)
}

/// True if the decompressed archive ends with the two zero blocks that mark the end of a
/// complete tar archive
pub fn has_end_marker(archive: &[u8]) -> Result<bool> {
    let tar = gunzip(archive)?;

    Ok(tar.len() >= 1024 && tar[tar.len() - 1024..].iter().all(|byte| *byte == 0))
}
