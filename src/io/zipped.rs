//! Zipped NetCDF content as served by the remote service.

use std::io::{Cursor, Write};

use tempfile::NamedTempFile;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Name of the first `.nc` entry in a zip archive.
pub fn netcdf_entry_name(content: &[u8]) -> Result<String> {
    let archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| Error::format(format!("content is not a zip archive: {}", e)))?;
    let names: Vec<&str> = archive.file_names().collect();
    names
        .iter()
        .find(|name| name.ends_with(".nc"))
        .map(|name| name.to_string())
        .ok_or_else(|| {
            Error::format(format!(
                "no NetCDF file in content, with file list {:?}",
                names
            ))
        })
}

/// Extract the NetCDF entry of `content` into a temporary `.nc` file.
///
/// The file is deleted when the returned handle is dropped, on every exit
/// path of the caller.
pub fn extract_netcdf(content: &[u8]) -> Result<NamedTempFile> {
    let name = netcdf_entry_name(content)?;
    let mut archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| Error::format(format!("content is not a zip archive: {}", e)))?;
    let mut entry = archive
        .by_name(&name)
        .map_err(|e| Error::format(format!("cannot open zip entry '{}': {}", name, e)))?;

    let mut tmp = tempfile::Builder::new()
        .prefix("fewspy-")
        .suffix(".nc")
        .tempfile()
        .map_err(|e| Error::io(std::env::temp_dir(), e))?;
    std::io::copy(&mut entry, &mut tmp).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.flush().map_err(|e| Error::io(tmp.path(), e))?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extracts_nc_entry() {
        let content = archive(&[
            ("readme.txt", b"hello".as_slice()),
            ("series.nc", b"CDF\x01netcdf".as_slice()),
        ]);
        assert_eq!(netcdf_entry_name(&content).unwrap(), "series.nc");

        let tmp = extract_netcdf(&content).unwrap();
        let path = tmp.path().to_path_buf();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("nc"));
        assert_eq!(std::fs::read(&path).unwrap(), b"CDF\x01netcdf");

        drop(tmp);
        assert!(!path.exists());
    }

    #[test]
    fn test_archive_without_nc_is_format_error() {
        let content = archive(&[("readme.txt", b"hello".as_slice())]);
        let err = extract_netcdf(&content).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("readme.txt"));
    }

    #[test]
    fn test_garbage_is_format_error() {
        assert!(matches!(
            extract_netcdf(b"not a zip"),
            Err(Error::Format(_))
        ));
    }
}
