pub mod tsv;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::bufread::GzDecoder;
use tracing::info;

use crate::errors::{Error, SchemaError};
use crate::model::{Columns, TableKind};


/// Opens a delimited file for streaming, transparently decompressing
/// gzip suffixes. Tarballs are expanded beforehand by [`resolve_files`].
pub fn open_reader(path: &Path) -> Result<Box<dyn Read + Send>, std::io::Error> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gz") => Ok(Box::new(GzDecoder::new(reader))),
        _ => Ok(Box::new(reader)),
    }
}

fn is_tarball(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".tar.gz")
}

/// Resolves the configured file list for one source table. Plain and
/// gzipped files pass through; a tarball is unpacked under the spill
/// directory and contributes its member files in lexicographic path order.
pub fn resolve_files(paths: &[PathBuf], spill_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut resolved = Vec::new();

    for path in paths {
        if !is_tarball(path) {
            resolved.push(path.clone());
            continue;
        }

        let stem = path
            .file_name()
            .map(|name| name.to_string_lossy().replace(".tar.gz", ""))
            .unwrap_or_default();
        let target = spill_dir.join("unpacked").join(stem);

        std::fs::create_dir_all(&target)?;
        let file = File::open(path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        archive.unpack(&target)?;
        info!(path = %path.display(), target = %target.display(), "Unpacked tarball");

        let mut members = Vec::new();
        collect_files(&target, &mut members)?;
        members.sort();
        resolved.extend(members);
    }

    Ok(resolved)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        }
        else {
            out.push(path);
        }
    }
    Ok(())
}


/// Reads the header row of a table file. An entirely empty file yields an
/// empty header and is treated as a source with no rows.
pub fn read_header(path: &Path) -> Result<Vec<String>, Error> {
    let reader = open_reader(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(reader);

    match reader.headers() {
        Ok(headers) => Ok(headers.iter().map(|column| column.to_string()).collect()),
        // an empty file has no header line and contributes nothing
        Err(err) if headers_missing(&err) => Ok(Vec::new()),
        Err(_) => Err(SchemaError::UnreadableHeader {
            path: path.display().to_string(),
        }
        .into()),
    }
}

fn headers_missing(err: &csv::Error) -> bool {
    matches!(err.kind(), csv::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}

/// Verifies a file header against the required column set for its table
/// kind and folds any new columns into the unioned layout.
pub fn union_header(
    path: &Path,
    header: &[String],
    kind: TableKind,
    columns: &mut Columns,
) -> Result<(), SchemaError> {
    if header.is_empty() {
        return Ok(());
    }

    for required in kind.required_columns() {
        if !header.iter().any(|column| column == required) {
            return Err(SchemaError::MissingColumn {
                path: path.display().to_string(),
                column: required.to_string(),
            });
        }
    }

    for column in header {
        columns.upsert(column);
    }

    Ok(())
}
