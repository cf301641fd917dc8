//! Last-resort recovery without a manifest: scavenge every log and table
//! in the directory, rebuild their metadata by scanning, and write a fresh
//! manifest that registers all of it at level 0.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use strata_sstable::SeekableIterator as _;
use strata_vfs::FileSystem;

use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::{InternalKey, InternalKeyComparator, ParsedInternalKey, SequenceNumber};
use crate::log::{LogReader, LogWriter};
use crate::memtable::MemTable;
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::version::{set_current_file, FileMetadataParams, VersionEdit};
use crate::write_batch::WriteBatch;

use super::compaction::build_table;


/// Rebuild the database at `path` from whatever files survive.
///
/// Every write-ahead log is converted to a table; every table is scanned
/// for its true key range and newest sequence; old manifests, logs, and
/// unreadable files are archived into `lost/`. The result is a database
/// whose manifest registers every surviving table at level 0 (compaction
/// will sort the levels out again).
pub(super) fn repair_database(path: &Path, opts: &Options) -> Result<()> {
    let fs = Arc::clone(&opts.fs);
    let db_dir = path.to_path_buf();
    let icmp = InternalKeyComparator::new(Arc::clone(&opts.comparator));

    let _lock = fs.lock(&DbFile::Lock.path_in(&db_dir))?;

    let mut logs = Vec::new();
    let mut tables = Vec::new();
    let mut manifests = Vec::new();
    let mut max_number_seen = 1_u64;

    for child in fs.children(&db_dir)? {
        let Some(name) = child.to_str() else { continue };
        let Some(parsed) = DbFile::parse(name) else { continue };
        if let Some(number) = parsed.number() {
            max_number_seen = max_number_seen.max(number);
        }
        match parsed {
            DbFile::Log { number } => logs.push(number),
            DbFile::Table { number } | DbFile::LegacyTable { number } => tables.push(number),
            DbFile::Manifest { number } => manifests.push(number),
            DbFile::Current | DbFile::Temp { .. } => {
                archive_file(&*fs, &db_dir, name);
            }
            DbFile::Lock | DbFile::InfoLog | DbFile::OldInfoLog => {}
        }
    }
    logs.sort_unstable();

    let table_cache = Arc::new(TableCache::new(
        Arc::clone(&fs),
        db_dir.clone(),
        icmp.clone(),
        opts.clone(),
        opts.max_open_files.saturating_sub(10),
    ));

    // Convert every log to a table via the ordinary replay path; records
    // that don't parse are skipped, not fatal.
    let mut next_file_number = max_number_seen + 1;
    for log_number in logs {
        let log_name = DbFile::Log { number: log_number }.file_name();
        match convert_log_to_table(
            &*fs,
            &db_dir,
            opts,
            &icmp,
            &table_cache,
            log_number,
            next_file_number,
        ) {
            Ok(Some(table_number)) => {
                tables.push(table_number);
                next_file_number = next_file_number.max(table_number + 1);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(log = log_number, error = %err, "log unsalvageable");
            }
        }
        archive_file(&*fs, &db_dir, &log_name);
    }

    // Scan each table for its real bounds; unreadable tables are archived.
    let mut recovered: Vec<FileMetadataParams> = Vec::new();
    let mut max_sequence: SequenceNumber = 0;
    for table_number in tables {
        match scan_table(&*fs, &db_dir, &table_cache, table_number) {
            Ok((params, newest)) => {
                max_sequence = max_sequence.max(newest);
                recovered.push(params);
            }
            Err(err) => {
                warn!(table = table_number, error = %err, "table unreadable; archiving");
                archive_file(&*fs, &db_dir, &DbFile::Table { number: table_number }.file_name());
                archive_file(
                    &*fs,
                    &db_dir,
                    &DbFile::LegacyTable { number: table_number }.file_name(),
                );
            }
        }
    }

    // Write the replacement manifest, then retire the old ones.
    let manifest_number = next_file_number;
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(opts.comparator.name().to_owned());
    edit.log_number = Some(0);
    edit.next_file_number = Some(next_file_number + 1);
    edit.last_sequence = Some(max_sequence);
    for params in recovered {
        edit.new_files.push((0, params));
    }

    let manifest_path = DbFile::Manifest { number: manifest_number }.path_in(&db_dir);
    let mut writer = LogWriter::new(fs.create(&manifest_path)?);
    let mut record = Vec::new();
    edit.encode(&mut record);
    writer.add_record(&record)?;
    writer.sync()?;
    drop(writer);

    set_current_file(&*fs, &db_dir, manifest_number)?;

    for old_manifest in manifests {
        archive_file(&*fs, &db_dir, &DbFile::Manifest { number: old_manifest }.file_name());
    }

    info!(
        path = %db_dir.display(),
        tables = edit.new_files.len(),
        last_sequence = max_sequence,
        "repair complete",
    );
    Ok(())
}

/// Replay one log into a memtable (ignoring per-record damage) and flush
/// it as a table. `None` if the log held nothing usable.
fn convert_log_to_table(
    fs:           &dyn FileSystem,
    db_dir:       &Path,
    opts:         &Options,
    icmp:         &InternalKeyComparator,
    table_cache:  &TableCache,
    log_number:   u64,
    table_number: u64,
) -> Result<Option<u64>> {
    let path = DbFile::Log { number: log_number }.path_in(db_dir);
    let file = fs.open_sequential(&path)?;
    let mut reader = LogReader::new(file, ());

    let mem = MemTable::new(icmp.clone());
    while let Some(record) = reader.read_record() {
        let Ok(batch) = WriteBatch::from_contents(record) else {
            continue;
        };
        // Damaged batches may apply partially; repair keeps what it can.
        let _ = batch.insert_into(&mem, batch.sequence());
    }

    if mem.is_empty() {
        return Ok(None);
    }

    let mut iter = mem.iter();
    let params = build_table(fs, db_dir, opts, icmp, table_cache, table_number, &mut iter)?;
    info!(
        log = log_number,
        table = params.number,
        bytes = params.file_size,
        "log converted to table",
    );
    Ok(Some(params.number))
}

/// Walk an entire table to learn its first/last keys and newest sequence.
fn scan_table(
    fs:           &dyn FileSystem,
    db_dir:       &Path,
    table_cache:  &TableCache,
    table_number: u64,
) -> Result<(FileMetadataParams, SequenceNumber)> {
    let path = DbFile::Table { number: table_number }.path_in(db_dir);
    let file_size = match fs.size_of(&path) {
        Ok(size) => size,
        Err(_) => fs.size_of(&DbFile::LegacyTable { number: table_number }.path_in(db_dir))?,
    };

    let mut iter = table_cache.iter(table_number, file_size)?;
    iter.seek_to_first();
    if !iter.valid() {
        iter.status()?;
        return Err(Error::corruption("table has no readable entries"));
    }

    let smallest = InternalKey::decode_from(iter.key())?;
    let mut largest = smallest.clone();
    let mut max_sequence = 0;
    while iter.valid() {
        largest = InternalKey::decode_from(iter.key())?;
        if let Ok(parsed) = ParsedInternalKey::decode(iter.key()) {
            max_sequence = max_sequence.max(parsed.sequence);
        }
        iter.next();
    }
    iter.status()?;

    Ok((
        FileMetadataParams { number: table_number, file_size, smallest, largest },
        max_sequence,
    ))
}

/// Move a file into `lost/`, creating the directory on first use. Missing
/// files are fine; damaged databases are full of holes.
fn archive_file(fs: &dyn FileSystem, db_dir: &Path, name: &str) {
    let from = db_dir.join(name);
    match fs.exists(&from) {
        Ok(true) => {}
        _ => return,
    }

    let lost_dir = db_dir.join("lost");
    let _ = fs.create_dir_all(&lost_dir);
    if let Err(err) = fs.rename(&from, &lost_dir.join(name)) {
        warn!(file = name, error = %err, "could not archive file");
    }
}
