//! Row mapping between SQLite and ledger entities

use crate::checksum::Digest;
use crate::model::{ArchiveAttempt, FileRecord, TapeRecord};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use std::str::FromStr;

pub(crate) const FILE_COLUMNS: &str = "f.id, f.path, f.name, f.size, f.digest, f.status, \
     f.obsid, f.jd_start, f.jd, t.barcode, f.failure_count, f.integrity_failures, \
     f.last_failure, f.created_at, f.updated_at, f.archived_at";

pub(crate) const FILE_FROM: &str = "files f LEFT JOIN tapes t ON t.id = f.tape_id";

pub(crate) const TAPE_COLUMNS: &str = "t.id, t.barcode, t.tape_type, t.capacity, t.bytes_used, \
     t.mount_count, t.status, t.purchase_date, t.mounted_by, t.leased_at, t.registered_at";

pub(crate) const ATTEMPT_COLUMNS: &str = "a.id, a.file_id, a.tape_id, t.barcode, \
     a.attempt_number, a.status, a.claimed_by, a.tape_offset, a.length, a.digest, \
     a.failure_reason, a.failure_detail, a.created_at, a.started_at, a.ended_at, a.updated_at";

pub(crate) const ATTEMPT_FROM: &str = "attempts a JOIN tapes t ON t.id = a.tape_id";

pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(micros) => DateTime::from_timestamp_micros(micros)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros)),
        None => Ok(None),
    }
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn opt_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|e| conversion_error(idx, Type::Text, e)),
        None => Ok(None),
    }
}

fn unsigned(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn opt_unsigned(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(value) => u64::try_from(value)
            .map(Some)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value)),
        None => Ok(None),
    }
}

pub(crate) fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        size: unsigned(row, 3)?,
        digest: opt_parsed::<Digest>(row, 4)?,
        status: parsed(row, 5)?,
        obsid: row.get(6)?,
        jd_start: row.get(7)?,
        jd: row.get(8)?,
        tape: row.get(9)?,
        failure_count: row.get(10)?,
        integrity_failures: row.get(11)?,
        last_failure: opt_parsed(row, 12)?,
        created_at: time_at(row, 13)?,
        updated_at: time_at(row, 14)?,
        archived_at: opt_time_at(row, 15)?,
    })
}

pub(crate) fn tape_from_row(row: &Row<'_>) -> rusqlite::Result<TapeRecord> {
    Ok(TapeRecord {
        id: row.get(0)?,
        barcode: row.get(1)?,
        tape_type: row.get(2)?,
        capacity: unsigned(row, 3)?,
        bytes_used: unsigned(row, 4)?,
        mount_count: unsigned(row, 5)?,
        status: parsed(row, 6)?,
        purchase_date: opt_parsed::<NaiveDate>(row, 7)?,
        mounted_by: row.get(8)?,
        leased_at: opt_time_at(row, 9)?,
        registered_at: time_at(row, 10)?,
    })
}

pub(crate) fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveAttempt> {
    Ok(ArchiveAttempt {
        id: row.get(0)?,
        file_id: row.get(1)?,
        tape_id: row.get(2)?,
        tape: row.get(3)?,
        attempt_number: row.get(4)?,
        status: parsed(row, 5)?,
        claimed_by: row.get(6)?,
        offset: opt_unsigned(row, 7)?,
        length: opt_unsigned(row, 8)?,
        digest: opt_parsed::<Digest>(row, 9)?,
        failure_reason: opt_parsed(row, 10)?,
        failure_detail: row.get(11)?,
        created_at: time_at(row, 12)?,
        started_at: opt_time_at(row, 13)?,
        ended_at: opt_time_at(row, 14)?,
        updated_at: time_at(row, 15)?,
    })
}
