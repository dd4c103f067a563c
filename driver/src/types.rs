use chrono::{DateTime, FixedOffset, NaiveDateTime};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{DResult, DriverError};

/// Bind data types accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DataType {
    String = 0,
    Blob = 1,
    Clob = 2,
    Raw = 3,
    BlobSingleRound = 4,
    ClobSingleRound = 5,
    Timestamp = 6,
    TimestampTz = 7,
}

impl DataType {
    /// Piecewise LOBs are written after execute and cannot be array-bound.
    pub fn is_piecewise_lob(self) -> bool {
        matches!(self, DataType::Blob | DataType::Clob)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, DataType::Timestamp | DataType::TimestampTz)
    }
}

/// Statement kind as reported by the driver after prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum StatementKind {
    Select = 1,
    Update = 2,
    Delete = 3,
    Insert = 4,
    Create = 5,
    Drop = 6,
    Alter = 7,
    Begin = 8,
    Declare = 9,
    Unknown = 10,
    SelectForUpdate = 11,
    Call = 12,
    Merge = 16,
    Rollback = 17,
    Commit = 21,
}

impl StatementKind {
    pub fn is_select(self) -> bool {
        matches!(self, StatementKind::Select | StatementKind::SelectForUpdate)
    }

    pub fn is_dml(self) -> bool {
        matches!(
            self,
            StatementKind::Update
                | StatementKind::Insert
                | StatementKind::Delete
                | StatementKind::Merge
        )
    }

    pub fn is_plsql(self) -> bool {
        matches!(self, StatementKind::Begin | StatementKind::Declare)
    }

    /// Keyword-based inference for drivers without a native statement-type
    /// attribute.
    pub fn infer(sql: &str) -> StatementKind {
        let trimmed = strip_leading_comment(sql).trim_start();
        let word: String = trimmed
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        match word.to_ascii_lowercase().as_str() {
            "select" => {
                if common::string_util::index_of_ignore_case(trimmed, " for update").is_some() {
                    StatementKind::SelectForUpdate
                } else {
                    StatementKind::Select
                }
            }
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            "insert" => StatementKind::Insert,
            "create" => StatementKind::Create,
            "drop" => StatementKind::Drop,
            "alter" => StatementKind::Alter,
            "begin" => StatementKind::Begin,
            "declare" => StatementKind::Declare,
            "merge" => StatementKind::Merge,
            "call" => StatementKind::Call,
            "commit" => StatementKind::Commit,
            "rollback" => StatementKind::Rollback,
            _ => StatementKind::Unknown,
        }
    }
}

fn strip_leading_comment(sql: &str) -> &str {
    let t = sql.trim_start();
    if let Some(rest) = t.strip_prefix("/*") {
        if let Some(end) = rest.find("*/") {
            return &rest[end + 2..];
        }
    }
    t
}

/// Output column type codes, a subset of the native numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ColumnType {
    Varchar = 1,
    Number = 2,
    Str = 5,
    Long = 8,
    Date = 12,
    Raw = 23,
    Clob = 112,
    Blob = 113,
    Timestamp = 187,
    TimestampTz = 188,
}

impl ColumnType {
    pub fn is_lob(self) -> bool {
        matches!(self, ColumnType::Clob | ColumnType::Blob)
    }

    pub fn is_temporal_descriptor(self) -> bool {
        matches!(self, ColumnType::Timestamp | ColumnType::TimestampTz)
    }

    pub fn is_datetime_like(self) -> bool {
        matches!(
            self,
            ColumnType::Date | ColumnType::Timestamp | ColumnType::TimestampTz
        )
    }
}

/// Result-column metadata, populated after the first successful execute of
/// a SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub col_type: ColumnType,
    /// Display width: characters for character-semantic columns, bytes
    /// otherwise.
    pub width: u32,
    pub precision: u8,
    pub scale: i8,
}

/// Role of this database in a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum TransRole {
    Participant = 0,
    PointSite = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransCoupling {
    TightlyCoupled,
    LooselyCoupled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

/// `formatID:gtrid:bqual`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    pub format_id: u32,
    pub gtrid: String,
    pub bqual: String,
}

impl Xid {
    pub fn parse(raw: &str) -> DResult<Xid> {
        let mut parts = raw.splitn(3, ':');
        let (Some(fmt), Some(gtrid), Some(bqual)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(DriverError::internal(format!("invalid XID: {}", raw)));
        };
        let format_id = fmt
            .trim()
            .parse()
            .map_err(|_| DriverError::internal(format!("invalid XID: {}", raw)))?;
        if gtrid.is_empty() {
            return Err(DriverError::internal(format!("invalid XID: {}", raw)));
        }
        Ok(Xid {
            format_id,
            gtrid: gtrid.to_string(),
            bqual: bqual.to_string(),
        })
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.format_id, self.gtrid, self.bqual)
    }
}

/// Session attributes the worker pushes down before execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAttr {
    /// Comma-joined bind data, shown in session monitoring views.
    ClientIdentifier,
    /// The scuttle id of the current request.
    ClientInfo,
    /// Correlation id.
    Action,
    Module,
}

/// Database facts discovered at connect time.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub version: String,
    pub release: String,
    pub charset: String,
    pub unique_name: String,
    pub instance_id: u32,
}

impl ServerInfo {
    /// Only the two canonical UTF-8 charset names are accepted.
    pub fn charset_is_utf8(&self) -> bool {
        self.charset.eq_ignore_ascii_case("UTF8") || self.charset.eq_ignore_ascii_case("AL32UTF8")
    }
}

/// Canonical timestamp wire formats.
pub mod datetime {
    use super::*;

    const FMT: &str = "%d-%m-%Y %H:%M:%S%.3f";
    const FMT_TZ: &str = "%d-%m-%Y %H:%M:%S%.3f %:z";

    pub fn parse_timestamp(text: &str) -> DResult<NaiveDateTime> {
        NaiveDateTime::parse_from_str(text, FMT)
            .map_err(|e| DriverError::internal(format!("bad timestamp {:?}: {}", text, e)))
    }

    pub fn parse_timestamp_tz(text: &str) -> DResult<DateTime<FixedOffset>> {
        DateTime::parse_from_str(text, FMT_TZ)
            .map_err(|e| DriverError::internal(format!("bad timestamp {:?}: {}", text, e)))
    }

    pub fn format_timestamp(value: &NaiveDateTime) -> String {
        value.format(FMT).to_string()
    }

    pub fn format_timestamp_tz(value: &DateTime<FixedOffset>) -> String {
        value.format(FMT_TZ).to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_inference() {
        assert_eq!(StatementKind::infer("SELECT 1"), StatementKind::Select);
        assert_eq!(
            StatementKind::infer("select x from t for update"),
            StatementKind::SelectForUpdate
        );
        assert_eq!(
            StatementKind::infer("/* hint */ update t set a=1"),
            StatementKind::Update
        );
        assert_eq!(StatementKind::infer("CALL p(:a)"), StatementKind::Call);
        assert_eq!(StatementKind::infer("bogus"), StatementKind::Unknown);
        assert!(StatementKind::Merge.is_dml());
        assert!(!StatementKind::Select.is_dml());
    }

    #[test]
    fn xid_parse() {
        let xid = Xid::parse("1:abc:x").unwrap();
        assert_eq!(xid.format_id, 1);
        assert_eq!(xid.gtrid, "abc");
        assert_eq!(xid.bqual, "x");
        assert_eq!(xid.to_string(), "1:abc:x");

        assert!(Xid::parse("1:abc").is_err());
        assert!(Xid::parse("nope:abc:x").is_err());
    }

    #[test]
    fn charset_gate() {
        let mut info = ServerInfo::default();
        info.charset = "AL32UTF8".into();
        assert!(info.charset_is_utf8());
        info.charset = "utf8".into();
        assert!(info.charset_is_utf8());
        info.charset = "WE8ISO8859P1".into();
        assert!(!info.charset_is_utf8());
    }

    #[test]
    fn timestamp_round_trip() {
        let ts = datetime::parse_timestamp("25-12-2023 13:45:59.123").unwrap();
        assert_eq!(datetime::format_timestamp(&ts), "25-12-2023 13:45:59.123");
    }
}
