//! Parquet export filename codec.
//!
//! Every source file is named `{schema}-{table}-{start}-{end}.{parquet|empty}`
//! with integer-second timestamps. A full baseline has `start == 0`;
//! incrementals cover the half-open window `[start, end)`. The `.empty`
//! extension marks a window known to contain no rows.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("malformed parquet filename: {0}")]
pub struct MalformedName(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileExt {
    Parquet,
    Empty,
}

impl FileExt {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileExt::Parquet => "parquet",
            FileExt::Empty => "empty",
        }
    }
}

/// Parsed form of an export filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParquetFilename {
    pub schema: String,
    pub table: String,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub ext: FileExt,
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)-(.+)-(\d+)-(\d+)\.(parquet|empty)$").unwrap())
}

impl ParquetFilename {
    pub fn parse(name: &str) -> Result<Self, MalformedName> {
        let caps = filename_re()
            .captures(name)
            .ok_or_else(|| MalformedName(name.to_string()))?;

        // \d+ guarantees digits, but the value can still overflow u64
        let start_timestamp = caps[3]
            .parse()
            .map_err(|_| MalformedName(name.to_string()))?;
        let end_timestamp = caps[4]
            .parse()
            .map_err(|_| MalformedName(name.to_string()))?;

        let ext = match &caps[5] {
            "parquet" => FileExt::Parquet,
            "empty" => FileExt::Empty,
            _ => unreachable!("regex only admits parquet|empty"),
        };

        Ok(Self {
            schema: caps[1].to_string(),
            table: caps[2].to_string(),
            start_timestamp,
            end_timestamp,
            ext,
        })
    }

    pub fn format(
        schema: &str,
        table: &str,
        start_timestamp: u64,
        end_timestamp: u64,
        ext: FileExt,
    ) -> String {
        format!(
            "{}-{}-{}-{}.{}",
            schema,
            table,
            start_timestamp,
            end_timestamp,
            ext.as_str()
        )
    }

    /// Full baselines are the files starting at the epoch.
    pub fn is_full(&self) -> bool {
        self.start_timestamp == 0
    }

    /// Tracking-table `file_type` value.
    pub fn file_type(&self) -> &'static str {
        if self.is_full() {
            "full"
        } else {
            "incremental"
        }
    }

    /// Window width in seconds.
    pub fn duration_s(&self) -> u64 {
        self.end_timestamp.saturating_sub(self.start_timestamp)
    }
}

impl fmt::Display for ParquetFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}.{}",
            self.schema,
            self.table,
            self.start_timestamp,
            self.end_timestamp,
            self.ext.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_incremental() {
        let parsed = ParquetFilename::parse("farcaster-casts-1000-1300.parquet").unwrap();
        assert_eq!(parsed.schema, "farcaster");
        assert_eq!(parsed.table, "casts");
        assert_eq!(parsed.start_timestamp, 1000);
        assert_eq!(parsed.end_timestamp, 1300);
        assert_eq!(parsed.ext, FileExt::Parquet);
        assert!(!parsed.is_full());
        assert_eq!(parsed.file_type(), "incremental");
        assert_eq!(parsed.duration_s(), 300);
    }

    #[test]
    fn test_parse_full() {
        let parsed = ParquetFilename::parse("farcaster-casts-0-1700000000.parquet").unwrap();
        assert!(parsed.is_full());
        assert_eq!(parsed.file_type(), "full");
    }

    #[test]
    fn test_parse_empty_marker() {
        let parsed = ParquetFilename::parse("nindexer-profiles-2000-2300.empty").unwrap();
        assert_eq!(parsed.ext, FileExt::Empty);
    }

    #[test]
    fn test_table_names_with_underscores_and_dashes() {
        // The middle fields are greedy; the last two dash-separated digit
        // fields always win the timestamps.
        let parsed = ParquetFilename::parse("farcaster-channel_follows-300-600.parquet").unwrap();
        assert_eq!(parsed.table, "channel_follows");

        let parsed = ParquetFilename::parse("my-schema-some-table-300-600.parquet").unwrap();
        assert_eq!(parsed.schema, "my-schema-some");
        assert_eq!(parsed.table, "table");
    }

    #[test]
    fn test_round_trip() {
        for name in [
            "farcaster-casts-0-1700000000.parquet",
            "farcaster-casts-1000-1300.parquet",
            "nindexer-profiles-2000-2300.empty",
        ] {
            let parsed = ParquetFilename::parse(name).unwrap();
            assert_eq!(parsed.to_string(), name);
            assert_eq!(
                ParquetFilename::format(
                    &parsed.schema,
                    &parsed.table,
                    parsed.start_timestamp,
                    parsed.end_timestamp,
                    parsed.ext
                ),
                name
            );
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "casts.parquet",
            "farcaster-casts-0-100.csv",
            "farcaster-casts-0.parquet",
            "farcaster-casts-abc-100.parquet",
            "",
        ] {
            assert!(ParquetFilename::parse(bad).is_err(), "{bad:?} should fail");
        }
    }
}
