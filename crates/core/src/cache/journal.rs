//! Journal line format for the disk cache.
//!
//! A journal starts with a five-line header:
//!
//! ```text
//! pixcache.DiskCache
//! 1
//! <app version>
//! <values per entry>
//! <blank>
//! ```
//!
//! followed by one record per line:
//!
//! - `DIRTY <key>`: an edit began; files may be partially written.
//! - `CLEAN <key> <len>...`: an edit committed; one length per value.
//! - `READ <key>`: the entry was read (access-order hint only).
//! - `REMOVE <key>`: the entry was deleted or an edit of a new entry aborted.
//!
//! An entry is valid after replay iff its last terminal record is `CLEAN`.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::LazyLock;

use regex::Regex;

use crate::Error;

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_FILE_TMP: &str = "journal.tmp";
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";

pub const MAGIC: &str = "pixcache.DiskCache";
pub const FORMAT_VERSION: &str = "1";

/// Keys are restricted so they can name files on any platform.
static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9_-]{1,120}$").expect("key pattern is a valid regex"));

/// Check that `key` may be used as a disk cache key.
pub fn validate_key(key: &str) -> Result<(), Error> {
    if KEY_PATTERN.is_match(key) {
        Ok(())
    } else {
        Err(Error::InvalidKey(format!("keys must match [a-z0-9_-]{{1,120}}: \"{key}\"")))
    }
}

/// Parameters recorded in, and validated against, the journal header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub app_version: u32,
    pub values_per_entry: usize,
}

impl Header {
    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "{MAGIC}")?;
        writeln!(out, "{FORMAT_VERSION}")?;
        writeln!(out, "{}", self.app_version)?;
        writeln!(out, "{}", self.values_per_entry)?;
        writeln!(out)
    }

    /// Read the header and fail unless it matches `self` exactly.
    pub fn expect_from(&self, input: &mut impl BufRead) -> Result<(), Error> {
        let mut fields = Vec::with_capacity(5);
        for _ in 0..5 {
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 || !line.ends_with('\n') {
                return Err(Error::JournalCorrupt("truncated header".into()));
            }
            fields.push(line.trim_end_matches('\n').to_string());
        }

        let expected =
            [MAGIC.to_string(), FORMAT_VERSION.to_string(), self.app_version.to_string(), self.values_per_entry.to_string()];
        if fields[..4] != expected || !fields[4].is_empty() {
            return Err(Error::JournalCorrupt(format!("unexpected header: [{}]", fields.join(", "))));
        }
        Ok(())
    }
}

/// One journal body line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Dirty(String),
    Clean(String, Vec<u64>),
    Read(String),
    Remove(String),
}

impl Record {
    /// Parse a body line (without its trailing newline).
    pub fn parse(line: &str) -> Result<Self, Error> {
        let corrupt = || Error::JournalCorrupt(format!("unexpected journal line: {line}"));

        let mut parts = line.split(' ');
        let op = parts.next().ok_or_else(corrupt)?;
        let key = parts.next().ok_or_else(corrupt)?;
        validate_key(key).map_err(|_| corrupt())?;
        let key = key.to_string();

        let record = match op {
            "CLEAN" => {
                let lengths = parts
                    .by_ref()
                    .map(|len| len.parse::<u64>().map_err(|_| corrupt()))
                    .collect::<Result<Vec<_>, _>>()?;
                if lengths.is_empty() {
                    return Err(corrupt());
                }
                Record::Clean(key, lengths)
            }
            "DIRTY" => Record::Dirty(key),
            "READ" => Record::Read(key),
            "REMOVE" => Record::Remove(key),
            _ => return Err(corrupt()),
        };

        if parts.next().is_some() {
            return Err(corrupt());
        }
        Ok(record)
    }

    pub fn key(&self) -> &str {
        match self {
            Record::Dirty(key) | Record::Clean(key, _) | Record::Read(key) | Record::Remove(key) => key,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Dirty(key) => write!(f, "DIRTY {key}"),
            Record::Clean(key, lengths) => {
                write!(f, "CLEAN {key}")?;
                for len in lengths {
                    write!(f, " {len}")?;
                }
                Ok(())
            }
            Record::Read(key) => write!(f, "READ {key}"),
            Record::Remove(key) => write!(f, "REMOVE {key}"),
        }
    }
}
