use std::path::{Path, PathBuf};


/// The files that may live inside a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbFile {
    /// `<N>.log`: write-ahead log.
    Log { number: u64 },
    /// `<N>.ldb`: sorted table.
    Table { number: u64 },
    /// `<N>.sst`: sorted table with the legacy extension; readable, never
    /// written.
    LegacyTable { number: u64 },
    /// `MANIFEST-<N>`: log-framed stream of version edits.
    Manifest { number: u64 },
    /// `<N>.dbtmp`: scratch file published by rename.
    Temp { number: u64 },
    /// `CURRENT`: names the live manifest.
    Current,
    /// `LOCK`: held under advisory lock while the database is open.
    Lock,
    /// `LOG` / `LOG.old`: informational logs, not managed here beyond
    /// recognition.
    InfoLog,
    OldInfoLog,
}

impl DbFile {
    /// The file's name within the database directory.
    pub(crate) fn file_name(self) -> String {
        match self {
            Self::Log { number } => format!("{number:06}.log"),
            Self::Table { number } => format!("{number:06}.ldb"),
            Self::LegacyTable { number } => format!("{number:06}.sst"),
            Self::Manifest { number } => format!("MANIFEST-{number:06}"),
            Self::Temp { number } => format!("{number:06}.dbtmp"),
            Self::Current => "CURRENT".to_owned(),
            Self::Lock => "LOCK".to_owned(),
            Self::InfoLog => "LOG".to_owned(),
            Self::OldInfoLog => "LOG.old".to_owned(),
        }
    }

    pub(crate) fn path_in(self, db_dir: &Path) -> PathBuf {
        db_dir.join(self.file_name())
    }

    /// Parse a directory entry's name. `None` for anything unrecognized,
    /// which the database leaves untouched.
    pub(crate) fn parse(file_name: &str) -> Option<Self> {
        match file_name {
            "CURRENT" => return Some(Self::Current),
            "LOCK" => return Some(Self::Lock),
            "LOG" => return Some(Self::InfoLog),
            "LOG.old" => return Some(Self::OldInfoLog),
            _ => {}
        }

        if let Some(number) = file_name.strip_prefix("MANIFEST-") {
            let number = number.parse().ok()?;
            return Some(Self::Manifest { number });
        }

        let (stem, extension) = file_name.split_once('.')?;
        let number: u64 = stem.parse().ok()?;
        match extension {
            "log" => Some(Self::Log { number }),
            "ldb" => Some(Self::Table { number }),
            "sst" => Some(Self::LegacyTable { number }),
            "dbtmp" => Some(Self::Temp { number }),
            _ => None,
        }
    }

    /// The file number, for the variants that carry one.
    pub(crate) fn number(self) -> Option<u64> {
        match self {
            Self::Log { number }
            | Self::Table { number }
            | Self::LegacyTable { number }
            | Self::Manifest { number }
            | Self::Temp { number } => Some(number),
            Self::Current | Self::Lock | Self::InfoLog | Self::OldInfoLog => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn names_round_trip() {
        for file in [
            DbFile::Log { number: 7 },
            DbFile::Table { number: 123_456 },
            DbFile::LegacyTable { number: 5 },
            DbFile::Manifest { number: 2 },
            DbFile::Temp { number: 99 },
            DbFile::Current,
            DbFile::Lock,
            DbFile::InfoLog,
            DbFile::OldInfoLog,
        ] {
            assert_eq!(DbFile::parse(&file.file_name()), Some(file));
        }
    }

    #[test]
    fn numbers_are_zero_padded_but_parse_unpadded() {
        assert_eq!(DbFile::Log { number: 7 }.file_name(), "000007.log");
        assert_eq!(DbFile::Manifest { number: 1_234_567 }.file_name(), "MANIFEST-1234567");
        assert_eq!(DbFile::parse("7.log"), Some(DbFile::Log { number: 7 }));
    }

    #[test]
    fn junk_is_ignored() {
        assert_eq!(DbFile::parse("readme.txt"), None);
        assert_eq!(DbFile::parse("MANIFEST-"), None);
        assert_eq!(DbFile::parse("xyz.ldb"), None);
        assert_eq!(DbFile::parse(""), None);
    }
}
