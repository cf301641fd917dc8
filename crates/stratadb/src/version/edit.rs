use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::format::{InternalKey, SequenceNumber};
use crate::version::FileMetadataParams;


/// Field tags of the manifest encoding. Values are part of the file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Tag {
    Comparator     = 1,
    LogNumber      = 2,
    NextFileNumber = 3,
    LastSequence   = 4,
    CompactPointer = 5,
    DeletedFile    = 6,
    NewFile        = 7,
    // 8 was an abandoned large-value-ref field in the ancestral format.
    PrevLogNumber  = 9,
}

impl Tag {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Comparator),
            2 => Some(Self::LogNumber),
            3 => Some(Self::NextFileNumber),
            4 => Some(Self::LastSequence),
            5 => Some(Self::CompactPointer),
            6 => Some(Self::DeletedFile),
            7 => Some(Self::NewFile),
            9 => Some(Self::PrevLogNumber),
            _ => None,
        }
    }
}

/// A delta between two versions: optional scalar fields plus per-level file
/// additions, deletions, and compaction pointers. Edits compose by replay
/// in manifest order.
#[derive(Default, Debug)]
pub(crate) struct VersionEdit {
    pub comparator_name:  Option<String>,
    pub log_number:       Option<u64>,
    pub prev_log_number:  Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence:    Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files:    Vec<(usize, u64)>,
    pub new_files:        Vec<(usize, FileMetadataParams)>,
}

impl VersionEdit {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_file(
        &mut self,
        level:     usize,
        number:    u64,
        file_size: u64,
        smallest:  InternalKey,
        largest:   InternalKey,
    ) {
        self.new_files.push((level, FileMetadataParams { number, file_size, smallest, largest }));
    }

    pub(crate) fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub(crate) fn encode(&self, output: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            write_tag(output, Tag::Comparator);
            write_length_prefixed(output, name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            write_tag(output, Tag::LogNumber);
            write_varint_u64(output, log_number);
        }
        if let Some(prev_log_number) = self.prev_log_number {
            write_tag(output, Tag::PrevLogNumber);
            write_varint_u64(output, prev_log_number);
        }
        if let Some(next_file_number) = self.next_file_number {
            write_tag(output, Tag::NextFileNumber);
            write_varint_u64(output, next_file_number);
        }
        if let Some(last_sequence) = self.last_sequence {
            write_tag(output, Tag::LastSequence);
            write_varint_u64(output, last_sequence);
        }
        for (level, key) in &self.compact_pointers {
            write_tag(output, Tag::CompactPointer);
            write_level(output, *level);
            write_length_prefixed(output, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            write_tag(output, Tag::DeletedFile);
            write_level(output, *level);
            write_varint_u64(output, *number);
        }
        for (level, file) in &self.new_files {
            write_tag(output, Tag::NewFile);
            write_level(output, *level);
            write_varint_u64(output, file.number);
            write_varint_u64(output, file.file_size);
            write_length_prefixed(output, file.smallest.encoded());
            write_length_prefixed(output, file.largest.encoded());
        }
    }

    pub(crate) fn decode(mut input: &[u8]) -> Result<Self> {
        let mut edit = Self::new();

        while !input.is_empty() {
            let tag_value = read_varint_u32(&mut input)?;
            let Some(tag) = Tag::from_u32(tag_value) else {
                return Err(Error::corruption(format!(
                    "unknown version edit tag {tag_value}"
                )));
            };

            match tag {
                Tag::Comparator => {
                    let name = read_length_prefixed(&mut input)?;
                    let name = String::from_utf8(name.to_vec()).map_err(|_| {
                        Error::corruption("comparator name is not utf-8")
                    })?;
                    edit.comparator_name = Some(name);
                }
                Tag::LogNumber => edit.log_number = Some(read_varint_u64(&mut input)?),
                Tag::PrevLogNumber => edit.prev_log_number = Some(read_varint_u64(&mut input)?),
                Tag::NextFileNumber => {
                    edit.next_file_number = Some(read_varint_u64(&mut input)?);
                }
                Tag::LastSequence => edit.last_sequence = Some(read_varint_u64(&mut input)?),
                Tag::CompactPointer => {
                    let level = read_level(&mut input)?;
                    let key = InternalKey::decode_from(read_length_prefixed(&mut input)?)?;
                    edit.compact_pointers.push((level, key));
                }
                Tag::DeletedFile => {
                    let level = read_level(&mut input)?;
                    let number = read_varint_u64(&mut input)?;
                    edit.deleted_files.push((level, number));
                }
                Tag::NewFile => {
                    let level = read_level(&mut input)?;
                    let number = read_varint_u64(&mut input)?;
                    let file_size = read_varint_u64(&mut input)?;
                    let smallest = InternalKey::decode_from(read_length_prefixed(&mut input)?)?;
                    let largest = InternalKey::decode_from(read_length_prefixed(&mut input)?)?;
                    edit.new_files
                        .push((level, FileMetadataParams { number, file_size, smallest, largest }));
                }
            }
        }

        Ok(edit)
    }
}

fn write_tag(output: &mut Vec<u8>, tag: Tag) {
    output.write_varint(tag as u32).expect("vec write");
}

fn write_level(output: &mut Vec<u8>, level: usize) {
    output.write_varint(level as u32).expect("vec write");
}

fn write_varint_u64(output: &mut Vec<u8>, value: u64) {
    output.write_varint(value).expect("vec write");
}

fn write_length_prefixed(output: &mut Vec<u8>, bytes: &[u8]) {
    output.write_varint(bytes.len() as u32).expect("vec write");
    output.extend_from_slice(bytes);
}

fn read_varint_u32(input: &mut &[u8]) -> Result<u32> {
    let (value, len) = u32::decode_var(input)
        .ok_or_else(|| Error::corruption("truncated varint in version edit"))?;
    *input = &input[len..];
    Ok(value)
}

fn read_varint_u64(input: &mut &[u8]) -> Result<u64> {
    let (value, len) = u64::decode_var(input)
        .ok_or_else(|| Error::corruption("truncated varint in version edit"))?;
    *input = &input[len..];
    Ok(value)
}

fn read_length_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_varint_u32(input)? as usize;
    if len > input.len() {
        return Err(Error::corruption("length-prefixed slice overruns version edit"));
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    Ok(bytes)
}

fn read_level(input: &mut &[u8]) -> Result<usize> {
    let level = read_varint_u32(input)? as usize;
    if level >= NUM_LEVELS {
        return Err(Error::corruption(format!("level {level} out of range")));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use crate::format::ValueType;
    use super::*;


    fn encode(edit: &VersionEdit) -> Vec<u8> {
        let mut output = Vec::new();
        edit.encode(&mut output);
        output
    }

    #[test]
    fn empty_edit_round_trips() {
        let edit = VersionEdit::new();
        let encoded = encode(&edit);
        assert!(encoded.is_empty());
        let decoded = VersionEdit::decode(&encoded).unwrap();
        assert_eq!(encode(&decoded), encoded);
    }

    #[test]
    fn big_values_round_trip_byte_exact() {
        // Values near 2^50 exercise multi-byte varints everywhere.
        const BIG: u64 = 1 << 50;

        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("foo".to_owned());
        edit.log_number = Some(BIG + 100);
        edit.next_file_number = Some(BIG + 200);
        edit.last_sequence = Some(BIG + 1000);

        for offset in 0..4_u64 {
            edit.add_file(
                3,
                BIG + 300 + offset,
                BIG + 400 + offset,
                InternalKey::new(b"foo", BIG + 500 + offset, ValueType::Value),
                InternalKey::new(b"zoo", BIG + 600 + offset, ValueType::Deletion),
            );
            edit.remove_file(4, BIG + 700 + offset);
            edit.compact_pointers.push((
                offset as usize,
                InternalKey::new(b"x", BIG + 900 + offset, ValueType::Value),
            ));
        }

        let encoded = encode(&edit);
        let decoded = VersionEdit::decode(&encoded).unwrap();
        // Serialize-deserialize-serialize must be byte-identical.
        assert_eq!(encode(&decoded), encoded);
        assert_eq!(decoded.comparator_name.as_deref(), Some("foo"));
        assert_eq!(decoded.log_number, Some(BIG + 100));
        assert_eq!(decoded.new_files.len(), 4);
        assert_eq!(decoded.deleted_files.len(), 4);
        assert_eq!(decoded.compact_pointers.len(), 4);
    }

    #[test]
    fn unknown_tag_aborts_decoding() {
        let mut encoded = Vec::new();
        encoded.write_varint(8_u32).unwrap(); // the retired tag
        assert!(VersionEdit::decode(&encoded).is_err());

        let mut encoded = Vec::new();
        encoded.write_varint(100_u32).unwrap();
        assert!(VersionEdit::decode(&encoded).is_err());
    }

    #[test]
    fn truncated_edit_is_corruption() {
        let mut edit = VersionEdit::new();
        edit.log_number = Some(u64::MAX);
        let encoded = encode(&edit);
        assert!(VersionEdit::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
