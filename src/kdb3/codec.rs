//
// Group and entry records of the plain content
//
// Every record is a run of `{u16 type}{u32 size}{payload}` fields closed by
// an end field of type 0xFFFF and size 0. Unset values are not written.
//

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::kdb3::binary::{self, cstr_bytes, push_u16, push_u32, read_cstr, read_string, read_u16, read_u32, slice};
use crate::kdb3::date::{PackedDate, PACKED_DATE_LEN};
use crate::kdb3::entry::Entry;
use crate::kdb3::error::{Error, Result};
use crate::kdb3::format::*;
use crate::kdb3::group::Group;
use crate::kdb3::progress::{Outcome, Ticker};
use crate::kdb3::secret::{Mask, SecretBytes};


// Walks the fields of one record
struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    // Next field, or None once the end field has been consumed
    fn next_field(&mut self, end_type: u16) -> Result<Option<(u16, &'a [u8])>> {
        let field_type = read_u16(self.data, self.offset)?;
        let field_size = read_u32(self.data, self.offset + 2)? as usize;
        let payload = slice(self.data, self.offset + KDB3_FIELD_PREFIX_LEN, field_size)?;
        self.offset += KDB3_FIELD_PREFIX_LEN + field_size;

        if field_type == end_type {
            if field_size != 0 {
                return Err(Error::MalformedFile("record end field not zero sized"));
            }
            return Ok(None);
        }
        Ok(Some((field_type, payload)))
    }
}


// Parse a single group, returning it with the offset past its end field
pub fn decode_group(data: &[u8], offset: usize) -> Result<(Group, usize)> {
    let mut group = Group::default();
    let mut has_id = false;
    let mut fields = FieldReader { data, offset };

    while let Some((field_type, payload)) = fields.next_field(KDB3_GROUP_END)? {
        match field_type {
            KDB3_GROUP_IGNORE => {}
            KDB3_GROUP_ID => {
                group.id = read_u32(payload, 0)?;
                has_id = true;
            }
            KDB3_GROUP_TITLE    => group.name     = Some(read_string(payload)),
            KDB3_GROUP_CREATED  => group.created  = PackedDate::decode(payload, 0)?,
            KDB3_GROUP_MODIFIED => group.modified = PackedDate::decode(payload, 0)?,
            KDB3_GROUP_ACCESSED => group.accessed = PackedDate::decode(payload, 0)?,
            KDB3_GROUP_EXPIRES  => group.expires  = PackedDate::decode(payload, 0)?,
            KDB3_GROUP_IMAGE_ID => group.image_id = Some(read_u32(payload, 0)?),
            KDB3_GROUP_LEVEL    => group.level    = read_u16(payload, 0)?,
            KDB3_GROUP_FLAGS    => group.flags    = Some(read_u32(payload, 0)?),
            _ => tracing::trace!("Skipping group field {:#06x} ({} bytes)", field_type, payload.len()),
        }
    }

    if !has_id {
        return Err(Error::MalformedFile("group without id"));
    }
    Ok((group, fields.offset))
}


// Parse a single entry. The password is kept as opaque bytes behind `mask`.
pub fn decode_entry(data: &[u8], offset: usize, mask: Option<&Arc<Mask>>) -> Result<(Entry, usize)> {
    let mut entry = Entry::default();
    let mut has_id = false;
    let mut fields = FieldReader { data, offset };

    while let Some((field_type, payload)) = fields.next_field(KDB3_ENTRY_END)? {
        match field_type {
            KDB3_ENTRY_IGNORE => {}
            KDB3_ENTRY_UUID => {
                if payload.len() != entry.uuid.len() {
                    return Err(Error::MalformedFile("invalid uuid field size"));
                }
                entry.uuid.copy_from_slice(payload);
                has_id = true;
            }
            KDB3_ENTRY_GROUP_ID    => entry.group_id    = Some(read_u32(payload, 0)?),
            KDB3_ENTRY_IMAGE_ID    => entry.image_id    = Some(read_u32(payload, 0)?),
            KDB3_ENTRY_TITLE       => entry.title       = Some(read_string(payload)),
            KDB3_ENTRY_URL         => entry.url         = Some(read_string(payload)),
            KDB3_ENTRY_USERNAME    => entry.username    = Some(read_string(payload)),
            KDB3_ENTRY_PASSWORD    => entry.password    = Some(SecretBytes::new(read_cstr(payload), mask)),
            KDB3_ENTRY_COMMENT     => entry.notes       = Some(read_string(payload)),
            KDB3_ENTRY_CREATED     => entry.created     = PackedDate::decode(payload, 0)?,
            KDB3_ENTRY_MODIFIED    => entry.modified    = PackedDate::decode(payload, 0)?,
            KDB3_ENTRY_ACCESSED    => entry.accessed    = PackedDate::decode(payload, 0)?,
            KDB3_ENTRY_EXPIRES     => entry.expires     = PackedDate::decode(payload, 0)?,
            KDB3_ENTRY_BINARY_DESC => entry.binary_desc = Some(read_string(payload)),
            KDB3_ENTRY_BINARY      => entry.binary      = Some(payload.to_vec()),
            _ => tracing::trace!("Skipping entry field {:#06x} ({} bytes)", field_type, payload.len()),
        }
    }

    if !has_id {
        return Err(Error::MalformedFile("entry without uuid"));
    }
    Ok((entry, fields.offset))
}


//
// Encoding
//

fn push_field(out: &mut Vec<u8>, field_type: u16, payload: &[u8]) {
    push_u16(out, field_type);
    push_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

fn push_u32_field(out: &mut Vec<u8>, field_type: u16, value: Option<u32>) {
    if let Some(value) = value {
        push_u16(out, field_type);
        push_u32(out, 4);
        push_u32(out, value);
    }
}

fn push_str_field(out: &mut Vec<u8>, field_type: u16, value: Option<&str>) {
    if let Some(value) = value {
        push_field(out, field_type, &binary::string_bytes(value));
    }
}

fn push_date_field(out: &mut Vec<u8>, field_type: u16, value: Option<PackedDate>) {
    if let Some(date) = value {
        push_u16(out, field_type);
        push_u32(out, PACKED_DATE_LEN as u32);
        out.extend_from_slice(&date.encode());
    }
}

fn push_end_field(out: &mut Vec<u8>, end_type: u16) {
    push_u16(out, end_type);
    push_u32(out, 0);
}

pub fn encode_group(group: &Group, out: &mut Vec<u8>) {
    push_u32_field(out, KDB3_GROUP_ID, Some(group.id));
    push_str_field(out, KDB3_GROUP_TITLE, group.name());
    push_date_field(out, KDB3_GROUP_CREATED, group.created);
    push_date_field(out, KDB3_GROUP_MODIFIED, group.modified);
    push_date_field(out, KDB3_GROUP_ACCESSED, group.accessed);
    push_date_field(out, KDB3_GROUP_EXPIRES, group.expires);
    push_u32_field(out, KDB3_GROUP_IMAGE_ID, group.image_id);

    push_u16(out, KDB3_GROUP_LEVEL);
    push_u32(out, 2);
    push_u16(out, group.level);

    push_u32_field(out, KDB3_GROUP_FLAGS, group.flags);
    push_end_field(out, KDB3_GROUP_END);
}

// `out` receives the plaintext password, callers keep it in a wiped buffer
pub fn encode_entry(entry: &Entry, out: &mut Vec<u8>) {
    push_field(out, KDB3_ENTRY_UUID, &entry.uuid);
    push_u32_field(out, KDB3_ENTRY_GROUP_ID, entry.group_id);
    push_u32_field(out, KDB3_ENTRY_IMAGE_ID, entry.image_id);
    push_str_field(out, KDB3_ENTRY_TITLE, entry.title());
    push_str_field(out, KDB3_ENTRY_URL, entry.url());
    push_str_field(out, KDB3_ENTRY_USERNAME, entry.username());
    if let Some(password) = &entry.password {
        let plain = Zeroizing::new(cstr_bytes(&password.expose()));
        push_field(out, KDB3_ENTRY_PASSWORD, &plain);
    }
    push_str_field(out, KDB3_ENTRY_COMMENT, entry.notes());
    push_date_field(out, KDB3_ENTRY_CREATED, entry.created);
    push_date_field(out, KDB3_ENTRY_MODIFIED, entry.modified);
    push_date_field(out, KDB3_ENTRY_ACCESSED, entry.accessed);
    push_date_field(out, KDB3_ENTRY_EXPIRES, entry.expires);
    push_str_field(out, KDB3_ENTRY_BINARY_DESC, entry.binary_description());
    if let Some(binary) = &entry.binary {
        push_field(out, KDB3_ENTRY_BINARY, binary);
    }
    push_end_field(out, KDB3_ENTRY_END);
}


/// Decodes `groups` group records followed by `entries` entry records.
///
/// One tick per record. Nothing decoded so far escapes a cancellation.
pub fn decode_content(
    data: &[u8],
    groups: u32,
    entries: u32,
    mask: Option<&Arc<Mask>>,
    ticker: &mut Ticker,
) -> Result<Outcome<(Vec<Group>, Vec<Entry>)>> {
    ticker.next_step(groups as u64 + entries as u64, "extract");

    let mut offset = 0;
    let mut out_groups = Vec::new();
    for _ in 0..groups {
        let (group, next) = decode_group(data, offset)?;
        offset = next;
        out_groups.push(group);
        if ticker.tick().is_canceled() {
            return Ok(Outcome::Canceled);
        }
    }

    let mut out_entries = Vec::new();
    for _ in 0..entries {
        let (entry, next) = decode_entry(data, offset, mask)?;
        offset = next;
        out_entries.push(entry);
        if ticker.tick().is_canceled() {
            return Ok(Outcome::Canceled);
        }
    }

    // Not an error per se, but probably indicates corruption
    if offset != data.len() {
        tracing::warn!("{} bytes of trailing data after last record", data.len() - offset);
    }

    Ok(Outcome::Done((out_groups, out_entries)))
}

pub fn encode_content(groups: &[Group], entries: &[Entry], ticker: &mut Ticker) -> Outcome<Zeroizing<Vec<u8>>> {
    ticker.next_step((groups.len() + entries.len()) as u64, "serialize");

    let mut out = Zeroizing::new(Vec::new());
    for group in groups {
        encode_group(group, &mut out);
        if ticker.tick().is_canceled() {
            return Outcome::Canceled;
        }
    }
    for entry in entries {
        encode_entry(entry, &mut out);
        if ticker.tick().is_canceled() {
            return Outcome::Canceled;
        }
    }

    Outcome::Done(out)
}
