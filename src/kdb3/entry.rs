//! Entry records

use zeroize::{Zeroize, Zeroizing};

use crate::kdb3::date::{self, PackedDate, NEVER_EXPIRES};
use crate::kdb3::format::KDB3_DEFAULT_ENTRY_ICON;
use crate::kdb3::group::{Group, GroupId};
use crate::kdb3::secret::SecretBytes;

pub type EntryId = [u8; 16];

/// A credential record. Which group it lives in is a plain `group_id`
/// reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub(crate) uuid: EntryId,
    pub(crate) group_id: Option<GroupId>,
    pub(crate) image_id: Option<u32>,
    pub(crate) title: Option<String>,
    pub(crate) url: Option<String>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<SecretBytes>,
    pub(crate) notes: Option<String>,
    pub(crate) created: Option<PackedDate>,
    pub(crate) modified: Option<PackedDate>,
    pub(crate) accessed: Option<PackedDate>,
    pub(crate) expires: Option<PackedDate>,
    pub(crate) binary_desc: Option<String>,
    pub(crate) binary: Option<Vec<u8>>,
}

impl Entry {
    pub(crate) fn new(uuid: EntryId, parent: &Group) -> Self {
        let now = PackedDate::now();
        Entry {
            uuid,
            group_id: Some(parent.id()),
            image_id: Some(KDB3_DEFAULT_ENTRY_ICON),
            created: Some(now),
            modified: Some(now),
            accessed: Some(now),
            expires: Some(NEVER_EXPIRES),
            ..Default::default()
        }
    }

    pub fn uuid(&self) -> &EntryId {
        &self.uuid
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn image_id(&self) -> Option<u32> {
        self.image_id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Password bytes as stored in the file, without terminator.
    pub fn password(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.password.as_ref().map(|p| p.expose())
    }

    /// Password decoded as UTF-8, invalid sequences replaced.
    pub fn password_str(&self) -> Option<Zeroizing<String>> {
        self.password
            .as_ref()
            .map(|p| Zeroizing::new(String::from_utf8_lossy(&p.expose()).into_owned()))
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn created(&self) -> Option<PackedDate> {
        self.created
    }

    pub fn modified(&self) -> Option<PackedDate> {
        self.modified
    }

    pub fn accessed(&self) -> Option<PackedDate> {
        self.accessed
    }

    pub fn expires(&self) -> Option<PackedDate> {
        self.expires
    }

    pub fn binary_description(&self) -> Option<&str> {
        self.binary_desc.as_deref()
    }

    pub fn binary(&self) -> Option<&[u8]> {
        self.binary.as_deref()
    }

    pub fn has_attachment(&self) -> bool {
        self.binary.as_ref().map_or(false, |b| !b.is_empty())
    }

    pub fn expired(&self) -> bool {
        date::is_expired(self.expires)
    }

    /// The metadata marker KeePass stores as an entry, not a credential.
    pub fn is_internal(&self) -> bool {
        self.title() == Some("Meta-Info")
            && self.username() == Some("SYSTEM")
            && self.url() == Some("$")
            && self.password.as_ref().map_or(false, |p| p.is_empty())
    }

    // User visible values, used for backup copies. Ids, group and
    // timestamps stay with the copy.
    pub(crate) fn copy_values_from(&mut self, other: &Entry) {
        self.image_id = other.image_id;
        self.title = other.title.clone();
        self.url = other.url.clone();
        self.username = other.username.clone();
        self.password = other.password.clone();
        self.notes = other.notes.clone();
        self.expires = other.expires;
        self.binary_desc = other.binary_desc.clone();
        self.binary = other.binary.clone();
    }

    pub(crate) fn touch(&mut self) {
        self.modified = Some(PackedDate::now());
    }

    pub(crate) fn wipe(&mut self) {
        if let Some(password) = self.password.as_mut() {
            password.zeroize();
        }
        if let Some(binary) = self.binary.as_mut() {
            binary.zeroize();
        }
        self.password = None;
    }
}
