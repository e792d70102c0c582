//! Group records

use crate::kdb3::date::{self, PackedDate, NEVER_EXPIRES};
use crate::kdb3::format::{KDB3_BACKUP_GROUP_FLAG, KDB3_DEFAULT_GROUP_ICON, KDB3_ROOT_LEVEL};

pub type GroupId = u32;

/// A group of a KDB database.
///
/// Groups carry no parent pointer. Their position in the database's group
/// sequence together with `level` defines the tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Group {
    pub(crate) id: GroupId,
    pub(crate) name: Option<String>,
    pub(crate) created: Option<PackedDate>,
    pub(crate) modified: Option<PackedDate>,
    pub(crate) accessed: Option<PackedDate>,
    pub(crate) expires: Option<PackedDate>,
    pub(crate) image_id: Option<u32>,
    pub(crate) level: u16,
    pub(crate) flags: Option<u32>,
}

impl Group {
    pub(crate) fn new(id: GroupId, level: u16) -> Self {
        let now = PackedDate::now();
        Group {
            id,
            name: None,
            created: Some(now),
            modified: Some(now),
            accessed: Some(now),
            expires: Some(NEVER_EXPIRES),
            image_id: Some(KDB3_DEFAULT_GROUP_ICON),
            level,
            flags: Some(0),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
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

    pub fn image_id(&self) -> Option<u32> {
        self.image_id
    }

    /// Tree depth, 0 for root groups.
    pub fn level(&self) -> u16 {
        self.level
    }

    pub fn flags(&self) -> u32 {
        self.flags.unwrap_or(0)
    }

    pub fn is_root(&self) -> bool {
        self.level == KDB3_ROOT_LEVEL
    }

    pub fn has_backup_flag(&self) -> bool {
        self.flags() & KDB3_BACKUP_GROUP_FLAG != 0
    }

    pub fn expired(&self) -> bool {
        date::is_expired(self.expires)
    }

    pub(crate) fn touch(&mut self) {
        self.modified = Some(PackedDate::now());
    }
}
