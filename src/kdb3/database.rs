//! The in-memory database
//!
//! Groups live in one vector in tree pre-order. A group's children are the
//! groups right after it whose level is one deeper, up to the next group that
//! is not deeper than the group itself. All tree queries are derived from
//! that order, there are no parent pointers.
//!
//! Field edits go through [`EntryMut`] and [`GroupMut`]. They keep the dirty
//! flag and the backup group up to date.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use zeroize::{Zeroize, Zeroizing};

use crate::kdb3::config::{PasswordEncoding, SearchOptions};
use crate::kdb3::crypto::{encode_password, CompositeKey};
use crate::kdb3::date::PackedDate;
use crate::kdb3::entry::{Entry, EntryId};
use crate::kdb3::error::{Error, Result};
use crate::kdb3::format::{Header, KDB3_BACKUP_GROUP_FLAG, KDB3_ROOT_LEVEL};
use crate::kdb3::group::{Group, GroupId};
use crate::kdb3::progress::{Outcome, Ticker};
use crate::kdb3::secret::{Mask, SecretBytes};
use crate::kdb3::stats::PerformanceStatistics;

/// Name identifying the backup group in files without the backup flag.
pub const LEGACY_BACKUP_GROUP_NAME: &str = "Backup";

pub struct Database {
    header: Header,
    groups: Vec<Group>,
    entries: Vec<Entry>,

    file_name: Option<PathBuf>,
    dirty: bool,
    has_backup_flag: bool,
    tracking: bool,

    master_password: Option<SecretBytes>,
    key_file: Option<SecretBytes>,
    mask: Option<Arc<Mask>>,

    rng: StdRng,
    stats: PerformanceStatistics,
}

impl Database {
    /// A fresh, empty database with random salts.
    pub fn new(obfuscate_secrets: bool) -> Database {
        Self::with_rng(StdRng::from_entropy(), obfuscate_secrets)
    }

    /// Like [`Database::new`] but drawing ids and salts from `rng`.
    pub fn with_rng(mut rng: StdRng, obfuscate_secrets: bool) -> Database {
        let mask = if obfuscate_secrets { Some(Mask::random(&mut rng)) } else { None };
        let mut db = Database {
            header: Header::default(),
            groups: Vec::new(),
            entries: Vec::new(),
            file_name: None,
            dirty: false,
            has_backup_flag: false,
            tracking: true,
            master_password: None,
            key_file: None,
            mask,
            rng,
            stats: PerformanceStatistics::default(),
        };
        db.reseed();
        db
    }

    // Replace the content with freshly decoded records and start tracking
    pub(crate) fn populate(&mut self, header: Header, groups: Vec<Group>, entries: Vec<Entry>) {
        self.header = header;
        self.groups = groups;
        self.entries = entries;
        self.has_backup_flag = self.groups.iter().any(Group::has_backup_flag);
        self.tracking = true;
        self.dirty = false;
    }

    // New salts and IV, done before every save
    pub(crate) fn reseed(&mut self) {
        self.rng.fill_bytes(&mut self.header.master_seed);
        self.rng.fill_bytes(&mut self.header.iv);
        self.rng.fill_bytes(&mut self.header.master_seed2);
    }

    pub(crate) fn mask(&self) -> Option<&Arc<Mask>> {
        self.mask.as_ref()
    }

    pub(crate) fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub(crate) fn set_performance_statistics(&mut self, stats: PerformanceStatistics) {
        self.stats = stats;
    }

    #[cfg(test)]
    pub(crate) fn records_mut(&mut self) -> (&mut Vec<Group>, &mut Vec<Entry>) {
        (&mut self.groups, &mut self.entries)
    }

    pub(crate) fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Wipes all secret material and drops the content. Edits are no longer
    /// tracked afterwards.
    pub fn close(&mut self) {
        self.tracking = false;
        for entry in self.entries.iter_mut() {
            entry.wipe();
        }
        self.entries.clear();
        self.groups.clear();
        if let Some(password) = self.master_password.as_mut() {
            password.zeroize();
        }
        if let Some(key_file) = self.key_file.as_mut() {
            key_file.zeroize();
        }
        self.master_password = None;
        self.key_file = None;
    }


    //
    // Header, credentials and bookkeeping
    //

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn key_rounds(&self) -> u32 {
        self.header.key_rounds
    }

    pub fn set_key_rounds(&mut self, rounds: u32) {
        self.header.key_rounds = rounds;
        self.dirty = true;
    }

    pub fn master_password(&self) -> Option<Zeroizing<String>> {
        self.master_password
            .as_ref()
            .map(|p| Zeroizing::new(String::from_utf8_lossy(&p.expose()).into_owned()))
    }

    pub fn set_master_password(&mut self, password: Option<&str>) {
        self.master_password = password.map(|p| SecretBytes::new(p.as_bytes(), self.mask.as_ref()));
        self.dirty = true;
    }

    pub fn key_file(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.key_file.as_ref().map(SecretBytes::expose)
    }

    pub fn has_key_file(&self) -> bool {
        self.key_file.is_some()
    }

    pub fn set_key_file(&mut self, key: Option<&[u8]>) {
        self.key_file = key.map(|k| SecretBytes::new(k, self.mask.as_ref()));
        self.dirty = true;
    }

    pub fn remove_key_file(&mut self) {
        self.set_key_file(None);
    }

    // The key material for the cipher
    pub(crate) fn composite_key(&self, encoding: PasswordEncoding) -> Result<CompositeKey> {
        let password = self.master_password().map(|p| encode_password(&p, encoding));
        let key_file = self.key_file();
        CompositeKey::new(password.as_deref().map(|p| p.as_slice()), key_file.as_deref().map(|k| k.as_slice()))
    }

    pub fn file_name(&self) -> Option<&Path> {
        self.file_name.as_deref()
    }

    pub fn set_file_name(&mut self, path: impl Into<PathBuf>) {
        self.file_name = Some(path.into());
    }

    /// File name without its directories.
    pub fn database_name(&self) -> Option<String> {
        self.file_name
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn performance_statistics(&self) -> &PerformanceStatistics {
        &self.stats
    }


    //
    // Lookup
    //

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    fn group_index(&self, id: GroupId) -> Option<usize> {
        self.groups.iter().position(|g| g.id == id)
    }

    fn entry_index(&self, uuid: &EntryId) -> Option<usize> {
        self.entries.iter().position(|e| &e.uuid == uuid)
    }

    fn require_group(&self, id: GroupId) -> Result<usize> {
        self.group_index(id)
            .ok_or_else(|| Error::precondition(format!("no group with id {}", id)))
    }

    fn require_entry(&self, uuid: &EntryId) -> Result<usize> {
        self.entry_index(uuid)
            .ok_or_else(|| Error::precondition(format!("no entry with uuid {}", hex::encode(uuid))))
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn entry(&self, uuid: &EntryId) -> Option<&Entry> {
        self.entries.iter().find(|e| &e.uuid == uuid)
    }


    //
    // Tree navigation
    //

    fn child_indices(&self, index: usize) -> Vec<usize> {
        // nothing fits below the deepest level
        let Some(child_level) = self.groups[index].level.checked_add(1) else {
            return Vec::new();
        };
        let mut children = Vec::new();
        for (i, group) in self.groups.iter().enumerate().skip(index + 1) {
            if group.level == child_level {
                children.push(i);
            } else if group.level < child_level {
                break;
            }
        }
        children
    }

    // Closest preceding group one level up
    fn parent_index(&self, index: usize) -> Option<usize> {
        let level = self.groups[index].level;
        if level == KDB3_ROOT_LEVEL {
            return None;
        }
        let i = self.groups[..index].iter().rposition(|g| g.level < level)?;
        (self.groups[i].level == level - 1).then_some(i)
    }

    // Index where a new child of `index` goes: past its last descendant
    fn subtree_end(&self, index: usize) -> usize {
        let level = self.groups[index].level;
        self.groups[index + 1..]
            .iter()
            .position(|g| g.level <= level)
            .map_or(self.groups.len(), |p| index + 1 + p)
    }

    fn root_index(&self, mut index: usize) -> Option<usize> {
        while !self.groups[index].is_root() {
            index = self.parent_index(index)?;
        }
        Some(index)
    }

    pub fn root_groups(&self) -> Vec<&Group> {
        self.groups.iter().filter(|g| g.is_root()).collect()
    }

    pub fn child_groups(&self, id: GroupId) -> Vec<&Group> {
        match self.group_index(id) {
            Some(index) => self.child_indices(index).into_iter().map(|i| &self.groups[i]).collect(),
            None => Vec::new(),
        }
    }

    pub fn parent_group(&self, id: GroupId) -> Option<&Group> {
        let index = self.group_index(id)?;
        self.parent_index(index).map(|i| &self.groups[i])
    }

    /// Groups sharing the parent of `id`, the group itself included.
    pub fn sibling_groups(&self, id: GroupId) -> Vec<&Group> {
        let Some(index) = self.group_index(id) else {
            return Vec::new();
        };
        if self.groups[index].is_root() {
            return self.root_groups();
        }
        match self.parent_index(index) {
            Some(parent) => self.child_indices(parent).into_iter().map(|i| &self.groups[i]).collect(),
            None => vec![&self.groups[index]],
        }
    }

    /// The siblings of the parent of `id`, empty for root groups.
    pub fn parent_groups(&self, id: GroupId) -> Vec<&Group> {
        match self.parent_group(id) {
            Some(parent) => self.sibling_groups(parent.id),
            None => Vec::new(),
        }
    }

    pub fn root_group(&self, id: GroupId) -> Option<&Group> {
        let index = self.group_index(id)?;
        self.root_index(index).map(|i| &self.groups[i])
    }

    /// The group an entry refers to, `None` for orphans.
    pub fn parent_group_of_entry(&self, uuid: &EntryId) -> Option<&Group> {
        let group_id = self.entry(uuid)?.group_id?;
        self.group(group_id)
    }

    pub fn root_group_of_entry(&self, uuid: &EntryId) -> Option<&Group> {
        let parent = self.parent_group_of_entry(uuid)?;
        self.root_group(parent.id)
    }

    /// Slash separated group names from the root down, e.g. `/Internet/Mail`.
    pub fn group_path(&self, id: GroupId) -> Option<String> {
        let mut index = self.group_index(id)?;
        let mut names = vec![self.groups[index].name().unwrap_or_default()];
        while let Some(parent) = self.parent_index(index) {
            names.push(self.groups[parent].name().unwrap_or_default());
            index = parent;
        }
        Some(names.into_iter().rev().fold(String::new(), |path, name| path + "/" + name))
    }

    /// User visible entries of a group.
    pub fn entries_in(&self, id: GroupId) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.group_id == Some(id) && !e.is_internal())
            .collect()
    }

    /// True when the group has neither child groups nor user visible entries.
    pub fn is_empty(&self, id: GroupId) -> bool {
        self.child_groups(id).is_empty() && self.entries_in(id).is_empty()
    }


    //
    // Backup group
    //

    pub fn has_backup_flag(&self) -> bool {
        self.has_backup_flag
    }

    fn is_backup(&self, group: &Group) -> bool {
        if self.has_backup_flag {
            group.has_backup_flag()
        } else {
            group.is_root() && group.name() == Some(LEGACY_BACKUP_GROUP_NAME)
        }
    }

    pub fn is_backup_group(&self, id: GroupId) -> bool {
        self.group(id).map_or(false, |g| self.is_backup(g))
    }

    pub fn is_backup_entry(&self, uuid: &EntryId) -> bool {
        self.root_group_of_entry(uuid).map_or(false, |g| self.is_backup(g))
    }

    pub fn backup_group(&self) -> Option<&Group> {
        self.groups.iter().find(|g| g.is_root() && self.is_backup(g))
    }

    /// Flags a root group as the backup group.
    pub fn set_backup_group(&mut self, id: GroupId) -> Result<()> {
        if self.has_backup_flag {
            return Err(Error::precondition("backup group already exists"));
        }
        let index = self.require_group(id)?;
        let group = &mut self.groups[index];
        if !group.is_root() {
            return Err(Error::precondition("backup group must be a root group"));
        }
        group.flags = Some(group.flags() | KDB3_BACKUP_GROUP_FLAG);
        self.has_backup_flag = true;
        self.dirty = true;
        Ok(())
    }

    // Snapshot the current values of an entry into the backup group
    fn backup(&mut self, index: usize) {
        let Some(backup_id) = self.backup_group().map(|g| g.id) else {
            return;
        };
        let uuid = self.fresh_entry_id();
        let Some(group) = self.group(backup_id) else {
            return;
        };
        let mut copy = Entry::new(uuid, group);
        copy.copy_values_from(&self.entries[index]);
        tracing::debug!("Backing up entry {}", hex::encode(self.entries[index].uuid));
        self.entries.push(copy);
        self.dirty = true;
    }

    fn before_entry_change(&mut self, index: usize) {
        let entry = &self.entries[index];
        if self.tracking && !entry.is_internal() && !self.is_backup_entry(&entry.uuid) {
            self.backup(index);
        }
    }

    fn after_change(&mut self) {
        if self.tracking {
            self.dirty = true;
        }
    }


    //
    // Structural changes
    //

    fn fresh_group_id(&mut self) -> GroupId {
        loop {
            // 0 and 0xFFFFFFFF are reserved by KeePass
            let id: GroupId = self.rng.gen();
            if id != 0 && id != u32::MAX && self.group_index(id).is_none() {
                return id;
            }
        }
    }

    fn fresh_entry_id(&mut self) -> EntryId {
        loop {
            let mut uuid = EntryId::default();
            self.rng.fill_bytes(&mut uuid);
            if self.entry_index(&uuid).is_none() {
                return uuid;
            }
        }
    }

    /// Creates a group with a fresh random id, as a root group when `parent`
    /// is `None`.
    pub fn create_group(&mut self, parent: Option<GroupId>) -> Result<GroupId> {
        let id = self.fresh_group_id();
        self.create_group_with_id(id, parent)
    }

    pub fn create_group_with_id(&mut self, id: GroupId, parent: Option<GroupId>) -> Result<GroupId> {
        if self.group_index(id).is_some() {
            return Err(Error::precondition(format!("group {} already exists", id)));
        }
        match parent {
            None => self.groups.push(Group::new(id, KDB3_ROOT_LEVEL)),
            Some(parent) => {
                let index = self.require_group(parent)?;
                let level = self.groups[index]
                    .level
                    .checked_add(1)
                    .ok_or_else(|| Error::precondition(format!("group {} is at the deepest level", parent)))?;
                let at = self.subtree_end(index);
                self.groups.insert(at, Group::new(id, level));
            }
        }
        self.dirty = true;
        Ok(id)
    }

    pub fn remove_group(&mut self, id: GroupId) -> Result<()> {
        let index = self.require_group(id)?;
        if !self.is_empty(id) {
            return Err(Error::precondition("can not delete group with subgroups/entries"));
        }
        if self.is_backup_group(id) {
            return Err(Error::precondition("can not delete backup group"));
        }
        self.groups.remove(index);
        self.dirty = true;
        Ok(())
    }

    pub fn create_entry(&mut self, parent: GroupId) -> Result<EntryId> {
        self.require_group(parent)?;
        let uuid = self.fresh_entry_id();
        self.create_entry_with_id(uuid, parent)
    }

    pub fn create_entry_with_id(&mut self, uuid: EntryId, parent: GroupId) -> Result<EntryId> {
        let index = self.require_group(parent)?;
        if self.entry_index(&uuid).is_some() {
            return Err(Error::precondition(format!("entry {} already exists", hex::encode(uuid))));
        }
        let entry = Entry::new(uuid, &self.groups[index]);
        self.entries.push(entry);
        self.dirty = true;
        Ok(uuid)
    }

    /// Removes an entry, keeping a copy in the backup group unless it is a
    /// backup entry itself.
    pub fn remove_entry(&mut self, uuid: &EntryId) -> Result<()> {
        let index = self.require_entry(uuid)?;
        if !self.entries[index].is_internal() && !self.is_backup_entry(uuid) {
            self.backup(index);
        }
        let mut removed = self.entries.remove(index);
        removed.wipe();
        self.dirty = true;
        Ok(())
    }

    /// Reassigns the entry to another group. Not a field edit, no backup.
    pub fn move_entry(&mut self, uuid: &EntryId, new_parent: GroupId) -> Result<()> {
        self.require_group(new_parent)?;
        let index = self.require_entry(uuid)?;
        self.entries[index].group_id = Some(new_parent);
        self.dirty = true;
        Ok(())
    }


    //
    // Field changes
    //

    pub fn edit_entry(&mut self, uuid: &EntryId) -> Option<EntryMut<'_>> {
        let index = self.entry_index(uuid)?;
        Some(EntryMut { db: self, index })
    }

    pub fn edit_group(&mut self, id: GroupId) -> Option<GroupMut<'_>> {
        let index = self.group_index(id)?;
        Some(GroupMut { db: self, index })
    }

    /// Records an access. Does not count as a change.
    pub fn access_entry(&mut self, uuid: &EntryId) {
        if let Some(index) = self.entry_index(uuid) {
            self.entries[index].accessed = Some(PackedDate::now());
        }
    }

    pub fn access_group(&mut self, id: GroupId) {
        if let Some(index) = self.group_index(id) {
            self.groups[index].accessed = Some(PackedDate::now());
        }
    }


    //
    // Search
    //

    /// Case insensitive substring search over the fields selected in
    /// `options`. Internal entries never match.
    pub fn search(&self, text: &str, options: &SearchOptions, ticker: &mut Ticker) -> Outcome<Vec<&Entry>> {
        let mut found = Vec::new();
        if text.is_empty() {
            return Outcome::Done(found);
        }
        let needle = text.to_lowercase();
        let matches = |value: Option<&str>| value.map_or(false, |v| v.to_lowercase().contains(&needle));
        let limit = options.result_limit();

        ticker.next_step(self.entries.len() as u64, "search");
        for entry in &self.entries {
            if ticker.tick().is_canceled() {
                return Outcome::Canceled;
            }
            let hit = (options.title && matches(entry.title()))
                || (options.username && matches(entry.username()))
                || (options.url && matches(entry.url()))
                || (options.notes && matches(entry.notes()))
                || (options.binary_description && matches(entry.binary_description()));
            if hit && !entry.is_internal() && (options.include_backup || !self.is_backup_entry(&entry.uuid)) {
                found.push(entry);
                if found.len() >= limit {
                    break;
                }
            }
        }

        Outcome::Done(found)
    }
}


/// Edits one entry. Each setter snapshots the old values into the backup
/// group, applies the change, bumps the modification time and marks the
/// database dirty.
pub struct EntryMut<'a> {
    db: &'a mut Database,
    index: usize,
}

impl EntryMut<'_> {
    fn change<F: FnOnce(&mut Entry)>(&mut self, apply: F) -> &mut Self {
        self.db.before_entry_change(self.index);
        let entry = &mut self.db.entries[self.index];
        apply(entry);
        entry.touch();
        self.db.after_change();
        self
    }

    pub fn entry(&self) -> &Entry {
        &self.db.entries[self.index]
    }

    pub fn set_title(&mut self, title: &str) -> &mut Self {
        self.change(|e| e.title = Some(title.to_string()))
    }

    pub fn set_username(&mut self, username: &str) -> &mut Self {
        self.change(|e| e.username = Some(username.to_string()))
    }

    pub fn set_url(&mut self, url: &str) -> &mut Self {
        self.change(|e| e.url = Some(url.to_string()))
    }

    pub fn set_notes(&mut self, notes: &str) -> &mut Self {
        self.change(|e| e.notes = Some(notes.to_string()))
    }

    pub fn set_password(&mut self, password: &[u8]) -> &mut Self {
        let secret = SecretBytes::new(password, self.db.mask.as_ref());
        self.change(|e| e.password = Some(secret))
    }

    pub fn set_image_id(&mut self, image_id: u32) -> &mut Self {
        self.change(|e| e.image_id = Some(image_id))
    }

    pub fn set_expires(&mut self, expires: Option<PackedDate>) -> &mut Self {
        self.change(|e| e.expires = expires)
    }

    pub fn add_attachment(&mut self, description: &str, data: Vec<u8>) -> &mut Self {
        self.change(|e| {
            e.binary_desc = Some(description.to_string());
            e.binary = Some(data);
        })
    }

    pub fn remove_attachment(&mut self) -> &mut Self {
        self.change(|e| {
            e.binary_desc = None;
            e.binary = None;
        })
    }
}


/// Edits one group. Group edits bump the modification time and mark the
/// database dirty, they are not backed up.
pub struct GroupMut<'a> {
    db: &'a mut Database,
    index: usize,
}

impl GroupMut<'_> {
    fn change<F: FnOnce(&mut Group)>(&mut self, apply: F) -> &mut Self {
        let group = &mut self.db.groups[self.index];
        apply(group);
        group.touch();
        self.db.after_change();
        self
    }

    pub fn group(&self) -> &Group {
        &self.db.groups[self.index]
    }

    pub fn set_name(&mut self, name: &str) -> &mut Self {
        self.change(|g| g.name = Some(name.to_string()))
    }

    pub fn set_image_id(&mut self, image_id: u32) -> &mut Self {
        self.change(|g| g.image_id = Some(image_id))
    }

    pub fn set_expires(&mut self, expires: Option<PackedDate>) -> &mut Self {
        self.change(|g| g.expires = expires)
    }
}
