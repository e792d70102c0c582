//! Creating, loading and saving databases
//!
//! The [`Manager`] ties the record codec, the content cipher and the model
//! together and talks to the file system through a [`FileIo`].
//!
//! Load pipeline: header, key derivation, decryption, content hash check,
//! record extraction. Saving runs it backwards with fresh salts. Every step
//! polls the optional [`Progress`] and a cancel surfaces as
//! [`Outcome::Canceled`].

use std::path::Path;
use std::time::Instant;

use rand::rngs::StdRng;
use zeroize::Zeroizing;

use crate::kdb3::codec;
use crate::kdb3::config::Config;
use crate::kdb3::crypto::{self, content_hash, KEY_FILE_LEN};
use crate::kdb3::database::Database;
use crate::kdb3::entry::{Entry, EntryId};
use crate::kdb3::error::{Error, Result};
use crate::kdb3::format::{Header, KDB3_HEADER_LEN};
use crate::kdb3::io::{FileIo, FsIo};
use crate::kdb3::progress::{done, Outcome, Progress, Ticker};
use crate::kdb3::stats::PerformanceStatistics;

const KEY_FILE_HEX_LEN: u64 = 2 * KEY_FILE_LEN as u64;

pub struct Manager<F: FileIo = FsIo> {
    io: F,
    config: Config,
}

impl Manager<FsIo> {
    pub fn new(config: Config) -> Self {
        Manager { io: FsIo, config }
    }
}

impl Default for Manager<FsIo> {
    fn default() -> Self {
        Manager::new(Config::default())
    }
}

// Hash check of freshly decrypted content
fn verify_content(plain: &[u8], expected: &[u8; 32], ticker: &mut Ticker) -> Result<Outcome<()>> {
    let hash = match content_hash(plain, ticker) {
        Outcome::Done(hash) => hash,
        Outcome::Canceled => return Ok(Outcome::Canceled),
    };
    if &hash != expected {
        tracing::warn!("Content hash mismatch, wrong key or corrupted file");
        return Err(Error::ContentIntegrity);
    }
    Ok(Outcome::Done(()))
}

impl<F: FileIo> Manager<F> {
    pub fn with_io(io: F, config: Config) -> Self {
        Manager { io, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reads key material from a key file.
    ///
    /// A 32 byte file is the key itself and a 64 byte file holds it hex
    /// encoded. Anything of at least 64 bytes is hashed. Shorter files are
    /// rejected.
    pub fn load_key_file(&self, path: &Path, ticker: &mut Ticker) -> Result<Outcome<Zeroizing<Vec<u8>>>> {
        if let Some(key) = self.direct_key(path)? {
            return Ok(Outcome::Done(key));
        }
        let hash = done!(self.io.content_hash(path, self.config.key_file_chunk_size, ticker));
        Ok(Outcome::Done(Zeroizing::new(hash.to_vec())))
    }

    // Key stored in the file as is, `None` when the file has to be hashed
    fn direct_key(&self, path: &Path) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let size = self.io.file_size(path)?;
        if size == KEY_FILE_LEN as u64 {
            return Ok(Some(Zeroizing::new(self.io.load_binary(path)?)));
        }
        if size < KEY_FILE_HEX_LEN {
            return Err(Error::precondition(format!("key file too short ({} bytes)", size)));
        }
        if size == KEY_FILE_HEX_LEN {
            let text = Zeroizing::new(self.io.load_binary(path)?);
            let mut key = Zeroizing::new(vec![0u8; KEY_FILE_LEN]);
            if hex::decode_to_slice(&*text, &mut key).is_ok() {
                return Ok(Some(key));
            }
            tracing::debug!("Key file is not hex encoded, hashing it");
        }
        Ok(None)
    }

    // Hashing a key file counts as one extra step of `steps`
    fn read_key_file(
        &self,
        key_file: Option<&Path>,
        steps: u32,
        ticker: &mut Ticker,
    ) -> Result<Outcome<Option<Zeroizing<Vec<u8>>>>> {
        let Some(path) = key_file else {
            ticker.set_steps(steps);
            return Ok(Outcome::Done(None));
        };
        if let Some(key) = self.direct_key(path)? {
            ticker.set_steps(steps);
            return Ok(Outcome::Done(Some(key)));
        }
        ticker.set_steps(steps + 1);
        let hash = done!(self.io.content_hash(path, self.config.key_file_chunk_size, ticker));
        Ok(Outcome::Done(Some(Zeroizing::new(hash.to_vec()))))
    }

    /// A new, empty database to be saved at `name`.
    pub fn create(
        &self,
        name: &Path,
        password: Option<&str>,
        key_file: Option<&Path>,
        progress: Option<&mut dyn Progress>,
    ) -> Result<Outcome<Database>> {
        let db = Database::new(self.config.obfuscate_secrets);
        self.create_from(db, name, password, key_file, progress)
    }

    /// Like [`Manager::create`], drawing ids and salts from `rng`.
    pub fn create_with_rng(
        &self,
        rng: StdRng,
        name: &Path,
        password: Option<&str>,
        key_file: Option<&Path>,
        progress: Option<&mut dyn Progress>,
    ) -> Result<Outcome<Database>> {
        let db = Database::with_rng(rng, self.config.obfuscate_secrets);
        self.create_from(db, name, password, key_file, progress)
    }

    fn create_from(
        &self,
        mut db: Database,
        name: &Path,
        password: Option<&str>,
        key_file: Option<&Path>,
        progress: Option<&mut dyn Progress>,
    ) -> Result<Outcome<Database>> {
        if password.is_none() && key_file.is_none() {
            return Err(Error::precondition("must provide master password or key file"));
        }
        let mut ticker = Ticker::new(progress);
        let key = done!(self.read_key_file(key_file, 0, &mut ticker));

        db.set_file_name(name);
        db.set_master_password(password);
        db.set_key_file(key.as_deref().map(|k| k.as_slice()));
        db.set_key_rounds(self.config.key_rounds);
        db.mark_saved();
        Ok(Outcome::Done(db))
    }

    pub fn load(
        &self,
        path: &Path,
        password: Option<&str>,
        key_file: Option<&Path>,
        progress: Option<&mut dyn Progress>,
    ) -> Result<Outcome<Database>> {
        if password.is_none() && key_file.is_none() {
            return Err(Error::precondition("must provide master password or key file"));
        }
        let mut ticker = Ticker::new(progress);
        let key = done!(self.read_key_file(key_file, 4, &mut ticker));

        let start = Instant::now();
        let data = self.io.load_binary(path)?;
        let load_time = start.elapsed();
        tracing::debug!("Read {} bytes from {:?}", data.len(), path);

        let mut db = done!(self.decode(&data, password, key.as_deref().map(|k| k.as_slice()), &mut ticker));
        db.set_file_name(path);

        let mut stats = db.performance_statistics().clone();
        stats.load_time = load_time;
        db.set_performance_statistics(stats);
        Ok(Outcome::Done(db))
    }

    /// Opens a database from the raw file bytes.
    pub fn import(
        &self,
        data: &[u8],
        password: Option<&str>,
        key: Option<&[u8]>,
        progress: Option<&mut dyn Progress>,
    ) -> Result<Outcome<Database>> {
        let mut ticker = Ticker::new(progress);
        ticker.set_steps(4);
        self.decode(data, password, key, &mut ticker)
    }

    fn decode(
        &self,
        data: &[u8],
        password: Option<&str>,
        key: Option<&[u8]>,
        ticker: &mut Ticker,
    ) -> Result<Outcome<Database>> {
        let header = Header::decode(data)?;
        header.verify()?;
        let alg = crypto::select(header.flags)?;
        tracing::debug!(
            "Header: {} groups, {} entries, {} key rounds, {}",
            header.groups,
            header.entries,
            header.key_rounds,
            alg.name()
        );

        let mut db = Database::new(self.config.obfuscate_secrets);
        db.set_master_password(password);
        db.set_key_file(key);
        let composite = db.composite_key(self.config.password_encoding)?;

        let mut stats = PerformanceStatistics::default();
        let encrypted = &data[KDB3_HEADER_LEN..];
        stats.encrypted_content_len = encrypted.len();
        let plain = done!(alg.decrypt(encrypted, &header, &composite, &mut stats, ticker));
        stats.plain_content_len = plain.len();

        let start = Instant::now();
        done!(verify_content(&plain, &header.hash, ticker));
        stats.content_hash_time = start.elapsed();

        let start = Instant::now();
        let (groups, entries) = done!(codec::decode_content(&plain, header.groups, header.entries, db.mask(), ticker));
        stats.content_extraction_time = start.elapsed();
        tracing::debug!(
            "Key transform {:?}, decryption {:?}, extraction {:?}",
            stats.key_transform_time,
            stats.decryption_time,
            stats.content_extraction_time
        );

        db.populate(header, groups, entries);
        db.set_performance_statistics(stats);
        Ok(Outcome::Done(db))
    }

    /// Serializes and encrypts `db` with the salts currently in its header.
    ///
    /// Returns the header as written along with the file bytes.
    fn encode(&self, db: &Database, ticker: &mut Ticker) -> Result<Outcome<(Header, Vec<u8>)>> {
        let mut header = db.header().clone();
        let alg = crypto::select(header.flags)?;
        let composite = db.composite_key(self.config.password_encoding)?;

        let plain = match codec::encode_content(db.groups(), db.entries(), ticker) {
            Outcome::Done(plain) => plain,
            Outcome::Canceled => return Ok(Outcome::Canceled),
        };
        let encrypted = done!(alg.encrypt(&plain, &header, &composite, ticker));
        let hash = match content_hash(&plain, ticker) {
            Outcome::Done(hash) => hash,
            Outcome::Canceled => return Ok(Outcome::Canceled),
        };

        header.groups = db.num_groups() as u32;
        header.entries = db.num_entries() as u32;
        header.hash = hash;

        let mut out = Vec::with_capacity(KDB3_HEADER_LEN + encrypted.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&encrypted);
        Ok(Outcome::Done((header, out)))
    }

    /// The file bytes of `db` as they would be saved, without new salts.
    pub fn export(&self, db: &Database, progress: Option<&mut dyn Progress>) -> Result<Outcome<Vec<u8>>> {
        let mut ticker = Ticker::new(progress);
        ticker.set_steps(4);
        let (_, data) = done!(self.encode(db, &mut ticker));
        Ok(Outcome::Done(data))
    }

    /// Saves `db` to `path` with fresh salts and IV and clears its dirty flag.
    pub fn save(&self, db: &mut Database, path: &Path, progress: Option<&mut dyn Progress>) -> Result<Outcome<()>> {
        let mut ticker = Ticker::new(progress);
        ticker.set_steps(4);

        db.reseed();
        let (header, data) = done!(self.encode(db, &mut ticker));
        self.io.save_binary(path, &data)?;

        *db.header_mut() = header;
        db.set_file_name(path);
        db.mark_saved();
        tracing::info!("Saved {} groups and {} entries to {:?}", db.num_groups(), db.num_entries(), path);
        Ok(Outcome::Done(()))
    }

    /// Loads key material from `path` and makes it the database's key file.
    pub fn set_key_file(&self, db: &mut Database, path: &Path, progress: Option<&mut dyn Progress>) -> Result<Outcome<()>> {
        let mut ticker = Ticker::new(progress);
        let key = done!(self.load_key_file(path, &mut ticker));
        db.set_key_file(Some(key.as_slice()));
        Ok(Outcome::Done(()))
    }

    /// Writes the attachment of `entry` into `folder`, named by its
    /// description.
    pub fn save_attachment(&self, entry: &Entry, folder: &Path) -> Result<()> {
        let (Some(description), Some(data)) = (entry.binary_description(), entry.binary()) else {
            return Err(Error::precondition("entry has no attachment"));
        };
        let name = Path::new(description)
            .file_name()
            .ok_or_else(|| Error::precondition(format!("invalid attachment name {:?}", description)))?;
        self.io.save_binary(&folder.join(name), data)
    }

    /// Attaches the file at `path` to an entry, described by its file name.
    pub fn add_attachment(&self, db: &mut Database, uuid: &EntryId, path: &Path) -> Result<()> {
        let description = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::precondition(format!("invalid attachment path {:?}", path)))?;
        let data = self.io.load_binary(path)?;
        let mut entry = db
            .edit_entry(uuid)
            .ok_or_else(|| Error::precondition(format!("no entry with uuid {}", hex::encode(uuid))))?;
        entry.add_attachment(&description, data);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdb3::date::PackedDate;
    use crate::kdb3::progress::tests::CancelAfter;
    use crate::kdb3::progress::ProgressMonitor;
    use rand::SeedableRng;
    use std::fs;

    fn fast_config() -> Config {
        Config { key_rounds: 50, ..Default::default() }
    }

    fn sample_db(manager: &Manager) -> Database {
        let mut db = manager
            .create_with_rng(StdRng::seed_from_u64(9), Path::new("test.kdb"), Some("TestMasterPassword"), None, None)
            .unwrap()
            .done()
            .unwrap();
        let group = db.create_group_with_id(1, None).unwrap();
        db.edit_group(group).unwrap().set_name("General");
        let uuid = db.create_entry_with_id(core::array::from_fn(|i| i as u8), group).unwrap();
        db.edit_entry(&uuid)
            .unwrap()
            .set_title("Mail")
            .set_username("joe")
            .set_password(b"secret");
        db
    }

    // Pins every time dependent value so the output only depends on inputs
    fn pin_timestamps(db: &mut Database) {
        let date = Some(PackedDate::new(2010, 1, 1, 0, 0, 0));
        let (groups, entries) = db.records_mut();
        for group in groups.iter_mut() {
            group.created = date;
            group.modified = date;
            group.accessed = date;
        }
        for entry in entries.iter_mut() {
            entry.created = date;
            entry.modified = date;
            entry.accessed = date;
        }
    }

    #[test]
    fn test_import_export_roundtrip() {
        let manager = Manager::new(fast_config());
        let db = sample_db(&manager);
        let data = manager.export(&db, None).unwrap().done().unwrap();
        assert_eq!(&data[..4], &[0x03, 0xD9, 0xA2, 0x9A]);
        assert_eq!((data.len() - KDB3_HEADER_LEN) % 16, 0);

        let loaded = manager.import(&data, Some("TestMasterPassword"), None, None).unwrap().done().unwrap();
        assert_eq!(loaded.groups(), db.groups());
        assert_eq!(loaded.entries(), db.entries());
        assert_eq!(loaded.key_rounds(), 50);
        assert!(!loaded.is_dirty());
        assert_eq!(loaded.performance_statistics().encrypted_content_len, data.len() - KDB3_HEADER_LEN);
    }

    #[test]
    fn test_fixed_inputs_give_fixed_ciphertext() {
        let manager = Manager::new(Config { key_rounds: 6000, ..Default::default() });
        let mut first = sample_db(&manager);
        let mut second = sample_db(&manager);
        pin_timestamps(&mut first);
        pin_timestamps(&mut second);
        assert_eq!(first.header(), second.header());

        let a = manager.export(&first, None).unwrap().done().unwrap();
        let b = manager.export(&second, None).unwrap().done().unwrap();
        assert_eq!(a, b);

        second.header_mut().iv[0] ^= 1;
        let c = manager.export(&second, None).unwrap().done().unwrap();
        assert_ne!(a[KDB3_HEADER_LEN..], c[KDB3_HEADER_LEN..]);
    }

    #[test]
    fn test_wrong_password() {
        let manager = Manager::new(fast_config());
        let data = manager.export(&sample_db(&manager), None).unwrap().done().unwrap();
        assert!(matches!(
            manager.import(&data, Some("TestMasterPasswore"), None, None),
            Err(Error::ContentIntegrity)
        ));
    }

    #[test]
    fn test_flipped_plaintext_fails_hash_check() {
        let plain = b"some decrypted content".to_vec();
        let hash = crypto::sha256(&plain);
        assert!(verify_content(&plain, &hash, &mut Ticker::none()).unwrap().done().is_some());
        for i in 0..plain.len() {
            let mut flipped = plain.clone();
            flipped[i] ^= 0x01;
            assert!(matches!(verify_content(&flipped, &hash, &mut Ticker::none()), Err(Error::ContentIntegrity)));
        }
    }

    #[test]
    fn test_malformed_files() {
        let manager = Manager::new(fast_config());
        let data = manager.export(&sample_db(&manager), None).unwrap().done().unwrap();

        assert!(matches!(
            manager.import(&data[..100], Some("x"), None, None),
            Err(Error::MalformedFile("too short"))
        ));

        let mut bad = data.clone();
        bad[12] = 0x01;
        assert!(matches!(manager.import(&bad, Some("x"), None, None), Err(Error::MalformedFile("wrong version"))));

        let mut bad = data.clone();
        bad[8] = 0x09;
        assert!(matches!(manager.import(&bad, Some("x"), None, None), Err(Error::UnsupportedAlgorithm(9))));

        assert!(matches!(
            manager.import(&data[..KDB3_HEADER_LEN + 3], Some("TestMasterPassword"), None, None),
            Err(Error::MalformedFile(_))
        ));
    }

    #[test]
    fn test_import_cancels() {
        let manager = Manager::new(fast_config());
        let data = manager.export(&sample_db(&manager), None).unwrap().done().unwrap();
        for limit in [0, 10, 49, 50, 51] {
            let mut cancel = CancelAfter::new(limit);
            let out = manager.import(&data, Some("TestMasterPassword"), None, Some(&mut cancel)).unwrap();
            assert!(out.is_canceled());
        }
    }

    #[test]
    fn test_key_file_formats() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(fast_config());

        let raw = dir.path().join("raw.key");
        fs::write(&raw, [0x11u8; 32]).unwrap();
        let key = manager.load_key_file(&raw, &mut Ticker::none()).unwrap().done().unwrap();
        assert_eq!(&*key, &[0x11u8; 32]);

        let hexed = dir.path().join("hex.key");
        fs::write(&hexed, "ab".repeat(32)).unwrap();
        let key = manager.load_key_file(&hexed, &mut Ticker::none()).unwrap().done().unwrap();
        assert_eq!(&*key, &[0xABu8; 32]);

        let not_hex = dir.path().join("text.key");
        fs::write(&not_hex, "z".repeat(64)).unwrap();
        let key = manager.load_key_file(&not_hex, &mut Ticker::none()).unwrap().done().unwrap();
        assert_eq!(&key[..], &crypto::sha256("z".repeat(64).as_bytes())[..]);

        let big = dir.path().join("big.key");
        let content = vec![0x42u8; 10_000];
        fs::write(&big, &content).unwrap();
        let key = manager.load_key_file(&big, &mut Ticker::none()).unwrap().done().unwrap();
        assert_eq!(&key[..], &crypto::sha256(&content)[..]);

        let short = dir.path().join("short.key");
        fs::write(&short, [1u8; 40]).unwrap();
        assert!(matches!(
            manager.load_key_file(&short, &mut Ticker::none()),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_create_requires_credentials() {
        let manager = Manager::new(fast_config());
        assert!(matches!(
            manager.create(Path::new("x.kdb"), None, None, None),
            Err(Error::Precondition(_))
        ));
        let db = manager.create(Path::new("dir/x.kdb"), Some("pw"), None, None).unwrap().done().unwrap();
        assert_eq!(db.database_name().as_deref(), Some("x.kdb"));
        assert_eq!(db.key_rounds(), 50);
        assert!(!db.is_dirty());
    }

    // Keeps files in memory
    #[derive(Default)]
    struct MemIo {
        files: std::cell::RefCell<std::collections::HashMap<std::path::PathBuf, Vec<u8>>>,
    }

    impl FileIo for MemIo {
        fn load_binary(&self, path: &Path) -> Result<Vec<u8>> {
            self.files
                .borrow()
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound).into())
        }

        fn save_binary(&self, path: &Path, data: &[u8]) -> Result<()> {
            self.files.borrow_mut().insert(path.to_path_buf(), data.to_vec());
            Ok(())
        }

        fn delete(&self, path: &Path) -> Result<()> {
            self.files.borrow_mut().remove(path);
            Ok(())
        }

        fn file_size(&self, path: &Path) -> Result<u64> {
            Ok(self.load_binary(path)?.len() as u64)
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.borrow().contains_key(path)
        }

        fn content_hash(&self, path: &Path, _chunk_size: usize, _ticker: &mut Ticker) -> Result<Outcome<[u8; 32]>> {
            Ok(Outcome::Done(crypto::sha256(&self.load_binary(path)?)))
        }
    }

    #[test]
    fn test_custom_file_io() {
        let manager = Manager::with_io(MemIo::default(), fast_config());
        let path = Path::new("mem/test.kdb");
        let mut db = manager.create(path, Some("pw"), None, None).unwrap().done().unwrap();
        let group = db.create_group(None).unwrap();
        db.create_entry(group).unwrap();
        manager.save(&mut db, path, None).unwrap().done().unwrap();
        assert!(manager.io.exists(path));

        let loaded = manager.load(path, Some("pw"), None, None).unwrap().done().unwrap();
        assert_eq!(loaded.entries(), db.entries());
        assert_eq!(loaded.file_name(), Some(path));

        manager.io.delete(path).unwrap();
        assert!(matches!(manager.load(path, Some("pw"), None, None), Err(Error::Io(_))));
    }

    #[test]
    fn test_load_progress_reaches_end() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(fast_config());
        let raw = dir.path().join("raw.key");
        fs::write(&raw, [0x11u8; 32]).unwrap();
        let big = dir.path().join("big.key");
        fs::write(&big, vec![0x42u8; 5000]).unwrap();

        for key in [None, Some(raw.as_path()), Some(big.as_path())] {
            let path = dir.path().join("db.kdb");
            let mut db = manager.create(&path, Some("pw"), key, None).unwrap().done().unwrap();
            db.create_group(None).unwrap();
            manager.save(&mut db, &path, None).unwrap().done().unwrap();

            let mut monitor = ProgressMonitor::default();
            manager.load(&path, Some("pw"), key, Some(&mut monitor)).unwrap().done().unwrap();
            assert_eq!(monitor.progress(), 100, "key file {:?}", key);
        }
    }

    #[test]
    fn test_deepest_level_group_from_file() {
        let manager = Manager::new(fast_config());
        let mut db = sample_db(&manager);
        db.records_mut().0.push(crate::kdb3::group::Group::new(7, u16::MAX));
        let data = manager.export(&db, None).unwrap().done().unwrap();

        let mut loaded = manager.import(&data, Some("TestMasterPassword"), None, None).unwrap().done().unwrap();
        assert_eq!(loaded.group(7).unwrap().level(), u16::MAX);
        assert!(loaded.child_groups(7).is_empty());
        assert!(loaded.sibling_groups(7).len() == 1);
        assert!(matches!(loaded.create_group(Some(7)), Err(Error::Precondition(_))));
        loaded.remove_group(7).unwrap();
    }
}
