//
// On-disk format
//

use crate::kdb3::binary::{read_u32, slice, write_u32};
use crate::kdb3::error::{Error, Result};

pub const KDB3_HEADER_LEN: usize = 124;

pub const KDB3_SIGNATURE_1: u32 = 0x9AA2D903;
pub const KDB3_SIGNATURE_2: u32 = 0xB54BFB65;
pub const KDB3_VERSION: u32 = 0x00030002;

pub const KDB3_DEFAULT_KEY_ROUNDS: u32 = 300;


//
// Header
//
// Offsets: 0 sig1, 4 sig2, 8 flags, 12 version, 16 master seed, 32 iv,
// 48 group count, 52 entry count, 56 content hash, 88 master seed 2,
// 120 key rounds.
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub signature: [u32; 2],
    pub flags: AlgorithmFlags,
    pub version: u32,
    pub master_seed: [u8; 16],
    pub iv: [u8; 16],
    pub groups: u32,
    pub entries: u32,
    pub hash: [u8; 32],
    pub master_seed2: [u8; 32],
    pub key_rounds: u32,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            signature: [KDB3_SIGNATURE_1, KDB3_SIGNATURE_2],
            flags: AlgorithmFlags::default(),
            version: KDB3_VERSION,
            master_seed: [0; 16],
            iv: [0; 16],
            groups: 0,
            entries: 0,
            hash: [0; 32],
            master_seed2: [0; 32],
            key_rounds: KDB3_DEFAULT_KEY_ROUNDS,
        }
    }
}

impl Header {
    /// Reads the fixed size header at the start of `data` without judging it,
    /// see [`Header::verify`].
    pub fn decode(data: &[u8]) -> Result<Header> {
        if data.len() < KDB3_HEADER_LEN {
            return Err(Error::MalformedFile("too short"));
        }

        let mut header = Header {
            signature: [read_u32(data, 0)?, read_u32(data, 4)?],
            flags: AlgorithmFlags(read_u32(data, 8)?),
            version: read_u32(data, 12)?,
            groups: read_u32(data, 48)?,
            entries: read_u32(data, 52)?,
            key_rounds: read_u32(data, 120)?,
            ..Default::default()
        };
        header.master_seed.copy_from_slice(slice(data, 16, 16)?);
        header.iv.copy_from_slice(slice(data, 32, 16)?);
        header.hash.copy_from_slice(slice(data, 56, 32)?);
        header.master_seed2.copy_from_slice(slice(data, 88, 32)?);

        Ok(header)
    }

    pub fn verify(&self) -> Result<()> {
        if self.signature != [KDB3_SIGNATURE_1, KDB3_SIGNATURE_2] {
            return Err(Error::MalformedFile("wrong signature"));
        }
        if self.version != KDB3_VERSION {
            return Err(Error::MalformedFile("wrong version"));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; KDB3_HEADER_LEN] {
        let mut out = [0u8; KDB3_HEADER_LEN];
        write_u32(&mut out, 0, self.signature[0]);
        write_u32(&mut out, 4, self.signature[1]);
        write_u32(&mut out, 8, self.flags.0);
        write_u32(&mut out, 12, self.version);
        out[16..32].copy_from_slice(&self.master_seed);
        out[32..48].copy_from_slice(&self.iv);
        write_u32(&mut out, 48, self.groups);
        write_u32(&mut out, 52, self.entries);
        out[56..88].copy_from_slice(&self.hash);
        out[88..120].copy_from_slice(&self.master_seed2);
        write_u32(&mut out, 120, self.key_rounds);
        out
    }
}


//
// Algorithm flags
//

pub const KDB3_FLAG_SHA2: u32 = 1;
pub const KDB3_FLAG_AES: u32 = 2;
pub const KDB3_FLAG_ARCFOUR: u32 = 4;
pub const KDB3_FLAG_TWOFISH: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlgorithmFlags(pub u32);

impl Default for AlgorithmFlags {
    fn default() -> Self {
        AlgorithmFlags(KDB3_FLAG_SHA2 | KDB3_FLAG_AES)
    }
}

impl AlgorithmFlags {
    pub fn is_sha2(self) -> bool { self.0 & KDB3_FLAG_SHA2 != 0 }
    pub fn is_aes(self) -> bool { self.0 & KDB3_FLAG_AES != 0 }
    pub fn is_arcfour(self) -> bool { self.0 & KDB3_FLAG_ARCFOUR != 0 }
    pub fn is_twofish(self) -> bool { self.0 & KDB3_FLAG_TWOFISH != 0 }
}


// Group fields
pub const KDB3_GROUP_IGNORE     : u16 = 0x0000;
pub const KDB3_GROUP_ID         : u16 = 0x0001;
pub const KDB3_GROUP_TITLE      : u16 = 0x0002;
pub const KDB3_GROUP_CREATED    : u16 = 0x0003;
pub const KDB3_GROUP_MODIFIED   : u16 = 0x0004;
pub const KDB3_GROUP_ACCESSED   : u16 = 0x0005;
pub const KDB3_GROUP_EXPIRES    : u16 = 0x0006;
pub const KDB3_GROUP_IMAGE_ID   : u16 = 0x0007;
pub const KDB3_GROUP_LEVEL      : u16 = 0x0008;
pub const KDB3_GROUP_FLAGS      : u16 = 0x0009;
pub const KDB3_GROUP_END        : u16 = 0xFFFF;

// Entry fields
pub const KDB3_ENTRY_IGNORE      : u16 = 0x0000;
pub const KDB3_ENTRY_UUID        : u16 = 0x0001;
pub const KDB3_ENTRY_GROUP_ID    : u16 = 0x0002;
pub const KDB3_ENTRY_IMAGE_ID    : u16 = 0x0003;
pub const KDB3_ENTRY_TITLE       : u16 = 0x0004;
pub const KDB3_ENTRY_URL         : u16 = 0x0005;
pub const KDB3_ENTRY_USERNAME    : u16 = 0x0006;
pub const KDB3_ENTRY_PASSWORD    : u16 = 0x0007;
pub const KDB3_ENTRY_COMMENT     : u16 = 0x0008;
pub const KDB3_ENTRY_CREATED     : u16 = 0x0009;
pub const KDB3_ENTRY_MODIFIED    : u16 = 0x000A;
pub const KDB3_ENTRY_ACCESSED    : u16 = 0x000B;
pub const KDB3_ENTRY_EXPIRES     : u16 = 0x000C;
pub const KDB3_ENTRY_BINARY_DESC : u16 = 0x000D;
pub const KDB3_ENTRY_BINARY      : u16 = 0x000E;
pub const KDB3_ENTRY_END         : u16 = 0xFFFF;

// Size of the type + length prefix of every field
pub const KDB3_FIELD_PREFIX_LEN: usize = 6;

// Group internal flag reserved for the backup group
pub const KDB3_BACKUP_GROUP_FLAG: u32 = 4096;

pub const KDB3_ROOT_LEVEL: u16 = 0;
pub const KDB3_DEFAULT_ENTRY_ICON: u32 = 0;
pub const KDB3_DEFAULT_GROUP_ICON: u32 = 48;
