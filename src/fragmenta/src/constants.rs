//! Magic numbers, version bounds, tag ranges, and the small fixed
//! vocabularies (flags, block types, comparison/logic operators) used
//! throughout the on-disk format.

/// Magic bytes for the current format epoch: `"FRAG"`.
pub const MAGIC_FRAG: [u8; 4] = *b"FRAG";
/// Magic bytes accepted for the legacy format epoch: `"DeFS"`.
pub const MAGIC_DEFS: [u8; 4] = *b"DeFS";

/// Lowest version this crate will open.
pub const MIN_SUPPORTED_VERSION: u16 = 0x0100;
/// Version written by `Store::create` and the newest version this crate understands.
pub const CURRENT_VERSION: u16 = 0x0100;

/// Reserved, fixed-width header size. Region writers must resume at this offset.
pub const HEADER_SIZE: u64 = 256;

/// `MetadataOffset` written by a freshly created store.
pub const DEFAULT_METADATA_OFFSET: u64 = HEADER_SIZE;

/// On-disk size of one block header (§3.3).
pub const BLOCK_HEADER_SIZE: u64 = 64;

/// Byte length of a block payload checksum (MD5).
pub const CHECKSUM_SIZE: usize = 16;

/// Upper bound (inclusive) of the system tag namespace.
pub const SYSTEM_TAG_MAX: u16 = 0x00FF;
/// Upper bound (inclusive) of the application-reserved tag namespace.
pub const APPLICATION_TAG_MAX: u16 = 0x0FFF;
/// Sentinel tag value never assignable to a real entry.
pub const USER_TAG_SENTINEL_MAX: u16 = 0xFFFE;

/// System tag: creation timestamp of the store (protected).
pub const TAG_CREATION_TIME: u16 = 0x0001;
/// System tag: format version the store was created with (protected).
pub const TAG_VERSION: u16 = 0x0002;
/// System tag: fragmenta type identifier (protected).
pub const TAG_FRAGMENTA_TYPE: u16 = 0x0003;
/// System tag: last-modified timestamp, updated on every `Commit`.
pub const TAG_LAST_MODIFIED: u16 = 0x0004;

/// Tags that `MetadataManager::delete` refuses to remove.
pub const PROTECTED_TAGS: [u16; 3] = [TAG_CREATION_TIME, TAG_VERSION, TAG_FRAGMENTA_TYPE];

/// Returns true if `tag` falls in the user-defined namespace (`0x1000..=0xFFFE`).
pub fn is_user_tag(tag: u16) -> bool {
    (0x1000..=USER_TAG_SENTINEL_MAX).contains(&tag)
}

/// Storage mode codes (`StoreHeader::storage_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageMode {
    Container = 1,
    Directory = 2,
    Hybrid = 3,
}

impl StorageMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Container),
            2 => Some(Self::Directory),
            3 => Some(Self::Hybrid),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Header flag bits (§3.1 `Flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u16 {
        const COMPRESSED = 0b0000_0001;
        const ENCRYPTED  = 0b0000_0010;
        const READ_ONLY  = 0b0000_0100;
        const INDEXED    = 0b0000_1000;
        const HAS_DELTA  = 0b0001_0000;
        const TEMP       = 0b0010_0000;
    }
}

bitflags::bitflags! {
    /// Block flag bits (§3.3 `flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        const COMPRESSED       = 0b0000_0001;
        const ENCRYPTED        = 0b0000_0010;
        const CHECKSUM_PRESENT = 0b0000_0100;
    }
}

/// Block type codes (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Normal = 0,
    Metadata = 1,
    Index = 2,
    Delta = 3,
    Xor = 4,
    Compressed = 5,
    Encrypted = 6,
    Indirect = 7,
    System = 8,
}

impl BlockType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use BlockType::*;
        let kind = match value {
            0 => Normal,
            1 => Metadata,
            2 => Index,
            3 => Delta,
            4 => Xor,
            5 => Compressed,
            6 => Encrypted,
            7 => Indirect,
            8 => System,
            _ => return None,
        };
        Some(kind)
    }
}

/// Query condition comparison operator (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
}

/// Logic used to combine the conditions of a `MetadataQuery` (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
}

/// Sort direction for `MetadataQuery::sort_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

