//! Message catalog
//!
//! Static table mapping every message kind to its ASCII command label and
//! structural limits. The table is indexed by enum ordinal so lookups are
//! O(1); only label resolution walks the table.

/// Closed set of wire message kinds.
///
/// `Unknown` is the explicit no-match sentinel and never a valid wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum MessageKind {
    Version,
    VerAck,
    Inv,
    Addr,
    Ping,
    Pong,
    GetHeaders,
    Headers,
    GetAddr,
    MemPool,
    Reject,
    GetData,
    Unknown,
}

impl MessageKind {
    /// Every kind, in catalog order
    pub const ALL: [MessageKind; 13] = [
        MessageKind::Version,
        MessageKind::VerAck,
        MessageKind::Inv,
        MessageKind::Addr,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::GetHeaders,
        MessageKind::Headers,
        MessageKind::GetAddr,
        MessageKind::MemPool,
        MessageKind::Reject,
        MessageKind::GetData,
        MessageKind::Unknown,
    ];

    /// ASCII command label for this kind (empty for `Unknown`)
    pub fn label(self) -> &'static str {
        lookup(self).command
    }

    /// Resolve a command label by exact byte comparison.
    ///
    /// Returns `Unknown` when no catalog entry matches.
    pub fn from_label(label: &[u8]) -> MessageKind {
        for kind in Self::ALL {
            if kind != MessageKind::Unknown && kind.label().as_bytes() == label {
                return kind;
            }
        }
        MessageKind::Unknown
    }
}

/// Structural constraints for one message kind
#[derive(Debug, Clone, Copy)]
pub struct MessageDefinition {
    /// ASCII command label as it appears on the wire
    pub command: &'static str,
    /// Whether the payload is a compact-length-prefixed vector
    pub vectorized: bool,
    /// Maximum number of vector items (vectorized kinds only)
    pub max_vector_items: u64,
    /// Fixed per-item byte size (vectorized kinds only)
    pub item_size: u32,
    /// Fixed bytes preceding the vector count (e.g. getheaders version field)
    pub vector_prefix: u32,
    /// Fixed bytes following the vector items (e.g. getheaders stop hash)
    pub vector_suffix: u32,
    /// Minimum total payload length in bytes
    pub min_payload: u32,
    /// Maximum total payload length in bytes
    pub max_payload: u32,
    /// Lowest protocol version that supports this kind
    pub min_version: u32,
    /// Highest protocol version that supports this kind
    pub max_version: u32,
}

const fn scalar(
    command: &'static str,
    min_payload: u32,
    max_payload: u32,
    min_version: u32,
) -> MessageDefinition {
    MessageDefinition {
        command,
        vectorized: false,
        max_vector_items: 0,
        item_size: 0,
        vector_prefix: 0,
        vector_suffix: 0,
        min_payload,
        max_payload,
        min_version,
        max_version: u32::MAX,
    }
}

const fn vectorized(
    command: &'static str,
    item_size: u32,
    max_vector_items: u64,
    vector_prefix: u32,
    vector_suffix: u32,
    min_payload: u32,
    max_payload: u32,
) -> MessageDefinition {
    MessageDefinition {
        command,
        vectorized: true,
        max_vector_items,
        item_size,
        vector_prefix,
        vector_suffix,
        min_payload,
        max_payload,
        min_version: 0,
        max_version: u32::MAX,
    }
}

/// The catalog, in the same order as [`MessageKind`].
///
/// Per-kind maxima are authoritative; the [`MAX_PAYLOAD_SIZE`] ceiling is
/// enforced on top of them and no row may exceed it.
static CATALOG: [MessageDefinition; 13] = [
    scalar("version", 46, 1024, 0),
    scalar("verack", 0, 0, 0),
    vectorized("inv", 36, 50_000, 0, 0, 37, 1_800_003),
    vectorized("addr", 30, 1_000, 0, 0, 31, 30_003),
    scalar("ping", 8, 8, 0),
    scalar("pong", 8, 8, 0),
    vectorized("getheaders", 32, 2_000, 4, 32, 69, 64_039),
    vectorized("headers", 81, 160, 0, 0, 82, 12_961),
    scalar("getaddr", 0, 0, 0),
    scalar("mempool", 0, 0, 60_002),
    scalar("reject", 3, 159, 70_002),
    vectorized("getdata", 36, 50_000, 0, 0, 37, 1_800_003),
    // Unknown sentinel: matches nothing, accepts nothing
    scalar("", 0, 0, u32::MAX),
];

/// O(1) catalog lookup by enum ordinal
pub fn lookup(kind: MessageKind) -> &'static MessageDefinition {
    &CATALOG[kind as usize]
}
