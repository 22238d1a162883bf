//! Core types: addressing, identifiers, flags and operation codes

use std::fmt;

use serde::Serialize;

// ============= Operation Flags =============

bitflags::bitflags! {
    /// Per-batch operation flags (LIBRADOS_OPERATION_* in librados.h)
    ///
    /// `ORDERED` is local to this core: it turns a batch into an
    /// all-or-nothing unit where the first failing sub-operation aborts the
    /// rest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OperationFlags: u32 {
        /// Balance reads among replicas
        const BALANCE_READS = 1;
        /// Read from nearby replica, if any
        const LOCALIZE_READS = 2;
        /// Order reads after in-flight writes
        const ORDER_READS_WRITES = 4;
        /// Ignore cache logic
        const IGNORE_CACHE = 8;
        /// Skip object-level rw locks
        const SKIPRWLOCKS = 16;
        /// Ignore pool overlay
        const IGNORE_OVERLAY = 32;
        /// Send even if the cluster is full, fail with EDQUOT/ENOSPC
        const FULL_TRY = 64;
        /// Write even if the cluster is full
        const FULL_FORCE = 128;
        /// Ignore redirects
        const IGNORE_REDIRECT = 256;
        /// Fail if snap context is out of order
        const ORDERSNAP = 512;
        /// Return per-op output data even on failure
        const RETURNVEC = 1024;
        /// First failing sub-operation aborts the rest of the batch
        const ORDERED = 1 << 16;
    }
}

bitflags::bitflags! {
    /// Operation task flags (LIBRADOS_OP_FLAG_* in librados.h)
    ///
    /// These attach to the whole batch, not to individual sub-operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u32 {
        /// Create exclusively: fail if the object exists
        const EXCL = 0x1;
        /// A failing sub-operation does not fail the batch
        const FAILOK = 0x2;
        const FADVISE_RANDOM = 0x4;
        const FADVISE_SEQUENTIAL = 0x8;
        const FADVISE_WILLNEED = 0x10;
        const FADVISE_DONTNEED = 0x20;
        const FADVISE_NOCACHE = 0x40;
        const FADVISE_FUA = 0x80;
    }
}

bitflags::bitflags! {
    /// Allocation hint flags (LIBRADOS_ALLOC_HINT_FLAG_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocHintFlags: u32 {
        const SEQUENTIAL_WRITE = 1;
        const RANDOM_WRITE = 2;
        const SEQUENTIAL_READ = 4;
        const RANDOM_READ = 8;
        const APPEND_ONLY = 16;
        const IMMUTABLE = 32;
        const SHORTLIVED = 64;
        const LONGLIVED = 128;
        const COMPRESSIBLE = 256;
        const INCOMPRESSIBLE = 512;
    }
}

// ============= Identifiers =============

/// Pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapId(pub u64);

/// CEPH_SNAPDIR: reserved for hidden .snap dir
pub const SNAP_DIR: SnapId = SnapId(u64::MAX); // -1 in two's complement
/// CEPH_NOSNAP: "head", "live" revision (normal object)
pub const SNAP_HEAD: SnapId = SnapId(u64::MAX - 1); // -2 in two's complement

impl SnapId {
    pub fn is_head(self) -> bool {
        self == SNAP_HEAD
    }
}

impl Default for SnapId {
    fn default() -> Self {
        SNAP_HEAD
    }
}

/// Completion identifier, unique per [`crate::Objecter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CompletionId(pub u64);

impl fmt::Display for CompletionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Modification time as carried on the wire (utime_t analogue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct UTime {
    pub sec: u64,
    pub nsec: u32,
}

impl UTime {
    pub fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn now() -> Self {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| Self::new(d.as_secs(), d.subsec_nanos()))
            .unwrap_or_default()
    }
}

/// Addressing unit for one object (hobject_t/object_locator_t analogue)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectAddress {
    /// Pool ID
    pub pool: PoolId,
    /// Namespace (usually empty)
    pub namespace: String,
    /// Hash-routing override; when set it replaces the oid for placement
    pub locator_key: Option<String>,
    /// Object name
    pub oid: String,
    /// Snapshot to read from (SNAP_HEAD for current version)
    pub snap: SnapId,
}

impl ObjectAddress {
    /// Address the head of an object in the default namespace
    pub fn new(pool: u64, oid: impl Into<String>) -> Self {
        Self {
            pool: PoolId(pool),
            namespace: String::new(),
            locator_key: None,
            oid: oid.into(),
            snap: SNAP_HEAD,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_locator_key(mut self, key: impl Into<String>) -> Self {
        self.locator_key = Some(key.into());
        self
    }

    pub fn at_snap(mut self, snap: SnapId) -> Self {
        self.snap = snap;
        self
    }

    /// Key used for placement: the locator key if present, else the oid
    pub fn placement_key(&self) -> &str {
        self.locator_key.as_deref().unwrap_or(&self.oid)
    }

    /// Placement hash over namespace and placement key
    ///
    /// Objects sharing a locator key in the same namespace always hash
    /// together.
    pub fn placement_hash(&self) -> u32 {
        let seed = crc32c::crc32c(self.namespace.as_bytes());
        crc32c::crc32c_append(seed, self.placement_key().as_bytes())
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.pool)?;
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        write!(f, "{}", self.oid)?;
        if let Some(key) = &self.locator_key {
            write!(f, "@{}", key)?;
        }
        Ok(())
    }
}

// ============= Comparison and checksum kinds =============

/// Comparison operator for cmpxattr and omap_cmp (LIBRADOS_CMPXATTR_OP_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompareOp {
    Eq = 1,
    Ne = 2,
    Gt = 3,
    Gte = 4,
    Lt = 5,
    Lte = 6,
}

impl CompareOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CompareOp::Eq),
            2 => Some(CompareOp::Ne),
            3 => Some(CompareOp::Gt),
            4 => Some(CompareOp::Gte),
            5 => Some(CompareOp::Lt),
            6 => Some(CompareOp::Lte),
            _ => None,
        }
    }

    /// Evaluate `actual <op> expected` with byte-wise ordering
    pub fn matches(self, actual: &[u8], expected: &[u8]) -> bool {
        use std::cmp::Ordering::*;
        let ord = actual.cmp(expected);
        match self {
            CompareOp::Eq => ord == Equal,
            CompareOp::Ne => ord != Equal,
            CompareOp::Gt => ord == Greater,
            CompareOp::Gte => ord != Less,
            CompareOp::Lt => ord == Less,
            CompareOp::Lte => ord != Greater,
        }
    }
}

/// Checksum algorithm (LIBRADOS_CHECKSUM_TYPE_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChecksumKind {
    XxHash32 = 0,
    XxHash64 = 1,
    Crc32c = 2,
}

impl ChecksumKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChecksumKind::XxHash32),
            1 => Some(ChecksumKind::XxHash64),
            2 => Some(ChecksumKind::Crc32c),
            _ => None,
        }
    }

    /// Width of one checksum value in bytes
    pub fn width(self) -> usize {
        match self {
            ChecksumKind::XxHash32 | ChecksumKind::Crc32c => 4,
            ChecksumKind::XxHash64 => 8,
        }
    }
}

/// Kind of a composite operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationKind {
    Read = 1,
    Write = 2,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Read => f.write_str("read"),
            OperationKind::Write => f.write_str("write"),
        }
    }
}

impl OperationKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OperationKind::Read),
            2 => Some(OperationKind::Write),
            _ => None,
        }
    }
}

// ============= Operation codes =============

// OSD operation modes (from Ceph's rados.h)
const CEPH_OSD_OP_MODE_RD: u16 = 0x1000;
const CEPH_OSD_OP_MODE_WR: u16 = 0x2000;

// OSD operation types (from Ceph's rados.h)
const CEPH_OSD_OP_TYPE_DATA: u16 = 0x0200;
const CEPH_OSD_OP_TYPE_ATTR: u16 = 0x0300;
const CEPH_OSD_OP_TYPE_EXEC: u16 = 0x0400;

/// Helper macro to construct operation codes using Ceph's encoding scheme
/// Matches __CEPH_OSD_OP(mode, type, nr) macro from rados.h
macro_rules! osd_op {
    (RD, DATA, $nr:expr) => {
        CEPH_OSD_OP_MODE_RD | CEPH_OSD_OP_TYPE_DATA | $nr
    };
    (WR, DATA, $nr:expr) => {
        CEPH_OSD_OP_MODE_WR | CEPH_OSD_OP_TYPE_DATA | $nr
    };
    (RD, ATTR, $nr:expr) => {
        CEPH_OSD_OP_MODE_RD | CEPH_OSD_OP_TYPE_ATTR | $nr
    };
    (WR, ATTR, $nr:expr) => {
        CEPH_OSD_OP_MODE_WR | CEPH_OSD_OP_TYPE_ATTR | $nr
    };
    (RD, EXEC, $nr:expr) => {
        CEPH_OSD_OP_MODE_RD | CEPH_OSD_OP_TYPE_EXEC | $nr
    };
}

/// Operation codes
///
/// Composed from MODE (bits 12-15), TYPE (bits 8-11) and the operation
/// number (bits 0-7), the way rados.h builds CEPH_OSD_OP_* values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    /// __CEPH_OSD_OP(RD, DATA, 1)
    Read = osd_op!(RD, DATA, 1),
    /// __CEPH_OSD_OP(RD, DATA, 2)
    Stat = osd_op!(RD, DATA, 2),
    /// __CEPH_OSD_OP(RD, DATA, 8)
    AssertVersion = osd_op!(RD, DATA, 8),
    OmapGetKeys = osd_op!(RD, DATA, 17),
    OmapGetVals = osd_op!(RD, DATA, 18),
    OmapGetValsByKeys = osd_op!(RD, DATA, 20),
    OmapCmp = osd_op!(RD, DATA, 25),
    Checksum = osd_op!(RD, DATA, 31),
    CmpExt = osd_op!(RD, DATA, 32),
    AssertExists = osd_op!(RD, DATA, 33),
    /// __CEPH_OSD_OP(WR, DATA, 1)
    Write = osd_op!(WR, DATA, 1),
    WriteFull = osd_op!(WR, DATA, 2),
    Truncate = osd_op!(WR, DATA, 3),
    Zero = osd_op!(WR, DATA, 4),
    Delete = osd_op!(WR, DATA, 5),
    Append = osd_op!(WR, DATA, 6),
    Create = osd_op!(WR, DATA, 13),
    OmapSetVals = osd_op!(WR, DATA, 21),
    OmapClear = osd_op!(WR, DATA, 23),
    OmapRmKeys = osd_op!(WR, DATA, 24),
    SetAllocHint = osd_op!(WR, DATA, 35),
    WriteSame = osd_op!(WR, DATA, 38),
    OmapRmKeyRange = osd_op!(WR, DATA, 44),
    /// __CEPH_OSD_OP(RD, ATTR, 1)
    GetXattr = osd_op!(RD, ATTR, 1),
    GetXattrs = osd_op!(RD, ATTR, 2),
    CmpXattr = osd_op!(RD, ATTR, 3),
    /// __CEPH_OSD_OP(WR, ATTR, 1)
    SetXattr = osd_op!(WR, ATTR, 1),
    RmXattr = osd_op!(WR, ATTR, 4),
    /// Object class method call: __CEPH_OSD_OP(RD, EXEC, 1)
    Call = osd_op!(RD, EXEC, 1),
}

impl OpCode {
    const ALL: [OpCode; 29] = [
        OpCode::Read,
        OpCode::Stat,
        OpCode::AssertVersion,
        OpCode::OmapGetKeys,
        OpCode::OmapGetVals,
        OpCode::OmapGetValsByKeys,
        OpCode::OmapCmp,
        OpCode::Checksum,
        OpCode::CmpExt,
        OpCode::AssertExists,
        OpCode::Write,
        OpCode::WriteFull,
        OpCode::Truncate,
        OpCode::Zero,
        OpCode::Delete,
        OpCode::Append,
        OpCode::Create,
        OpCode::OmapSetVals,
        OpCode::OmapClear,
        OpCode::OmapRmKeys,
        OpCode::SetAllocHint,
        OpCode::WriteSame,
        OpCode::OmapRmKeyRange,
        OpCode::GetXattr,
        OpCode::GetXattrs,
        OpCode::CmpXattr,
        OpCode::SetXattr,
        OpCode::RmXattr,
        OpCode::Call,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Try to convert a u16 to an OpCode
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.as_u16() == value)
    }

    /// Check if this operation is a read operation
    pub fn is_read(self) -> bool {
        (self as u16) & CEPH_OSD_OP_MODE_RD != 0
    }

    /// Check if this operation is a write operation
    pub fn is_write(self) -> bool {
        (self as u16) & CEPH_OSD_OP_MODE_WR != 0
    }

    /// Whether a successful reply carries output data for this op
    pub fn returns_data(self) -> bool {
        matches!(
            self,
            OpCode::Read
                | OpCode::Stat
                | OpCode::OmapGetKeys
                | OpCode::OmapGetVals
                | OpCode::OmapGetValsByKeys
                | OpCode::Checksum
                | OpCode::GetXattr
                | OpCode::GetXattrs
                | OpCode::Call
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Read => "read",
            OpCode::Stat => "stat",
            OpCode::AssertVersion => "assert-version",
            OpCode::OmapGetKeys => "omap-get-keys",
            OpCode::OmapGetVals => "omap-get-vals",
            OpCode::OmapGetValsByKeys => "omap-get-vals-by-keys",
            OpCode::OmapCmp => "omap-cmp",
            OpCode::Checksum => "checksum",
            OpCode::CmpExt => "cmpext",
            OpCode::AssertExists => "assert-exists",
            OpCode::Write => "write",
            OpCode::WriteFull => "writefull",
            OpCode::Truncate => "truncate",
            OpCode::Zero => "zero",
            OpCode::Delete => "delete",
            OpCode::Append => "append",
            OpCode::Create => "create",
            OpCode::OmapSetVals => "omap-set-vals",
            OpCode::OmapClear => "omap-clear",
            OpCode::OmapRmKeys => "omap-rm-keys",
            OpCode::SetAllocHint => "set-alloc-hint",
            OpCode::WriteSame => "writesame",
            OpCode::OmapRmKeyRange => "omap-rm-key-range",
            OpCode::GetXattr => "getxattr",
            OpCode::GetXattrs => "getxattrs",
            OpCode::CmpXattr => "cmpxattr",
            OpCode::SetXattr => "setxattr",
            OpCode::RmXattr => "rmxattr",
            OpCode::Call => "call",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
