//! Zones are the unit of collected allocation.
//!
//! A zone is an immutable payload behind a [`ZoneHeader`] that records its
//! stored type, its mark flag for the current collection and its rank in the
//! [`ZoneRegistry`](super::registry::ZoneRegistry). Zones are shared through
//! [`ZoneRef`]; the registry keeps one reference to every live zone and the
//! collector drops that reference once the zone is found unreachable.

use std::{
    fmt,
    mem::size_of,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use super::mark::Marker;

pub const WORD_SIZE: usize = size_of::<usize>();

/// Rank of a zone that is not (or no longer) in the registry.
pub const UNREGISTERED: usize = usize::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ZoneKind {
    String,
    Double,
    Set,
    Tuple,
    Closure,
    Instance,
    Json,
    Deque,
    External,
}

impl ZoneKind {
    pub fn name(self) -> &'static str {
        match self {
            ZoneKind::String => "string",
            ZoneKind::Double => "double",
            ZoneKind::Set => "set",
            ZoneKind::Tuple => "tuple",
            ZoneKind::Closure => "closure",
            ZoneKind::Instance => "instance",
            ZoneKind::Json => "json",
            ZoneKind::Deque => "deque",
            ZoneKind::External => "external",
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct ZoneHeader {
    kind: ZoneKind,
    size_words: usize,
    marked: AtomicBool,
    rank: AtomicUsize,
}

impl ZoneHeader {
    fn new(kind: ZoneKind, size_words: usize) -> Self {
        Self {
            kind,
            size_words,
            marked: AtomicBool::new(false),
            rank: AtomicUsize::new(UNREGISTERED),
        }
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// Size accounted for this zone, header included.
    pub fn size_words(&self) -> usize {
        self.size_words
    }

    pub fn size_bytes(&self) -> usize {
        self.size_words * WORD_SIZE
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    /// Returns true if the zone was not marked before this call.
    pub(crate) fn try_mark(&self) -> bool {
        !self.marked.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_mark(&self) {
        self.marked.store(false, Ordering::Release);
    }

    pub fn rank(&self) -> Option<usize> {
        match self.rank.load(Ordering::Acquire) {
            UNREGISTERED => None,
            rank => Some(rank),
        }
    }

    pub(crate) fn set_rank(&self, rank: usize) {
        self.rank.store(rank, Ordering::Release);
    }
}

/// Data that can live in a zone.
pub trait ZoneData: Send + Sync + 'static {
    const KIND: ZoneKind;

    /// Payload size in words, excluding the zone header.
    fn size_words(&self) -> usize;

    /// Marks every value or object this payload refers to.
    fn trace(&self, marker: &mut Marker) {
        let _ = marker;
    }
}

pub struct Zone<T> {
    header: ZoneHeader,
    data: T,
}

pub type ZoneRef<T> = Arc<Zone<T>>;

const HEADER_WORDS: usize = (size_of::<ZoneHeader>() + WORD_SIZE - 1) / WORD_SIZE;

impl<T: ZoneData> Zone<T> {
    pub(crate) fn new(data: T) -> Self {
        let size_words = HEADER_WORDS + data.size_words();
        Self {
            header: ZoneHeader::new(T::KIND, size_words),
            data,
        }
    }

    pub fn header(&self) -> &ZoneHeader {
        &self.header
    }

    pub fn data(&self) -> &T {
        &self.data
    }
}

impl<T> Deref for Zone<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for Zone<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.data, f)
    }
}

/// Type-erased view of a zone, as kept by the registry and the marker.
pub trait AnyZone: Send + Sync {
    fn header(&self) -> &ZoneHeader;
    fn trace(&self, marker: &mut Marker);
}

impl<T: ZoneData> AnyZone for Zone<T> {
    fn header(&self) -> &ZoneHeader {
        &self.header
    }

    fn trace(&self, marker: &mut Marker) {
        self.data.trace(marker);
    }
}

/// Number of words needed to hold `bytes` bytes.
pub const fn words_for(bytes: usize) -> usize {
    (bytes + WORD_SIZE - 1) / WORD_SIZE
}
