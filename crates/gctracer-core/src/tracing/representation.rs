use anyhow::{Error, anyhow};
use gctracer_error::{Fault, errno};

/// Identifier the substrate assigns to an application thread.
pub type ThreadId = u32;

/// Size in bytes of one chunk of the output log.
pub const CHUNK_SIZE: u64 = 8;

/// Rounds `address` down to the start of its chunk.
#[inline]
pub const fn align_down(address: u64) -> u64 {
    address & !(CHUNK_SIZE - 1)
}

/// The kind of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// A data load
    Read,

    /// A data store
    Write,

    /// An instruction fetch
    InstructionFetch,
}

impl OpKind {
    /// Returns the integer the substrate uses to encode this kind.
    pub const fn id(&self) -> u32 {
        match self {
            OpKind::Read => 0,
            OpKind::Write => 1,
            OpKind::InstructionFetch => 2,
        }
    }

    /// Decodes the raw kind delivered by the substrate.
    ///
    /// # Errors
    ///
    /// Fails with [`errno::UNRECOGNIZED_ACCESS_KIND`] if `id` is none of
    /// the ids returned by [`OpKind::id`].
    pub fn try_from_id(id: u32) -> Result<Self, Error> {
        match id {
            0 => Ok(OpKind::Read),
            1 => Ok(OpKind::Write),
            2 => Ok(OpKind::InstructionFetch),
            _ => Err(anyhow!(Fault::new(errno::UNRECOGNIZED_ACCESS_KIND))
                .context(format!("didn't recognize mem op type: {id}"))),
        }
    }

    /// The label of this kind in the output log, padded to 7 characters.
    pub const fn label(&self) -> &'static str {
        match self {
            OpKind::Read => "READ   ",
            OpKind::Write => "WRITE  ",
            OpKind::InstructionFetch => "IFETCH ",
        }
    }
}

/// One logged memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    address: u64,
    op: OpKind,
    size: u32,
    cycle: u64,
}

impl AccessRecord {
    /// Creates a record of `size` bytes accessed at `address`.
    ///
    /// The cycle is always 0; no cycle counter is sampled.
    pub const fn new(address: u64, size: u32, op: OpKind) -> Self {
        Self {
            address,
            op,
            size,
            cycle: 0,
        }
    }

    pub const fn address(&self) -> u64 {
        self.address
    }

    pub const fn op(&self) -> OpKind {
        self.op
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Iterates over the start addresses of all chunks touched by this access.
    ///
    /// A zero-sized access touches no chunk. Accesses reaching past the end
    /// of the address space are cut off at `u64::MAX`.
    pub fn chunks(&self) -> impl Iterator<Item = u64> + use<> {
        let first = align_down(self.address);
        let last = align_down(
            self.address
                .saturating_add(u64::from(self.size).saturating_sub(1)),
        );

        std::iter::successors((self.size > 0).then_some(first), move |chunk| {
            chunk
                .checked_add(CHUNK_SIZE)
                .filter(|next| *next <= last)
        })
    }
}

/// The sentinel routines marking region boundaries in the target program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    Begin,
    End,
    Exit,
}

impl Sentinel {
    pub const ALL: [Sentinel; 3] = [Sentinel::Begin, Sentinel::End, Sentinel::Exit];

    /// The name of the routine in the target program.
    pub const fn routine_name(&self) -> &'static str {
        match self {
            Sentinel::Begin => "pin_simulation_begin",
            Sentinel::End => "pin_simulation_end",
            Sentinel::Exit => "pin_simulation_exit",
        }
    }

    /// Returns an integer that uniquely identifies the sentinel.
    pub const fn id(&self) -> u32 {
        match self {
            Sentinel::Begin => 0,
            Sentinel::End => 1,
            Sentinel::Exit => 2,
        }
    }

    pub fn try_from_id(id: u32) -> Result<Self, Error> {
        match id {
            0 => Ok(Sentinel::Begin),
            1 => Ok(Sentinel::End),
            2 => Ok(Sentinel::Exit),
            _ => Err(anyhow!(Fault::new(errno::INVALID_ARGUMENT))
                .context(format!("Sentinel-ID {id} was not recognized"))),
        }
    }

    /// Maps a routine name to the sentinel it denotes, if any.
    pub fn match_routine(name: &str, matching: SentinelMatch) -> Option<Self> {
        Self::ALL.into_iter().find(|sentinel| match matching {
            SentinelMatch::Exact => name == sentinel.routine_name(),
            SentinelMatch::Substring => name.contains(sentinel.routine_name()),
        })
    }
}

/// How routine names are compared against the sentinel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SentinelMatch {
    /// The routine name must equal the sentinel name.
    #[default]
    Exact,

    /// The routine name must contain the sentinel name.
    ///
    /// This is how older tooling matched sentinels. It also matches unrelated
    /// routines that happen to contain a sentinel name.
    Substring,
}

/// A region boundary observed by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionEvent {
    pub kind: Sentinel,
    pub thread: ThreadId,
}

/// A single memory operand observed by the substrate.
///
/// The kind is kept in its raw encoding since the substrate may deliver
/// values that do not map to any [`OpKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEvent {
    pub thread: ThreadId,
    pub address: u64,
    pub size: u32,
    pub kind: u32,
}

impl AccessEvent {
    pub const fn new(thread: ThreadId, address: u64, size: u32, op: OpKind) -> Self {
        Self {
            thread,
            address,
            size,
            kind: op.id(),
        }
    }
}
