//! Processor identifiers and processor masks.
//!
//! Processor `0` is the CPU; GPUs occupy ids `1..=MAX_GPUS`. Masks are plain
//! bitmaps over those ids and are used for every accessed-by, residency and
//! mapping set in the crate.

use std::fmt;

pub const MAX_GPUS: usize = 32;
pub const MAX_PROCESSORS: usize = MAX_GPUS + 1;

/// Identifies the CPU or one GPU slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(u8);

impl ProcessorId {
    pub const CPU: Self = Self(0);

    /// Returns the id of GPU slot `index` (zero based).
    ///
    /// # Panics
    /// Panics if `index >= MAX_GPUS`.
    #[must_use]
    pub const fn gpu(index: usize) -> Self {
        assert!(index < MAX_GPUS);
        #[allow(clippy::cast_possible_truncation)]
        Self(index as u8 + 1)
    }

    #[must_use]
    pub const fn from_value(value: usize) -> Option<Self> {
        if value < MAX_PROCESSORS {
            #[allow(clippy::cast_possible_truncation)]
            Some(Self(value as u8))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn value(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn is_cpu(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_gpu(self) -> bool {
        self.0 != 0
    }

    /// Slot of this GPU in per-GPU tables.
    #[must_use]
    pub const fn gpu_index(self) -> Option<usize> {
        if self.is_gpu() {
            Some(self.0 as usize - 1)
        } else {
            None
        }
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gpu_index() {
            None => write!(f, "CPU"),
            Some(index) => write!(f, "GPU{index}"),
        }
    }
}

/// 16-byte UUID the RM layer reports for a GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessorUuid(pub [u8; 16]);

impl fmt::Display for ProcessorUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU-")?;
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessorMask(u64);

impl ProcessorMask {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn single(id: ProcessorId) -> Self {
        Self(1 << id.0)
    }

    #[must_use]
    pub const fn test(self, id: ProcessorId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    pub fn set(&mut self, id: ProcessorId) {
        self.0 |= 1 << id.0;
    }

    pub fn clear(&mut self, id: ProcessorId) {
        self.0 &= !(1 << id.0);
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn andnot(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn xor(self, other: Self) -> Self {
        Self(self.0 ^ other.0)
    }

    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Mask with only the GPU bits kept.
    #[must_use]
    pub const fn gpus(self) -> Self {
        Self(self.0 & !1)
    }

    #[must_use]
    pub fn first(self) -> Option<ProcessorId> {
        self.iter().next()
    }

    #[must_use]
    pub fn first_gpu(self) -> Option<ProcessorId> {
        self.gpus().first()
    }

    pub fn iter(self) -> impl Iterator<Item = ProcessorId> {
        (0..MAX_PROCESSORS)
            .filter(move |&value| self.0 & (1 << value) != 0)
            .filter_map(ProcessorId::from_value)
    }
}

impl FromIterator<ProcessorId> for ProcessorMask {
    fn from_iter<I: IntoIterator<Item = ProcessorId>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for id in iter {
            mask.set(id);
        }
        mask
    }
}

impl fmt::Debug for ProcessorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
