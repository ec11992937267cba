use std::num::NonZero;

use new_zealand::nz;

/// The stored form of a chunk that is checked out by a caller and therefore not linked into
/// any free stack.
///
/// Every encoded [`FreeLink`] carries a non-zero generation, so no linked word is ever 0.
pub(crate) const CHECKED_OUT: u64 = 0;

const SLOT_SHIFT: u32 = 32;

/// One word of a region's free stack: which chunk comes next plus a generation tag.
///
/// The slot is the 1-based chunk index, with slot 0 meaning "end of stack". The generation
/// is the release count of the chunk the link was created for. The pair is packed into a
/// single `u64` (slot in the high half, generation in the low half) so that the stack head
/// can be replaced with one compare-and-swap and a head that was popped and pushed back in
/// the meantime no longer compares equal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FreeLink {
    slot: u32,
    generation: NonZero<u32>,
}

impl FreeLink {
    /// A link that terminates the stack.
    #[must_use]
    pub(crate) const fn end(generation: NonZero<u32>) -> Self {
        Self {
            slot: 0,
            generation,
        }
    }

    /// A link pointing at the chunk with the given 0-based index.
    ///
    /// # Panics
    ///
    /// Panics if the index does not fit in the 32-bit slot.
    #[must_use]
    pub(crate) fn to_chunk(index: usize, generation: NonZero<u32>) -> Self {
        let slot = index
            .checked_add(1)
            .and_then(|slot| u32::try_from(slot).ok())
            .expect("chunk index must fit in the free link slot - guarded at pool construction");

        Self { slot, generation }
    }

    /// Decodes a stored word, returning `None` for [`CHECKED_OUT`].
    #[must_use]
    pub(crate) fn decode(word: u64) -> Option<Self> {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "deliberately keeping only the low half"
        )]
        let generation = NonZero::new(word as u32)?;

        #[expect(
            clippy::cast_possible_truncation,
            reason = "shift leaves only the high half"
        )]
        let slot = (word >> SLOT_SHIFT) as u32;

        Some(Self { slot, generation })
    }

    /// Packs the link into its stored word. The result is never [`CHECKED_OUT`].
    #[must_use]
    pub(crate) fn encode(self) -> u64 {
        (u64::from(self.slot) << SLOT_SHIFT) | u64::from(self.generation.get())
    }

    /// The 0-based index of the chunk this link points at, or `None` at the end of the stack.
    #[must_use]
    pub(crate) fn chunk_index(self) -> Option<usize> {
        let index = self.slot.checked_sub(1)?;

        Some(usize::try_from(index).expect("u32 always fits in usize on supported targets"))
    }

    #[must_use]
    pub(crate) fn generation(self) -> NonZero<u32> {
        self.generation
    }
}

/// The generation that follows `current`, skipping 0 on wrap-around.
#[must_use]
pub(crate) fn next_generation(current: NonZero<u32>) -> NonZero<u32> {
    NonZero::new(current.get().wrapping_add(1)).unwrap_or(nz!(1))
}
