//! Geometry of the heap. None of these are runtime configurable.

/// Block in bit size = 16 bits ~ 65536 bytes
pub const BLOCK_BITS: usize = 16;
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;
pub const BLOCK_SIZE_MASK: usize = BLOCK_SIZE - 1;

/// Line in bit size = 8 bits ~ 256 bytes
pub const LINE_BITS: usize = 8;
pub const LINE_SIZE: usize = 1 << LINE_BITS;
pub const LINE_SIZE_MASK: usize = LINE_SIZE - 1;

/// Number of lines in a block = 256.
pub const LINE_COUNT: usize = BLOCK_SIZE / LINE_SIZE;

/// The first two lines of every block are reserved for block metadata.
pub const HEADER_LINE_COUNT: usize = 2;
pub const BLOCK_HEADER_SIZE: usize = HEADER_LINE_COUNT * LINE_SIZE;

/// Lines effectively available for allocation = 254.
pub const EFFECTIVE_LINE_COUNT: usize = LINE_COUNT - HEADER_LINE_COUNT;
pub const EFFECTIVE_BLOCK_SIZE: usize = EFFECTIVE_LINE_COUNT * LINE_SIZE;

pub const BLOCK_COUNT_BITS_PER_CHUNK: usize = 3;
/// Number of blocks per allocation chunk = 8.
pub const BLOCK_COUNT_PER_CHUNK: usize = 1 << BLOCK_COUNT_BITS_PER_CHUNK;
pub const BLOCK_COUNT_PER_CHUNK_MASK: usize = BLOCK_COUNT_PER_CHUNK - 1;

/// Size of a chunk of blocks = 512 KiB, excluding alignment slack.
pub const CHUNK_SIZE: usize = BLOCK_SIZE * BLOCK_COUNT_PER_CHUNK;

/// Bytes actually requested from the OS per chunk: one extra block of slack
/// so the chunk base can be rounded up to block alignment.
pub const TOTAL_CHUNK_SIZE: usize = CHUNK_SIZE + BLOCK_SIZE;

/// Request a collection every `COLLECT_TRIGGER_LIMIT` bytes allocated.
pub const COLLECT_TRIGGER_LIMIT: usize = CHUNK_SIZE * 7;

/// Size of the 32-bit object header.
pub const OBJECT_HEADER_SIZE: usize = 4;

/// Additional bytes between the header word and the user object, for
/// embedders that store extra per-object state (hashcode, sync block, ...).
/// Must be a multiple of 4.
pub const ADDITIONAL_HEADER_SIZE: usize = 0;

/// Distance in bytes from the object header to the user-visible object.
pub const HEADER_TOTAL_SIZE: usize = OBJECT_HEADER_SIZE + ADDITIONAL_HEADER_SIZE;

/// Largest object that still fits in a block's payload; anything bigger goes
/// through the large-object space.
pub const STANDARD_OBJECT_MAX_SIZE: usize = (EFFECTIVE_BLOCK_SIZE - HEADER_TOTAL_SIZE) & !3;

/// Offset from the class-descriptor address to the reference visitor slot.
pub const OFFSET_TO_VISITOR_FROM_VTBL: usize = 0;
