//! Compile-time configuration, generated by `build.rs` from `ltalloc.toml`.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

pub const PTR_SIZE: usize = core::mem::size_of::<usize>();

pub const CHUNK_MASK: usize = CHUNK_SIZE - 1;

/// Largest request served from a chunk. Anything bigger takes the large path.
///
/// At least one block of this size must fit after the biggest chunk header, so
/// the configured limit is clamped to `CHUNK_SIZE - CHUNK_SIZE / 2^(G+1)`.
pub const MAX_BLOCK_SIZE: usize = {
    let fit = CHUNK_SIZE - (CHUNK_SIZE >> (1 + SIZE_CLASS_SUBPOWER));
    if MAX_BLOCK_SIZE_LIMIT < fit {
        MAX_BLOCK_SIZE_LIMIT
    } else {
        fit
    }
};

/// Bytes reserved after every allocation for the overflow canary.
pub const CANARY_SIZE: usize = if cfg!(feature = "overflow-guard") {
    core::mem::size_of::<Canary>()
} else {
    0
};
