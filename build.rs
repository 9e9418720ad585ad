use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    chunk_size: Option<usize>,
    size_class_subpower: Option<u32>,
    max_blocks_in_batch: Option<usize>,
    max_batch_bytes: Option<usize>,
    max_block_size: Option<usize>,
    canary_width: Option<u32>,
    canary_value: Option<u64>,
    auto_squeeze_interval: Option<u32>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    chunk_size: usize,
    size_class_subpower: u32,
    max_blocks_in_batch: usize,
    max_batch_bytes: usize,
    max_block_size: usize,
    canary_bits: u32,
    canary_value: u64,
    auto_squeeze_interval: u32,
}

fn target_pointer_bytes() -> usize {
    env::var("CARGO_CFG_TARGET_POINTER_WIDTH")
        .ok()
        .and_then(|w| w.parse::<usize>().ok())
        .map(|bits| bits / 8)
        .unwrap_or(core::mem::size_of::<usize>())
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let ptr = target_pointer_bytes();

    let chunk_size = cfg.chunk_size.unwrap_or(64 * 1024);
    assert!(
        chunk_size.is_power_of_two(),
        "chunk_size ({}) must be a power of 2",
        chunk_size
    );
    assert!(
        (4096..=512 * 1024).contains(&chunk_size),
        "chunk_size ({}) must be between 4 KiB and 512 KiB",
        chunk_size
    );

    let size_class_subpower = cfg.size_class_subpower.unwrap_or(2);
    assert!(
        size_class_subpower <= 4,
        "size_class_subpower ({}) must be <= 4",
        size_class_subpower
    );

    let max_blocks_in_batch = cfg.max_blocks_in_batch.unwrap_or(256);
    assert!(
        max_blocks_in_batch.is_power_of_two() && max_blocks_in_batch >= 2,
        "max_blocks_in_batch ({}) must be a power of 2 and >= 2",
        max_blocks_in_batch
    );
    // The pointer-size class keeps its batches in the chunk header, at least one per chunk.
    assert!(
        chunk_size / (ptr * max_blocks_in_batch) >= 1,
        "max_blocks_in_batch ({}) does not fit a {} byte chunk",
        max_blocks_in_batch,
        chunk_size
    );

    let max_batch_bytes = cfg.max_batch_bytes.unwrap_or(64 * 1024);
    assert!(
        max_batch_bytes.is_power_of_two(),
        "max_batch_bytes ({}) must be a power of 2",
        max_batch_bytes
    );

    let max_block_size = cfg.max_block_size.unwrap_or(chunk_size);
    assert!(
        max_block_size >= 2 * ptr,
        "max_block_size ({}) must be >= {}",
        max_block_size,
        2 * ptr
    );

    let canary_width = cfg.canary_width.unwrap_or(4);
    assert!(
        canary_width == 4 || canary_width == 8,
        "canary_width ({}) must be 4 or 8",
        canary_width
    );
    let canary_bits = canary_width * 8;
    let canary_value = cfg.canary_value.unwrap_or(0xFDFD_FDFD);
    assert!(
        canary_bits == 64 || canary_value >> canary_bits == 0,
        "canary_value ({:#x}) does not fit in {} bytes",
        canary_value,
        canary_width
    );

    ResolvedConfig {
        chunk_size,
        size_class_subpower,
        max_blocks_in_batch,
        max_batch_bytes,
        max_block_size,
        canary_bits,
        canary_value,
        auto_squeeze_interval: cfg.auto_squeeze_interval.unwrap_or(1000),
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/ltalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const CHUNK_SIZE: usize = {};\n\
         pub const SIZE_CLASS_SUBPOWER: u32 = {};\n\
         pub const MAX_BLOCKS_IN_BATCH: usize = {};\n\
         pub const MAX_BATCH_BYTES: usize = {};\n\
         pub const MAX_BLOCK_SIZE_LIMIT: usize = {};\n\
         pub type Canary = u{};\n\
         pub const CANARY_VALUE: Canary = {:#x};\n\
         pub const AUTO_SQUEEZE_INTERVAL: u32 = {};\n",
        cfg.chunk_size,
        cfg.size_class_subpower,
        cfg.max_blocks_in_batch,
        cfg.max_batch_bytes,
        cfg.max_block_size,
        cfg.canary_bits,
        cfg.canary_value,
        cfg.auto_squeeze_interval,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=LTALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("LTALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
