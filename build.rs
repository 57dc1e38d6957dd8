use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    max_pages: Option<usize>,
    max_batch: Option<usize>,
    metadata_slab_size: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    max_pages: usize,
    max_batch: usize,
    metadata_slab_size: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(8192);
    assert!(
        page_size > 0 && page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2",
        page_size
    );
    assert!(
        page_size >= 4096,
        "page_size ({}) must be >= 4096",
        page_size
    );

    let max_pages = cfg.max_pages.unwrap_or(128);
    let max_batch = cfg.max_batch.unwrap_or(512);
    let metadata_slab_size = cfg.metadata_slab_size.unwrap_or(128 * 1024);

    assert!(max_pages >= 2, "max_pages ({}) must be >= 2", max_pages);
    assert!(max_batch >= 2, "max_batch ({}) must be >= 2", max_batch);
    assert!(
        metadata_slab_size >= page_size && metadata_slab_size % page_size == 0,
        "metadata_slab_size ({}) must be a multiple of page_size ({})",
        metadata_slab_size,
        page_size
    );

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        max_pages,
        max_batch,
        metadata_slab_size,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/spanalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const MAX_PAGES: usize = {};\n\
         pub const MAX_BATCH: usize = {};\n\
         pub const METADATA_SLAB_SIZE: usize = {};\n",
        cfg.page_shift, cfg.page_size, cfg.max_pages, cfg.max_batch, cfg.metadata_slab_size,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=SPANALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("SPANALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    // The manifest is optional; an absent file means all defaults.
    let content = fs::read_to_string(&config_path).unwrap_or_default();

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
