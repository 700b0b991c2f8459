pub const DEFAULT_CONFIG_PATH: &str = "./reconstructor.yaml";
pub const ENV_PREFIX: &str = "RECONSTRUCTOR";
pub const ENV_SEPARATOR: &str = "__";

pub const LOADER_BATCH_SIZE: usize = 1_000_000;
pub const MERGE_BATCH_SIZE: usize = 500_000;
pub const MERGE_TIMEOUT_LIMIT_MS: i64 = 20_000;

pub const SIGMA_MULTIPLIER: f64 = 3.0;
pub const MIN_PACKETS: u64 = 3;
pub const RATE_LOW_FLOOR: f64 = 16_384.0;

pub const HISTOGRAM_BINS: usize = 60;
pub const TOP_RATES_LIMIT: usize = 10;

pub const CLICKHOUSE_SCAN_PAGE_SIZE: u64 = 100_000;
pub const CLICKHOUSE_UPDATE_CHUNK_SIZE: usize = 1_000;
