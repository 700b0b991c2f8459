use async_stream::stream;
use async_trait::async_trait;
use clickhouse_rs::types::Complex;
use clickhouse_rs::{row, Block, ClientHandle, Pool};
use log::{debug, info};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::Arc;

use super::{
    FlowStore, FlowStream, FlowUpdate, PopulationFilter, StorageError, StoredFlow, Volume,
    WriteOp,
};
use crate::classification::stats::{MetricSummary, PopulationStats};
use crate::consts::{CLICKHOUSE_SCAN_PAGE_SIZE, CLICKHOUSE_UPDATE_CHUNK_SIZE};
use crate::flow::{FlowAddr, FlowKey, FlowRecord};

const COLUMNS: &str = "id, src, src_port, dst, dst_port, npackets_src, nbytes_src, \
    npackets_dst, nbytes_dst, npackets_total, nbytes_total, start, duration";

const RATE: &str = "if(duration > 0, nbytes_total / (duration / 1000), toFloat64(0))";

fn default_database() -> String {
    String::from("default")
}

fn default_table() -> String {
    String::from("flows")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClickhouseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_table")]
    pub table: String,
}

impl std::fmt::Display for ClickhouseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "tcp://{}:{}@{}:{}/{}?compression=lz4&send_retries=0",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

impl From<ClickhouseSettings> for ClickhouseStore {
    fn from(settings: ClickhouseSettings) -> ClickhouseStore {
        ClickhouseStore::new(settings)
    }
}

/// Conjunction of SQL conditions rendered as a `WHERE` clause, empty when
/// there is nothing to filter on.
struct QueryCondition {
    conditions: Vec<String>,
}

impl QueryCondition {
    fn new() -> Self {
        Self { conditions: vec![] }
    }

    fn condition(mut self, condition: Option<String>) -> Self {
        if let Some(c) = condition {
            self.conditions.push(c);
        }

        self
    }
}

impl From<&PopulationFilter> for QueryCondition {
    fn from(filter: &PopulationFilter) -> Self {
        QueryCondition::new()
            .condition(filter.min_bytes.map(|b| format!("nbytes_total >= {b}")))
            .condition(filter.min_duration_ms.map(|d| format!("duration >= {d}")))
            .condition(filter.min_packets.map(|p| format!("npackets_total >= {p}")))
    }
}

impl Display for QueryCondition {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.conditions.is_empty() {
            return fmt.write_str("");
        }

        write!(fmt, "WHERE {}", self.conditions.join(" AND "))
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn decode_block(block: &Block<Complex>) -> Result<Vec<StoredFlow>, StorageError> {
    let decode = |e: clickhouse_rs::errors::Error| StorageError::Decode(e.to_string());

    block
        .rows()
        .map(|row| {
            let src: String = row.get("src").map_err(decode)?;
            let dst: String = row.get("dst").map_err(decode)?;
            Ok(StoredFlow {
                id: row.get("id").map_err(decode)?,
                flow: FlowRecord {
                    src: FlowAddr::from_storage(&src),
                    src_port: row.get("src_port").map_err(decode)?,
                    dst: FlowAddr::from_storage(&dst),
                    dst_port: row.get("dst_port").map_err(decode)?,
                    packets_src: row.get("npackets_src").map_err(decode)?,
                    bytes_src: row.get("nbytes_src").map_err(decode)?,
                    packets_dst: row.get("npackets_dst").map_err(decode)?,
                    bytes_dst: row.get("nbytes_dst").map_err(decode)?,
                    packets_total: row.get("npackets_total").map_err(decode)?,
                    bytes_total: row.get("nbytes_total").map_err(decode)?,
                    start_ms: row.get("start").map_err(decode)?,
                    duration_ms: row.get("duration").map_err(decode)?,
                },
            })
        })
        .collect()
}

fn decode_metric(block: &Block<Complex>, prefix: &str) -> Result<MetricSummary, StorageError> {
    let get = |column: &str| -> Result<f64, StorageError> {
        block
            .get::<f64, _>(0, format!("{prefix}_{column}").as_str())
            .map_err(|e| StorageError::Decode(e.to_string()))
    };

    Ok(MetricSummary {
        mean: get("mean")?,
        std_dev: get("std")?,
        min: get("min")?,
        max: get("max")?,
    })
}

fn metric_columns(expr: &str, prefix: &str) -> String {
    format!(
        "avg({expr}) AS {prefix}_mean, stddevPop({expr}) AS {prefix}_std, \
         toFloat64(min({expr})) AS {prefix}_min, toFloat64(max({expr})) AS {prefix}_max"
    )
}

fn population_stats_query(table: &str, filter: &PopulationFilter) -> String {
    format!(
        "SELECT count() AS n, {}, {}, {}, {} FROM \
         (SELECT nbytes_total, duration, npackets_total, {RATE} AS rate FROM {table} {})",
        metric_columns("nbytes_total", "bytes"),
        metric_columns("duration", "duration"),
        metric_columns("npackets_total", "packets"),
        metric_columns("rate", "rate"),
        QueryCondition::from(filter),
    )
}

/// `column = multiIf(id = .., value, .., column)` for the updates carrying a
/// value for `column`.
fn multi_if<F>(column: &str, updates: &[FlowUpdate], value: F) -> Option<String>
where
    F: Fn(&FlowUpdate) -> Option<String>,
{
    let branches = updates
        .iter()
        .filter_map(|u| value(u).map(|v| format!("id = {}, {v}", quote(&u.id))))
        .collect::<Vec<String>>();

    if branches.is_empty() {
        return None;
    }

    Some(format!("{column} = multiIf({}, {column})", branches.join(", ")))
}

fn volume(pick: fn(&Volume) -> u64) -> impl Fn(&FlowUpdate) -> Option<String> {
    move |u| u.volume.as_ref().map(|v| pick(v).to_string())
}

fn update_statement(table: &str, updates: &[FlowUpdate]) -> String {
    let assignments = [
        multi_if("duration", updates, |u| Some(u.duration_ms.to_string())),
        multi_if("npackets_src", updates, volume(|v| v.packets_src)),
        multi_if("nbytes_src", updates, volume(|v| v.bytes_src)),
        multi_if("npackets_dst", updates, volume(|v| v.packets_dst)),
        multi_if("nbytes_dst", updates, volume(|v| v.bytes_dst)),
        multi_if("npackets_total", updates, volume(|v| v.packets_total)),
        multi_if("nbytes_total", updates, volume(|v| v.bytes_total)),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<String>>();

    let ids = updates
        .iter()
        .map(|u| quote(&u.id))
        .collect::<Vec<String>>();

    format!(
        "ALTER TABLE {table} UPDATE {} WHERE id IN ({}) SETTINGS mutations_sync = 1",
        assignments.join(", "),
        ids.join(", ")
    )
}

pub struct ClickhouseStore {
    pub settings: ClickhouseSettings,
    pub pool: Arc<Pool>,
}

impl ClickhouseStore {
    pub fn new(settings: ClickhouseSettings) -> Self {
        let dsn = settings.to_string();
        let pool = Arc::new(Pool::new(dsn));

        Self { settings, pool }
    }

    async fn client(&self) -> Result<ClientHandle, StorageError> {
        Ok(self.pool.get_handle().await?)
    }

    async fn fetch(&self, sql: &str) -> Result<Block<Complex>, StorageError> {
        debug!("querying clickhouse: {sql}");
        let mut client = self.client().await?;
        Ok(client.query(sql).fetch_all().await?)
    }

    async fn execute(&self, sql: &str) -> Result<(), StorageError> {
        debug!("executing on clickhouse: {sql}");
        let mut client = self.client().await?;
        Ok(client.execute(sql).await?)
    }
}

#[async_trait]
impl FlowStore for ClickhouseStore {
    /// Creates the flow table, sorted by the merge key and start so that
    /// latest-by-key lookups read a single granule range.
    async fn create_index(&self) -> Result<(), StorageError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id String,
                src String,
                src_port UInt16,
                dst String,
                dst_port UInt16,
                npackets_src UInt64,
                nbytes_src UInt64,
                npackets_dst UInt64,
                nbytes_dst UInt64,
                npackets_total UInt64,
                nbytes_total UInt64,
                start Int64,
                duration UInt64
            ) ENGINE = MergeTree()
            ORDER BY (src, src_port, dst, dst_port, start)",
            self.settings.table
        );
        self.execute(&sql).await?;
        info!("table {} ready", self.settings.table);
        Ok(())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let block = self
            .fetch(&format!("SELECT count() AS n FROM {}", self.settings.table))
            .await?;

        block
            .get::<u64, _>(0, "n")
            .map_err(|e| StorageError::Decode(e.to_string()))
    }

    async fn truncate(&self) -> Result<(), StorageError> {
        self.execute(&format!("TRUNCATE TABLE IF EXISTS {}", self.settings.table))
            .await
    }

    async fn find_latest(&self, key: &FlowKey) -> Result<Option<StoredFlow>, StorageError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE src = {} AND src_port = {} AND dst = {} AND dst_port = {} \
             ORDER BY start DESC LIMIT 1",
            self.settings.table,
            quote(&key.src.to_storage()),
            key.src_port,
            quote(&key.dst.to_storage()),
            key.dst_port,
        );
        let block = self.fetch(&sql).await?;

        Ok(decode_block(&block)?.into_iter().next())
    }

    async fn insert_many(&self, flows: Vec<StoredFlow>) -> Result<(), StorageError> {
        if flows.is_empty() {
            return Ok(());
        }

        let mut block = Block::with_capacity(flows.len());
        for stored in &flows {
            let f = &stored.flow;
            let src = f.src.to_storage();
            let dst = f.dst.to_storage();
            block.push(row! {
                id: stored.id.as_str(),
                src: src.as_str(),
                src_port: f.src_port,
                dst: dst.as_str(),
                dst_port: f.dst_port,
                npackets_src: f.packets_src,
                nbytes_src: f.bytes_src,
                npackets_dst: f.packets_dst,
                nbytes_dst: f.bytes_dst,
                npackets_total: f.packets_total,
                nbytes_total: f.bytes_total,
                start: f.start_ms,
                duration: f.duration_ms
            })?;
        }

        let mut client = self.client().await?;
        client.insert(self.settings.table.as_str(), block).await?;
        debug!("inserted {} flows into {}", flows.len(), self.settings.table);
        Ok(())
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for op in ops {
            match op {
                WriteOp::Insert(stored) => inserts.push(stored),
                WriteOp::Update(update) => updates.push(update),
            }
        }

        self.insert_many(inserts).await?;
        for chunk in updates.chunks(CLICKHOUSE_UPDATE_CHUNK_SIZE) {
            self.execute(&update_statement(&self.settings.table, chunk))
                .await?;
        }

        Ok(())
    }

    fn scan(&self, filter: &PopulationFilter) -> FlowStream {
        let pool = Arc::clone(&self.pool);
        let table = self.settings.table.clone();
        let condition = QueryCondition::from(filter);
        let page_size = CLICKHOUSE_SCAN_PAGE_SIZE;

        Box::pin(stream! {
            let mut client = match pool.get_handle().await {
                Ok(client) => client,
                Err(e) => {
                    yield Err(StorageError::from(e));
                    return;
                }
            };

            let mut offset: u64 = 0;
            loop {
                let sql = format!(
                    "SELECT {COLUMNS} FROM {table} {condition} \
                     ORDER BY src, src_port, dst, dst_port, start, id \
                     LIMIT {page_size} OFFSET {offset}"
                );
                let block = match client.query(sql.as_str()).fetch_all().await {
                    Ok(block) => block,
                    Err(e) => {
                        yield Err(StorageError::from(e));
                        return;
                    }
                };

                let rows = block.row_count() as u64;
                match decode_block(&block) {
                    Ok(flows) => {
                        for stored in flows {
                            yield Ok(stored);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }

                if rows < page_size {
                    break;
                }
                offset += page_size;
            }
        })
    }

    async fn population_stats(
        &self,
        filter: &PopulationFilter,
    ) -> Result<PopulationStats, StorageError> {
        let sql = population_stats_query(&self.settings.table, filter);
        let block = self.fetch(&sql).await?;

        let count = block
            .get::<u64, _>(0, "n")
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        if count == 0 {
            return Ok(PopulationStats::default());
        }

        Ok(PopulationStats {
            count,
            bytes: decode_metric(&block, "bytes")?,
            duration: decode_metric(&block, "duration")?,
            packets: decode_metric(&block, "packets")?,
            rate: decode_metric(&block, "rate")?,
        })
    }

    async fn top_rates(
        &self,
        filter: &PopulationFilter,
        limit: usize,
    ) -> Result<Vec<StoredFlow>, StorageError> {
        let filter = filter.and(&PopulationFilter::with_duration());
        let sql = format!(
            "SELECT {COLUMNS} FROM {} {} ORDER BY {RATE} DESC LIMIT {limit}",
            self.settings.table,
            QueryCondition::from(&filter),
        );
        let block = self.fetch(&sql).await?;

        decode_block(&block)
    }
}
