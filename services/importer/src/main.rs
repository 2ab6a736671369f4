//! Importer Service - Loads fuel station price CSV snapshots into PostgreSQL
//!
//! Responsibilities:
//! - Discover CSV snapshots in a configured directory
//! - Resolve dimension rows (province, municipality, locality, postal code,
//!   margin, schedule, brand, station type, fuel type) through a shared
//!   cache-or-select-or-insert protocol
//! - Resolve stations by exact geographic coincidence of their location
//! - Append price observations in fixed-size batches, deduplicated on
//!   (station, fuel type, observed_at)
//! - Run everything inside one transaction: a failed run commits nothing
//!
//! Usage:
//!   cargo run --bin importer -- --csv-dir data/csv --batch-size 5000

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports fuel station price CSV files")]
struct Args {
    /// Directory containing the CSV snapshots to import
    #[arg(long, default_value = "data/csv")]
    csv_dir: PathBuf,

    /// Records accumulated before each batched price insert
    #[arg(long, default_value_t = 5000)]
    batch_size: usize,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
enum ImportError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store accepted an insert but returned no generated identifier.
    /// Treated as a data-integrity fault: fatal, never retried.
    #[error("no generated identifier returned for {dimension} '{key}'")]
    MissingGeneratedId {
        dimension: &'static str,
        key: String,
    },

    #[error("invalid timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("required column '{0}' not found in header")]
    MissingColumn(&'static str),
}

// =============================================================================
// Column layout
// =============================================================================

// Canonical header names with the spellings used by the upstream data
// source accepted as aliases.
const COL_PROVINCE: &[&str] = &["Province", "Provincia"];
const COL_MUNICIPALITY: &[&str] = &["Municipality", "Municipio"];
const COL_LOCALITY: &[&str] = &["Locality", "Localidad"];
const COL_POSTAL_CODE: &[&str] = &["PostalCode", "Código postal"];
const COL_ADDRESS: &[&str] = &["Address", "Dirección"];
const COL_MARGIN: &[&str] = &["Margin", "Margen"];
const COL_OBSERVED_AT: &[&str] = &["ObservationTimestamp", "Toma de datos"];
const COL_STATION_TYPE: &[&str] = &["StationType", "Tipo estación"];
const COL_BRAND: &[&str] = &["Brand", "Rótulo"];
const COL_SCHEDULE: &[&str] = &["Schedule", "Horario"];
const COL_LONGITUDE: &[&str] = &["Longitude", "Longitud"];
const COL_LATITUDE: &[&str] = &["Latitude", "Latitud"];

/// Columns whose header carries one of these prefixes hold a price; the
/// rest of the header text names the fuel type.
const PRICE_PREFIXES: &[&str] = &["Price ", "Precio "];

/// Resolved field indices for one file's header row.
#[derive(Debug)]
struct ColumnMap {
    province: usize,
    municipality: usize,
    locality: usize,
    postal_code: usize,
    address: usize,
    margin: usize,
    observed_at: usize,
    station_type: usize,
    brand: usize,
    schedule: usize,
    longitude: usize,
    latitude: usize,
    /// (field index, fuel type name) pairs discovered from the header.
    fuel_columns: Vec<(usize, String)>,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, ImportError> {
        let index: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim(), i))
            .collect();

        let find = |aliases: &'static [&'static str]| -> Result<usize, ImportError> {
            aliases
                .iter()
                .find_map(|alias| index.get(alias).copied())
                .ok_or(ImportError::MissingColumn(aliases[0]))
        };

        let mut fuel_columns = Vec::new();
        for (i, header) in headers.iter().enumerate() {
            let header = header.trim();
            for prefix in PRICE_PREFIXES {
                if let Some(fuel) = header.strip_prefix(prefix) {
                    let fuel = fuel.trim();
                    if !fuel.is_empty() {
                        fuel_columns.push((i, fuel.to_string()));
                    }
                    break;
                }
            }
        }

        Ok(Self {
            province: find(COL_PROVINCE)?,
            municipality: find(COL_MUNICIPALITY)?,
            locality: find(COL_LOCALITY)?,
            postal_code: find(COL_POSTAL_CODE)?,
            address: find(COL_ADDRESS)?,
            margin: find(COL_MARGIN)?,
            observed_at: find(COL_OBSERVED_AT)?,
            station_type: find(COL_STATION_TYPE)?,
            brand: find(COL_BRAND)?,
            schedule: find(COL_SCHEDULE)?,
            longitude: find(COL_LONGITUDE)?,
            latitude: find(COL_LATITUDE)?,
            fuel_columns,
        })
    }
}

// =============================================================================
// Field parsing
// =============================================================================

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a decimal field that may use either ',' or '.' as separator.
/// Returns None for empty or unparseable input; the caller decides what
/// absence means. A genuine zero parses as Some(0.0).
fn parse_decimal(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.replace(',', ".").parse::<f64>().ok()
}

/// Timestamps are not optional: failure propagates and aborts the run.
fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, ImportError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|source| {
        ImportError::InvalidTimestamp {
            value: raw.to_string(),
            source,
        }
    })
}

/// WKT representation of a station location, longitude before latitude.
/// Rust float formatting always uses '.', independent of host locale, so
/// identical coordinates always produce identical strings.
fn format_point(longitude: f64, latitude: f64) -> String {
    format!("POINT({} {})", longitude, latitude)
}

/// Cache key for a dimension natural key: the name alone for parentless
/// dimensions, name and parent id concatenated for hierarchical ones.
fn cache_key(name: &str, parent_id: Option<i32>) -> String {
    match parent_id {
        Some(parent) => format!("{name}_{parent}"),
        None => name.to_string(),
    }
}

// =============================================================================
// Typed record
// =============================================================================

/// One CSV row converted to typed values, ready for resolution.
#[derive(Debug)]
struct StationRecord {
    province: String,
    municipality: String,
    locality: String,
    postal_code: String,
    address: String,
    margin: String,
    schedule: String,
    brand: String,
    station_type: String,
    observed_at: NaiveDateTime,
    location_wkt: String,
    /// (fuel type name, price) for every price column with a usable value.
    prices: Vec<(String, f64)>,
}

impl StationRecord {
    /// Convert a raw CSV row. Returns Ok(None) when the row has no usable
    /// coordinates: without a location there is no station identity to
    /// attach facts to, so the row is reported and dropped rather than
    /// collapsed onto POINT(0 0).
    fn from_csv(
        row: &csv::StringRecord,
        columns: &ColumnMap,
    ) -> Result<Option<Self>, ImportError> {
        let field = |idx: usize| row.get(idx).unwrap_or("").trim();

        let longitude = parse_decimal(field(columns.longitude));
        let latitude = parse_decimal(field(columns.latitude));
        let (longitude, latitude) = match (longitude, latitude) {
            (Some(lon), Some(lat)) => (lon, lat),
            _ => {
                eprintln!(
                    "Warning: no usable coordinates for station at '{}', skipping record",
                    field(columns.address)
                );
                return Ok(None);
            }
        };

        let observed_at = parse_timestamp(field(columns.observed_at))?;

        let mut prices = Vec::new();
        for (idx, fuel) in &columns.fuel_columns {
            let raw = field(*idx);
            if raw.is_empty() {
                continue;
            }
            match parse_decimal(raw) {
                Some(price) => prices.push((fuel.clone(), price)),
                None => eprintln!(
                    "Warning: unparseable price '{}' for fuel '{}', treated as absent",
                    raw, fuel
                ),
            }
        }

        Ok(Some(Self {
            province: field(columns.province).to_string(),
            municipality: field(columns.municipality).to_string(),
            locality: field(columns.locality).to_string(),
            postal_code: field(columns.postal_code).to_string(),
            address: field(columns.address).to_string(),
            margin: field(columns.margin).to_string(),
            schedule: field(columns.schedule).to_string(),
            brand: field(columns.brand).to_string(),
            station_type: field(columns.station_type).to_string(),
            observed_at,
            location_wkt: format_point(longitude, latitude),
            prices,
        }))
    }
}

// =============================================================================
// Dimension resolution
// =============================================================================

/// Lookup and insert statements for one dimension kind. Hierarchical kinds
/// bind the parent id as $2 in both statements.
struct Dimension {
    label: &'static str,
    select_sql: &'static str,
    insert_sql: &'static str,
}

const PROVINCE: Dimension = Dimension {
    label: "province",
    select_sql: "SELECT province_id FROM province WHERE province_name = $1",
    insert_sql: "INSERT INTO province (province_name) VALUES ($1) RETURNING province_id",
};

const MUNICIPALITY: Dimension = Dimension {
    label: "municipality",
    select_sql:
        "SELECT municipality_id FROM municipality WHERE municipality_name = $1 AND province_id = $2",
    insert_sql:
        "INSERT INTO municipality (municipality_name, province_id) VALUES ($1, $2) RETURNING municipality_id",
};

const LOCALITY: Dimension = Dimension {
    label: "locality",
    select_sql:
        "SELECT locality_id FROM locality WHERE locality_name = $1 AND municipality_id = $2",
    insert_sql:
        "INSERT INTO locality (locality_name, municipality_id) VALUES ($1, $2) RETURNING locality_id",
};

const POSTAL_CODE: Dimension = Dimension {
    label: "postal code",
    select_sql:
        "SELECT postal_code_id FROM postal_code WHERE postal_code = $1 AND locality_id = $2",
    insert_sql:
        "INSERT INTO postal_code (postal_code, locality_id) VALUES ($1, $2) RETURNING postal_code_id",
};

const MARGIN: Dimension = Dimension {
    label: "margin",
    select_sql: "SELECT margin_id FROM margin WHERE margin_name = $1",
    insert_sql: "INSERT INTO margin (margin_name) VALUES ($1) RETURNING margin_id",
};

const SCHEDULE: Dimension = Dimension {
    label: "schedule",
    select_sql: "SELECT schedule_id FROM schedule WHERE schedule_description = $1",
    insert_sql:
        "INSERT INTO schedule (schedule_description) VALUES ($1) RETURNING schedule_id",
};

const BRAND: Dimension = Dimension {
    label: "brand",
    select_sql: "SELECT brand_id FROM brand WHERE brand_name = $1",
    insert_sql: "INSERT INTO brand (brand_name) VALUES ($1) RETURNING brand_id",
};

const STATION_TYPE: Dimension = Dimension {
    label: "station type",
    select_sql: "SELECT station_type_id FROM station_type WHERE station_type_name = $1",
    insert_sql:
        "INSERT INTO station_type (station_type_name) VALUES ($1) RETURNING station_type_id",
};

const FUEL_TYPE: Dimension = Dimension {
    label: "fuel type",
    select_sql: "SELECT fuel_type_id FROM fuel_type WHERE fuel_type_name = $1",
    insert_sql: "INSERT INTO fuel_type (fuel_type_name) VALUES ($1) RETURNING fuel_type_id",
};

// Station lookup uses the exact-equality spatial predicate, not text
// comparison of the stored geometry.
const SELECT_STATION_SQL: &str =
    "SELECT station_id FROM station WHERE ST_Equals(location, ST_GeomFromText($1, 4326))";
const INSERT_STATION_SQL: &str = "INSERT INTO station \
     (address, margin_id, location, postal_code_id, brand_id, schedule_id, station_type_id) \
     VALUES ($1, $2, ST_GeomFromText($3, 4326), $4, $5, $6, $7) \
     RETURNING station_id";

const SELECT_PRICE_SQL: &str = "SELECT price_id FROM fuel_price \
     WHERE station_id = $1 AND fuel_type_id = $2 AND observed_at = $3";

/// Resolve a natural key to its surrogate id: cache, then lookup, then
/// insert-and-cache. At most one insert happens per distinct key per run.
async fn resolve_dimension(
    tx: &mut Transaction<'static, Postgres>,
    cache: &mut HashMap<String, i32>,
    dim: &Dimension,
    name: &str,
    parent_id: Option<i32>,
) -> Result<i32, ImportError> {
    let key = cache_key(name, parent_id);
    if let Some(&id) = cache.get(&key) {
        return Ok(id);
    }

    let mut select = sqlx::query_scalar::<_, i32>(dim.select_sql).bind(name);
    if let Some(parent) = parent_id {
        select = select.bind(parent);
    }

    let id = match select.fetch_optional(&mut **tx).await? {
        Some(id) => id,
        None => {
            let mut insert = sqlx::query_scalar::<_, i32>(dim.insert_sql).bind(name);
            if let Some(parent) = parent_id {
                insert = insert.bind(parent);
            }
            insert.fetch_optional(&mut **tx).await?.ok_or_else(|| {
                ImportError::MissingGeneratedId {
                    dimension: dim.label,
                    key: name.to_string(),
                }
            })?
        }
    };

    cache.insert(key, id);
    Ok(id)
}

// =============================================================================
// Import session
// =============================================================================

/// A queued price fact awaiting the next batch flush.
struct PriceRow {
    station_id: i32,
    fuel_type_id: i32,
    price: f64,
    observed_at: NaiveDateTime,
}

/// Per-dimension id caches, created at run start and discarded with the
/// session. They are never persisted; a new run cold-starts.
#[derive(Default)]
struct DimensionCaches {
    provinces: HashMap<String, i32>,
    municipalities: HashMap<String, i32>,
    localities: HashMap<String, i32>,
    postal_codes: HashMap<String, i32>,
    margins: HashMap<String, i32>,
    schedules: HashMap<String, i32>,
    brands: HashMap<String, i32>,
    station_types: HashMap<String, i32>,
    fuel_types: HashMap<String, i32>,
    stations: HashMap<String, i32>,
}

#[derive(Debug, Default)]
struct ImportStats {
    files_processed: u64,
    files_skipped: u64,
    batches_flushed: u64,
    records_processed: u64,
    records_skipped: u64,
    prices_inserted: u64,
    prices_duplicate: u64,
}

/// Rows per INSERT statement when flushing queued prices. Four binds per
/// row must stay under the 65535-parameter Postgres limit.
const PRICE_INSERT_CHUNK: usize = 10_000;

/// One import run: owns the transaction, the dimension caches, and the
/// pending fact queue. Dropped (or aborted) without commit, the run leaves
/// no trace in the store.
struct ImportSession {
    tx: Transaction<'static, Postgres>,
    batch_size: usize,
    caches: DimensionCaches,
    pending_prices: Vec<PriceRow>,
    /// Keys of queued-but-unflushed facts; the store lookup cannot see
    /// these, so duplicates inside one batch are caught here.
    pending_keys: HashSet<(i32, i32, NaiveDateTime)>,
    stats: ImportStats,
}

impl ImportSession {
    fn new(tx: Transaction<'static, Postgres>, batch_size: usize) -> Self {
        Self {
            tx,
            batch_size: batch_size.max(1),
            caches: DimensionCaches::default(),
            pending_prices: Vec::new(),
            pending_keys: HashSet::new(),
            stats: ImportStats::default(),
        }
    }

    async fn import_files(&mut self, files: &[PathBuf]) -> Result<(), ImportError> {
        for path in files {
            println!("\nProcessing {}", path.display());
            self.process_file(path).await?;
        }
        Ok(())
    }

    /// Read one CSV file and feed its rows through the batch loop.
    /// I/O problems and header defects skip the file; anything touching
    /// the store propagates and aborts the run.
    async fn process_file(&mut self, path: &Path) -> Result<(), ImportError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Warning: skipping unreadable file {}: {}", path.display(), e);
                self.stats.files_skipped += 1;
                return Ok(());
            }
        };
        let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let headers = match reader.headers() {
            Ok(headers) if !headers.is_empty() => headers.clone(),
            Ok(_) => {
                eprintln!("Warning: file {} is empty, skipping", path.display());
                self.stats.files_skipped += 1;
                return Ok(());
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not read header of {}: {}, skipping",
                    path.display(),
                    e
                );
                self.stats.files_skipped += 1;
                return Ok(());
            }
        };

        let columns = match ColumnMap::from_headers(&headers) {
            Ok(columns) => columns,
            Err(e) => {
                eprintln!("Warning: {} in {}, skipping file", e, path.display());
                self.stats.files_skipped += 1;
                return Ok(());
            }
        };

        let mut batch: Vec<csv::StringRecord> = Vec::with_capacity(self.batch_size);
        for result in reader.records() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    eprintln!("Warning: skipping malformed line in {}: {}", path.display(), e);
                    self.stats.records_skipped += 1;
                    continue;
                }
            };
            batch.push(record);
            if batch.len() == self.batch_size {
                self.process_batch(&batch, &columns).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.process_batch(&batch, &columns).await?;
        }

        self.stats.files_processed += 1;
        Ok(())
    }

    /// Resolve every record of the batch, then issue one consolidated
    /// write for the queued price facts.
    async fn process_batch(
        &mut self,
        rows: &[csv::StringRecord],
        columns: &ColumnMap,
    ) -> Result<(), ImportError> {
        for row in rows {
            match StationRecord::from_csv(row, columns)? {
                Some(record) => {
                    self.process_record(&record).await?;
                    self.stats.records_processed += 1;
                }
                None => self.stats.records_skipped += 1,
            }
        }

        let flushed = self.flush_prices().await?;
        self.stats.batches_flushed += 1;
        println!("  Processed {} records ({} prices inserted)", rows.len(), flushed);
        Ok(())
    }

    /// Resolve the full dimension chain for one record, then queue its
    /// price facts. Parents resolve before children; the station needs
    /// all seven of its foreign dimensions first.
    async fn process_record(&mut self, record: &StationRecord) -> Result<(), ImportError> {
        let province_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.provinces,
            &PROVINCE,
            &record.province,
            None,
        )
        .await?;
        let municipality_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.municipalities,
            &MUNICIPALITY,
            &record.municipality,
            Some(province_id),
        )
        .await?;
        let locality_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.localities,
            &LOCALITY,
            &record.locality,
            Some(municipality_id),
        )
        .await?;
        let postal_code_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.postal_codes,
            &POSTAL_CODE,
            &record.postal_code,
            Some(locality_id),
        )
        .await?;
        let margin_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.margins,
            &MARGIN,
            &record.margin,
            None,
        )
        .await?;
        let schedule_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.schedules,
            &SCHEDULE,
            &record.schedule,
            None,
        )
        .await?;
        let brand_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.brands,
            &BRAND,
            &record.brand,
            None,
        )
        .await?;
        let station_type_id = resolve_dimension(
            &mut self.tx,
            &mut self.caches.station_types,
            &STATION_TYPE,
            &record.station_type,
            None,
        )
        .await?;

        let station_id = self
            .resolve_station(
                record,
                margin_id,
                postal_code_id,
                brand_id,
                schedule_id,
                station_type_id,
            )
            .await?;

        self.queue_prices(station_id, record).await?;
        Ok(())
    }

    /// Station variant of the resolution protocol: the natural key is the
    /// formatted location string, so identical coordinates collapse to one
    /// station even when address or brand text differs.
    async fn resolve_station(
        &mut self,
        record: &StationRecord,
        margin_id: i32,
        postal_code_id: i32,
        brand_id: i32,
        schedule_id: i32,
        station_type_id: i32,
    ) -> Result<i32, ImportError> {
        if let Some(&id) = self.caches.stations.get(&record.location_wkt) {
            return Ok(id);
        }

        let existing = sqlx::query_scalar::<_, i32>(SELECT_STATION_SQL)
            .bind(&record.location_wkt)
            .fetch_optional(&mut *self.tx)
            .await?;

        let id = match existing {
            Some(id) => id,
            None => sqlx::query_scalar::<_, i32>(INSERT_STATION_SQL)
                .bind(&record.address)
                .bind(margin_id)
                .bind(&record.location_wkt)
                .bind(postal_code_id)
                .bind(brand_id)
                .bind(schedule_id)
                .bind(station_type_id)
                .fetch_optional(&mut *self.tx)
                .await?
                .ok_or_else(|| ImportError::MissingGeneratedId {
                    dimension: "station",
                    key: record.location_wkt.clone(),
                })?,
        };

        self.caches.stations.insert(record.location_wkt.clone(), id);
        Ok(id)
    }

    /// Queue one price fact per fuel with a value, skipping observations
    /// the store (or the pending queue) already holds. The existence check
    /// is deliberately uncached: timestamps rarely repeat across records,
    /// so a cache would just grow without hits.
    async fn queue_prices(
        &mut self,
        station_id: i32,
        record: &StationRecord,
    ) -> Result<(), ImportError> {
        for (fuel, price) in &record.prices {
            let fuel_type_id = resolve_dimension(
                &mut self.tx,
                &mut self.caches.fuel_types,
                &FUEL_TYPE,
                fuel,
                None,
            )
            .await?;

            let key = (station_id, fuel_type_id, record.observed_at);
            if self.pending_keys.contains(&key) {
                self.stats.prices_duplicate += 1;
                continue;
            }

            let existing = sqlx::query_scalar::<_, i64>(SELECT_PRICE_SQL)
                .bind(station_id)
                .bind(fuel_type_id)
                .bind(record.observed_at)
                .fetch_optional(&mut *self.tx)
                .await?;
            if existing.is_some() {
                self.stats.prices_duplicate += 1;
                continue;
            }

            self.pending_keys.insert(key);
            self.pending_prices.push(PriceRow {
                station_id,
                fuel_type_id,
                price: *price,
                observed_at: record.observed_at,
            });
        }
        Ok(())
    }

    /// One consolidated write for everything queued since the last flush,
    /// chunked to stay under the bind-parameter limit.
    async fn flush_prices(&mut self) -> Result<usize, ImportError> {
        let flushed = self.pending_prices.len();
        if flushed == 0 {
            return Ok(0);
        }

        for chunk in self.pending_prices.chunks(PRICE_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fuel_price (station_id, fuel_type_id, price, observed_at) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.station_id)
                    .push_bind(row.fuel_type_id)
                    .push_bind(row.price)
                    .push_bind(row.observed_at);
            });
            builder.build().execute(&mut *self.tx).await?;
        }

        self.stats.prices_inserted += flushed as u64;
        self.pending_prices.clear();
        self.pending_keys.clear();
        Ok(flushed)
    }

    /// Commit the run. Everything becomes durably visible at once.
    async fn finish(self) -> Result<ImportStats, ImportError> {
        let ImportSession { tx, stats, .. } = self;
        tx.commit().await?;
        Ok(stats)
    }

    /// Roll the whole run back; nothing it wrote survives.
    async fn abort(self) {
        let ImportSession { tx, .. } = self;
        match tx.rollback().await {
            Ok(()) => println!("Transaction rolled back; no rows from this run were committed"),
            Err(e) => eprintln!("Warning: rollback failed: {}", e),
        }
    }
}

// =============================================================================
// File discovery
// =============================================================================

/// List the CSV files of the import directory, sorted by name so runs are
/// reproducible. A missing or unreadable directory is reported and yields
/// an empty run, matching the per-file skip policy.
async fn discover_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!(
                "Warning: could not read CSV directory {}: {}",
                dir.display(),
                e
            );
            return Ok(Vec::new());
        }
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    println!("=== Fuel Prices Importer ===");
    println!("CSV directory: {}", args.csv_dir.display());
    println!("Batch size: {}", args.batch_size);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let files = discover_csv_files(&args.csv_dir).await?;
    if files.is_empty() {
        println!("No CSV files found in {}", args.csv_dir.display());
        return Ok(());
    }
    println!("Found {} CSV file(s)", files.len());

    // The whole run lives in this transaction: auto-commit is effectively
    // off until the final commit below.
    let tx = pool.begin().await.context("Failed to open transaction")?;
    let mut session = ImportSession::new(tx, args.batch_size);

    match session.import_files(&files).await {
        Ok(()) => {
            let stats = session.finish().await.context("Failed to commit import")?;
            println!("\n=== Import Summary ===");
            println!("Files processed: {}", stats.files_processed);
            println!("Files skipped: {}", stats.files_skipped);
            println!("Batches flushed: {}", stats.batches_flushed);
            println!("Records processed: {}", stats.records_processed);
            println!("Records skipped: {}", stats.records_skipped);
            println!("Prices inserted: {}", stats.prices_inserted);
            println!("Duplicate prices skipped: {}", stats.prices_duplicate);
            Ok(())
        }
        Err(e) => {
            eprintln!("Import failed: {}", e);
            session.abort().await;
            Err(e.into())
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn headers(cols: &[&str]) -> csv::StringRecord {
        csv::StringRecord::from(cols.to_vec())
    }

    const TEST_HEADERS: &[&str] = &[
        "Province",
        "Municipality",
        "Locality",
        "PostalCode",
        "Address",
        "Margin",
        "ObservationTimestamp",
        "StationType",
        "Brand",
        "Schedule",
        "Longitude",
        "Latitude",
        "Price Diesel A",
        "Price Gasoline 95",
    ];

    fn test_columns() -> ColumnMap {
        ColumnMap::from_headers(&headers(TEST_HEADERS)).unwrap()
    }

    fn test_row(lon: &str, lat: &str, ts: &str, diesel: &str, gasoline: &str) -> csv::StringRecord {
        csv::StringRecord::from(vec![
            "MADRID",
            "MADRID",
            "Madrid",
            "28001",
            "CALLE MAYOR 1",
            "D",
            ts,
            "Terrestre",
            "REPSOL",
            "L-D: 24H",
            lon,
            lat,
            diesel,
            gasoline,
        ])
    }

    // -------------------------------------------------------------------------
    // DECIMAL PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_decimal_comma_separator() {
        assert_eq!(parse_decimal("1,234"), Some(1.234));
    }

    #[test]
    fn test_parse_decimal_dot_separator() {
        assert_eq!(parse_decimal("1.234"), Some(1.234));
    }

    #[test]
    fn test_parse_decimal_negative() {
        assert_eq!(parse_decimal("-1,85643"), Some(-1.85643));
    }

    #[test]
    fn test_parse_decimal_empty_is_absent() {
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("   "), None);
    }

    #[test]
    fn test_parse_decimal_malformed_is_absent() {
        assert_eq!(parse_decimal("abc"), None);
        assert_eq!(parse_decimal("1,2,3"), None);
    }

    #[test]
    fn test_parse_decimal_zero_is_a_value() {
        // A genuine zero stays distinguishable from absence.
        assert_eq!(parse_decimal("0"), Some(0.0));
        assert_eq!(parse_decimal("0,000"), Some(0.0));
    }

    // -------------------------------------------------------------------------
    // TIMESTAMP PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_timestamp_valid() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-05-17 08:30:00").unwrap(), expected);
    }

    #[test]
    fn test_parse_timestamp_rejects_other_formats() {
        assert!(parse_timestamp("17/05/2024 08:30:00").is_err());
        assert!(parse_timestamp("2024-05-17").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn test_parse_timestamp_error_names_the_value() {
        let err = parse_timestamp("not-a-date").unwrap_err();
        assert!(err.to_string().contains("not-a-date"));
    }

    // -------------------------------------------------------------------------
    // WKT FORMATTING
    // -------------------------------------------------------------------------

    #[test]
    fn test_format_point_longitude_first() {
        assert_eq!(format_point(-1.85643, 38.994349), "POINT(-1.85643 38.994349)");
    }

    #[test]
    fn test_format_point_uses_dot_separator() {
        let wkt = format_point(2.5, -3.25);
        assert!(wkt.contains("2.5"));
        assert!(!wkt.contains(','));
    }

    #[test]
    fn test_format_point_identical_coordinates_identical_key() {
        assert_eq!(format_point(1.5, 2.5), format_point(1.5, 2.5));
    }

    #[test]
    fn test_format_point_differing_coordinate_differs() {
        assert_ne!(format_point(1.5, 2.5), format_point(1.5, 2.500001));
        assert_ne!(format_point(1.5, 2.5), format_point(1.500001, 2.5));
    }

    // -------------------------------------------------------------------------
    // CACHE KEYS
    // -------------------------------------------------------------------------

    #[test]
    fn test_cache_key_parentless_is_name() {
        assert_eq!(cache_key("REPSOL", None), "REPSOL");
    }

    #[test]
    fn test_cache_key_hierarchical_appends_parent() {
        assert_eq!(cache_key("Madrid", Some(7)), "Madrid_7");
    }

    #[test]
    fn test_cache_key_same_name_different_parent_distinct() {
        // Two municipalities named alike in different provinces must not
        // share a cache slot.
        assert_ne!(cache_key("Villanueva", Some(1)), cache_key("Villanueva", Some(2)));
    }

    // -------------------------------------------------------------------------
    // COLUMN MAPPING
    // -------------------------------------------------------------------------

    #[test]
    fn test_column_map_resolves_english_headers() {
        let columns = test_columns();
        assert_eq!(columns.province, 0);
        assert_eq!(columns.latitude, 11);
    }

    #[test]
    fn test_column_map_accepts_spanish_aliases() {
        let columns = ColumnMap::from_headers(&headers(&[
            "Provincia",
            "Municipio",
            "Localidad",
            "Código postal",
            "Dirección",
            "Margen",
            "Toma de datos",
            "Tipo estación",
            "Rótulo",
            "Horario",
            "Longitud",
            "Latitud",
            "Precio Gasóleo A",
        ]))
        .unwrap();
        assert_eq!(columns.observed_at, 6);
        assert_eq!(columns.fuel_columns, vec![(12, "Gasóleo A".to_string())]);
    }

    #[test]
    fn test_column_map_missing_required_column_fails() {
        let result = ColumnMap::from_headers(&headers(&["Province", "Municipality"]));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Locality"));
    }

    #[test]
    fn test_fuel_column_discovery_strips_prefix() {
        let columns = test_columns();
        assert_eq!(
            columns.fuel_columns,
            vec![
                (12, "Diesel A".to_string()),
                (13, "Gasoline 95".to_string()),
            ]
        );
    }

    #[test]
    fn test_fuel_column_discovery_trims_name() {
        let mut cols: Vec<&str> = TEST_HEADERS.to_vec();
        cols[12] = "Price  Diesel B ";
        let columns = ColumnMap::from_headers(&headers(&cols)).unwrap();
        assert_eq!(columns.fuel_columns[0], (12, "Diesel B".to_string()));
    }

    #[test]
    fn test_fuel_column_bare_prefix_ignored() {
        let mut cols: Vec<&str> = TEST_HEADERS.to_vec();
        cols[12] = "Price ";
        let columns = ColumnMap::from_headers(&headers(&cols)).unwrap();
        assert_eq!(columns.fuel_columns, vec![(13, "Gasoline 95".to_string())]);
    }

    // -------------------------------------------------------------------------
    // RECORD PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_record_parses_complete_row() {
        let columns = test_columns();
        let row = test_row("-3.70379", "40.416775", "2024-05-17 08:30:00", "1,459", "1,639");
        let record = StationRecord::from_csv(&row, &columns).unwrap().unwrap();

        assert_eq!(record.province, "MADRID");
        assert_eq!(record.location_wkt, "POINT(-3.70379 40.416775)");
        assert_eq!(
            record.prices,
            vec![
                ("Diesel A".to_string(), 1.459),
                ("Gasoline 95".to_string(), 1.639),
            ]
        );
    }

    #[test]
    fn test_record_missing_coordinate_skips_row() {
        let columns = test_columns();
        let row = test_row("", "40.416775", "2024-05-17 08:30:00", "1,459", "");
        assert!(StationRecord::from_csv(&row, &columns).unwrap().is_none());
    }

    #[test]
    fn test_record_malformed_coordinate_skips_row() {
        let columns = test_columns();
        let row = test_row("-3.70379", "junk", "2024-05-17 08:30:00", "1,459", "");
        assert!(StationRecord::from_csv(&row, &columns).unwrap().is_none());
    }

    #[test]
    fn test_record_zero_coordinates_are_kept() {
        // An explicit zero is a legitimate location, not absence.
        let columns = test_columns();
        let row = test_row("0", "0", "2024-05-17 08:30:00", "1,459", "");
        let record = StationRecord::from_csv(&row, &columns).unwrap().unwrap();
        assert_eq!(record.location_wkt, "POINT(0 0)");
    }

    #[test]
    fn test_record_empty_price_queues_nothing() {
        let columns = test_columns();
        let row = test_row("-3.70379", "40.416775", "2024-05-17 08:30:00", "", "1,639");
        let record = StationRecord::from_csv(&row, &columns).unwrap().unwrap();
        assert_eq!(record.prices, vec![("Gasoline 95".to_string(), 1.639)]);
    }

    #[test]
    fn test_record_malformed_price_queues_nothing() {
        let columns = test_columns();
        let row = test_row("-3.70379", "40.416775", "2024-05-17 08:30:00", "n/a", "");
        let record = StationRecord::from_csv(&row, &columns).unwrap().unwrap();
        assert!(record.prices.is_empty());
    }

    #[test]
    fn test_record_bad_timestamp_is_fatal() {
        let columns = test_columns();
        let row = test_row("-3.70379", "40.416775", "17-05-2024", "1,459", "");
        assert!(StationRecord::from_csv(&row, &columns).is_err());
    }

    #[test]
    fn test_record_empty_timestamp_is_fatal() {
        let columns = test_columns();
        let row = test_row("-3.70379", "40.416775", "", "1,459", "");
        assert!(StationRecord::from_csv(&row, &columns).is_err());
    }

    #[test]
    fn test_record_truncated_row_without_coordinates_is_skipped() {
        let columns = test_columns();
        let row = csv::StringRecord::from(vec!["MADRID", "MADRID", "Madrid"]);
        assert!(StationRecord::from_csv(&row, &columns).unwrap().is_none());
    }

    #[test]
    fn test_identical_coordinates_share_station_key() {
        // Same location, different address and brand: one station.
        let columns = test_columns();
        let a = csv::StringRecord::from(vec![
            "MADRID", "MADRID", "Madrid", "28001", "CALLE MAYOR 1", "D",
            "2024-05-17 08:30:00", "Terrestre", "REPSOL", "L-D: 24H",
            "-3.70379", "40.416775", "1,459", "",
        ]);
        let b = csv::StringRecord::from(vec![
            "MADRID", "MADRID", "Madrid", "28001", "AVENIDA SUR 9", "I",
            "2024-05-18 08:30:00", "Terrestre", "CEPSA", "L-V: 07:00-22:00",
            "-3.70379", "40.416775", "1,479", "",
        ]);
        let ra = StationRecord::from_csv(&a, &columns).unwrap().unwrap();
        let rb = StationRecord::from_csv(&b, &columns).unwrap().unwrap();
        assert_eq!(ra.location_wkt, rb.location_wkt);
    }
}
