//! API Service - Read-only queries over the fuel station price schema
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /fuel-types - List known fuel types
//! - GET /brands/top - Brand with the most stations of a type
//! - GET /stations/cheapest - Cheapest station for a fuel in a province
//! - GET /stations/cheapest-in-radius - Cheapest station for a fuel near a point
//! - GET /provinces/priciest - Province with the highest price for a fuel
//!   among stations of a type
//!
//! This service never writes: the importer owns the schema's lifecycle.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// SQL
// ============================================================================

const SQL_TOP_BRAND: &str = r#"
    SELECT b.brand_name, COUNT(s.station_id) AS station_count
    FROM station s
    JOIN brand b ON s.brand_id = b.brand_id
    JOIN station_type st ON s.station_type_id = st.station_type_id
    WHERE st.station_type_name = $1
    GROUP BY b.brand_name
    ORDER BY station_count DESC
    LIMIT 1
"#;

const SQL_CHEAPEST_IN_PROVINCE: &str = r#"
    SELECT s.address, b.brand_name, m.margin_name, MIN(fp.price) AS min_price
    FROM fuel_price fp
    JOIN station s ON fp.station_id = s.station_id
    JOIN brand b ON s.brand_id = b.brand_id
    JOIN margin m ON s.margin_id = m.margin_id
    JOIN postal_code pc ON s.postal_code_id = pc.postal_code_id
    JOIN locality l ON pc.locality_id = l.locality_id
    JOIN municipality mu ON l.municipality_id = mu.municipality_id
    JOIN province p ON mu.province_id = p.province_id
    JOIN fuel_type ft ON fp.fuel_type_id = ft.fuel_type_id
    WHERE p.province_name = $1 AND ft.fuel_type_name = $2
    GROUP BY s.station_id, s.address, b.brand_name, m.margin_name
    ORDER BY min_price ASC
    LIMIT 1
"#;

const SQL_CHEAPEST_IN_RADIUS: &str = r#"
    SELECT s.address, b.brand_name, m.margin_name, fp.price, fp.observed_at,
           ST_DistanceSphere(s.location, ST_SetSRID(ST_MakePoint($1, $2), 4326)) / 1000.0
               AS distance_km
    FROM fuel_price fp
    JOIN station s ON fp.station_id = s.station_id
    JOIN brand b ON s.brand_id = b.brand_id
    JOIN margin m ON s.margin_id = m.margin_id
    JOIN postal_code pc ON s.postal_code_id = pc.postal_code_id
    JOIN locality l ON pc.locality_id = l.locality_id
    JOIN municipality mu ON l.municipality_id = mu.municipality_id
    JOIN fuel_type ft ON fp.fuel_type_id = ft.fuel_type_id
    WHERE ft.fuel_type_name = $3 AND mu.municipality_name = $4
      AND ST_DistanceSphere(s.location, ST_SetSRID(ST_MakePoint($1, $2), 4326))
              <= $5 * 1000.0
    ORDER BY fp.price ASC
    LIMIT 1
"#;

const SQL_PRICIEST_PROVINCE: &str = r#"
    SELECT p.province_name, fp.price, fp.observed_at
    FROM fuel_price fp
    JOIN station s ON fp.station_id = s.station_id
    JOIN station_type st ON s.station_type_id = st.station_type_id
    JOIN postal_code pc ON s.postal_code_id = pc.postal_code_id
    JOIN locality l ON pc.locality_id = l.locality_id
    JOIN municipality mu ON l.municipality_id = mu.municipality_id
    JOIN province p ON mu.province_id = p.province_id
    JOIN fuel_type ft ON fp.fuel_type_id = ft.fuel_type_id
    WHERE st.station_type_name = $1 AND ft.fuel_type_name = $2
    ORDER BY fp.price DESC
    LIMIT 1
"#;

const SQL_FUEL_TYPES: &str =
    "SELECT fuel_type_id, fuel_type_name FROM fuel_type ORDER BY fuel_type_name";

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct FuelTypeResponse {
    fuel_type_id: i32,
    fuel_type_name: String,
}

#[derive(Serialize, sqlx::FromRow)]
struct TopBrandResponse {
    brand_name: String,
    station_count: i64,
}

#[derive(Serialize, sqlx::FromRow)]
struct CheapestStationResponse {
    address: String,
    brand_name: String,
    margin_name: String,
    min_price: f64,
}

#[derive(Serialize, sqlx::FromRow)]
struct NearbyStationResponse {
    address: String,
    brand_name: String,
    margin_name: String,
    price: f64,
    observed_at: NaiveDateTime,
    distance_km: f64,
}

#[derive(Serialize, sqlx::FromRow)]
struct PriciestProvinceResponse {
    province_name: String,
    price: f64,
    observed_at: NaiveDateTime,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct TopBrandQuery {
    station_type: String,
}

#[derive(Deserialize)]
struct CheapestQuery {
    province: String,
    fuel: String,
}

#[derive(Deserialize)]
struct RadiusQuery {
    municipality: String,
    fuel: String,
    latitude: f64,
    longitude: f64,
    radius_km: Option<f64>,
}

#[derive(Deserialize)]
struct PriciestQuery {
    station_type: String,
    fuel: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn fuel_types_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let fuel_types: Result<Vec<FuelTypeResponse>, _> = sqlx::query_as(SQL_FUEL_TYPES)
        .fetch_all(&state.pool)
        .await;

    match fuel_types {
        Ok(f) => Json(serde_json::json!({ "fuel_types": f })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn top_brand_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopBrandQuery>,
) -> impl IntoResponse {
    let row: Result<Option<TopBrandResponse>, _> = sqlx::query_as(SQL_TOP_BRAND)
        .bind(&params.station_type)
        .fetch_optional(&state.pool)
        .await;

    match row {
        Ok(Some(brand)) => Json(brand).into_response(),
        Ok(None) => not_found(format!(
            "No stations found for station type '{}'",
            params.station_type
        )),
        Err(e) => internal_error(e),
    }
}

async fn cheapest_station_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheapestQuery>,
) -> impl IntoResponse {
    let row: Result<Option<CheapestStationResponse>, _> =
        sqlx::query_as(SQL_CHEAPEST_IN_PROVINCE)
            .bind(&params.province)
            .bind(&params.fuel)
            .fetch_optional(&state.pool)
            .await;

    match row {
        Ok(Some(station)) => Json(station).into_response(),
        Ok(None) => not_found(format!(
            "No prices found for '{}' in province '{}'",
            params.fuel, params.province
        )),
        Err(e) => internal_error(e),
    }
}

async fn cheapest_in_radius_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RadiusQuery>,
) -> impl IntoResponse {
    let radius_km = params.radius_km.unwrap_or(10.0);

    let row: Result<Option<NearbyStationResponse>, _> = sqlx::query_as(SQL_CHEAPEST_IN_RADIUS)
        .bind(params.longitude)
        .bind(params.latitude)
        .bind(&params.fuel)
        .bind(&params.municipality)
        .bind(radius_km)
        .fetch_optional(&state.pool)
        .await;

    match row {
        Ok(Some(station)) => Json(station).into_response(),
        Ok(None) => not_found(format!(
            "No stations within {} km in '{}' selling '{}'",
            radius_km, params.municipality, params.fuel
        )),
        Err(e) => internal_error(e),
    }
}

async fn priciest_province_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PriciestQuery>,
) -> impl IntoResponse {
    let row: Result<Option<PriciestProvinceResponse>, _> = sqlx::query_as(SQL_PRICIEST_PROVINCE)
        .bind(&params.station_type)
        .bind(&params.fuel)
        .fetch_optional(&state.pool)
        .await;

    match row {
        Ok(Some(province)) => Json(province).into_response(),
        Ok(None) => not_found(format!(
            "No prices found for '{}' at stations of type '{}'",
            params.fuel, params.station_type
        )),
        Err(e) => internal_error(e),
    }
}

fn not_found(message: String) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message })).into_response()
}

fn internal_error(e: sqlx::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Fuel Prices API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/fuel-types", get(fuel_types_handler))
        .route("/brands/top", get(top_brand_handler))
        .route("/stations/cheapest", get(cheapest_station_handler))
        .route("/stations/cheapest-in-radius", get(cheapest_in_radius_handler))
        .route("/provinces/priciest", get(priciest_province_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /fuel-types");
    println!("  GET /brands/top?station_type=");
    println!("  GET /stations/cheapest?province=&fuel=");
    println!("  GET /stations/cheapest-in-radius?municipality=&fuel=&latitude=&longitude=&radius_km=");
    println!("  GET /provinces/priciest?station_type=&fuel=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
