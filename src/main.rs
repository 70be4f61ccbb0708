mod ai;
mod config;
mod dots;
mod game;
mod registry;
mod scoring;
mod shuffle;
mod types;
mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use qrcode::QrCode;
use qrcode::render::svg;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing_subscriber::EnvFilter;

use crate::ai::{AiError, GenerateParams, QuestionGenerator};
use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::ws::AppState;

// ─── Routes ───────────────────────────────────────────────────────

/// Render a join link as an SVG QR code for the lobby screen.
async fn qr_handler(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let Some(url) = params.get("url").filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing url parameter").into_response();
    };
    let Ok(code) = QrCode::new(url.as_bytes()) else {
        return (StatusCode::BAD_REQUEST, "url too long to encode").into_response();
    };
    let image = code
        .render::<svg::Color>()
        .min_dimensions(200, 200)
        .dark_color(svg::Color("#1a1a2e"))
        .light_color(svg::Color("#ffffff"))
        .build();
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (header::CACHE_CONTROL, "public, max-age=86400"),
        ],
        image,
    )
        .into_response()
}

async fn generate_handler(
    State(state): State<AppState>,
    axum::Json(params): axum::Json<GenerateParams>,
) -> impl IntoResponse {
    let Some(generator) = state.generator.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({"error": "question generation is not configured"})),
        )
            .into_response();
    };
    match generator.generate(&params).await {
        Ok(quiz) => axum::Json(quiz).into_response(),
        Err(e) => {
            tracing::warn!("Question generation failed: {}", e);
            let status = match &e {
                AiError::BadRequest(_) => StatusCode::BAD_REQUEST,
                AiError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                axum::Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env());

    let generator = match &config.ai {
        Some(ai) => match QuestionGenerator::new(
            ai.base_url.clone(),
            ai.api_key.clone(),
            ai.model.clone(),
        ) {
            Ok(g) => Some(Arc::new(g)),
            Err(e) => {
                tracing::warn!("Question generation disabled: {}", e);
                None
            }
        },
        None => {
            tracing::info!("OPENAI_API_KEY not set, question generation disabled");
            None
        }
    };
    if config.admin_password.is_none() {
        tracing::info!("ADMIN_PASSWORD not set, admin channel disabled");
    }

    let registry = Registry::new();

    let state = AppState {
        registry,
        config: config.clone(),
        generator,
    };

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/qr", get(qr_handler))
        .route("/api/questions/generate", post(generate_handler))
        .fallback_service(ServeDir::new(&config.static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("Failed to bind");

    tracing::info!("QuizBlast server running on port {}", config.port);

    axum::serve(listener, app).await.unwrap();
}
