use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::QueryError;
use crate::lifecycle::Status;
use crate::query::facade::{CatalogItem, QueryFacade};

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct SalesParams {
    /// 逗号分隔：`ids=1,2,3`
    pub ids: String,
}

#[derive(Serialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// handler 的失败：NotReady → 503，其余是请求本身的问题
pub enum ApiError {
    NotReady,
    NotFound(u64),
    BadRequest(String),
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::NotReady => ApiError::NotReady,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            ApiError::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                QueryError::NotReady.to_string(),
            ),
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("asset {} not found", id)),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
        };
        (code, Json(ErrorBody { error: msg })).into_response()
    }
}

pub struct QueryServer {
    facade: Arc<QueryFacade>,
}

impl QueryServer {
    pub fn new(facade: Arc<QueryFacade>) -> Self {
        Self { facade }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/download", post(start_download_handler))
            .route("/download/cancel", post(cancel_download_handler))
            .route("/items/:id", get(item_handler))
            .route("/search", get(search_handler))
            .route("/sales", get(sales_handler))
            .route("/count", get(count_handler))
            .with_state(self.facade.clone())
    }

    pub async fn run(
        self,
        listen: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(listen).await?;
        tracing::info!("HTTP query server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

fn parse_ids(raw: &str) -> Result<Vec<u64>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("invalid asset id {:?}", s)))
        })
        .collect()
}

async fn status_handler(State(facade): State<Arc<QueryFacade>>) -> Json<Status> {
    Json(facade.status())
}

async fn start_download_handler(State(facade): State<Arc<QueryFacade>>) -> (StatusCode, Json<Status>) {
    (StatusCode::ACCEPTED, Json(facade.start_download()))
}

async fn cancel_download_handler(State(facade): State<Arc<QueryFacade>>) -> Json<Status> {
    Json(facade.cancel_download().await)
}

async fn item_handler(
    Path(id): Path<u64>,
    State(facade): State<Arc<QueryFacade>>,
) -> Result<Json<CatalogItem>, ApiError> {
    facade
        .lookup(id)?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

async fn search_handler(
    Query(params): Query<SearchParams>,
    State(facade): State<Arc<QueryFacade>>,
) -> Result<Json<Vec<CatalogItem>>, ApiError> {
    Ok(Json(facade.search(&params.q, params.limit)?))
}

async fn sales_handler(
    Query(params): Query<SalesParams>,
    State(facade): State<Arc<QueryFacade>>,
) -> Result<Json<BTreeMap<u64, u64>>, ApiError> {
    let ids = parse_ids(&params.ids)?;
    Ok(Json(facade.batch_sales(&ids).await?))
}

async fn count_handler(
    State(facade): State<Arc<QueryFacade>>,
) -> Result<Json<CountResponse>, ApiError> {
    Ok(Json(CountResponse {
        count: facade.count()?,
    }))
}
