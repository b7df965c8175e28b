//! HTTP API over the hub and its settlement engine.

use crate::service::EibcService;
use axum::{
	extract::{Path, Query, State},
	http::StatusCode,
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use eibc_types::{
	serde_helpers, Amount, BankKeeper, ChainAdapter, EibcError, Height, InboundTransfer, OrderFilter,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument};

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Clone)]
struct AppState {
	service: Arc<EibcService>,
}

pub fn router(service: Arc<EibcService>) -> Router {
	Router::new()
		// Service
		.route("/health", get(health_check))
		.route("/status", get(get_status))
		// Packets
		.route("/packets", get(list_packets).post(deliver_packet))
		.route("/packets/{id}", get(get_packet))
		// Demand orders
		.route("/orders", get(list_orders))
		.route("/orders/{id}", get(get_order))
		.route("/orders/{id}/fulfill", post(fulfill_order))
		// Forwards
		.route("/forwards", get(list_forwards))
		.route("/forwards/{id}", get(get_forward))
		.route("/forwards/{id}/cancel", post(cancel_forward))
		// Rollapps
		.route("/rollapps/{id}/transfers", post(rollapp_transfer))
		.route("/rollapps/{id}/state-updates", post(submit_state_update))
		.route("/rollapps/{id}/revert", post(revert_rollapp))
		.route("/rollapps/{id}/faucet", post(rollapp_faucet))
		// Hub queries
		.route("/balances/{address}", get(get_balances))
		.route("/faucet", post(faucet))
		.route("/events", get(get_events))
		.route("/txs/{hash}", get(get_transaction))
		.with_state(AppState { service })
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
}

#[instrument(skip(service))]
pub async fn start_http_server(service: Arc<EibcService>, host: String, port: u16) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
	info!("API server listening on {}:{}", host, port);
	axum::serve(listener, router(service)).await?;
	Ok(())
}

/// Maps engine errors onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(EibcError);

impl From<EibcError> for ApiError {
	fn from(err: EibcError) -> Self {
		Self(err)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			EibcError::NotFound(_) => StatusCode::NOT_FOUND,
			EibcError::Memo(_)
			| EibcError::Ledger(_)
			| EibcError::Bank(_)
			| EibcError::Settlement(_)
			| EibcError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
			EibcError::Forwarding(_) => StatusCode::CONFLICT,
			EibcError::TransientRead { .. } | EibcError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
			EibcError::Chain(_) => StatusCode::BAD_GATEWAY,
			EibcError::Config(_) | EibcError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		(status, Json(json!({ "error": self.0.to_string() }))).into_response()
	}
}

fn to_json(value: impl serde::Serialize) -> ApiResult {
	serde_json::to_value(value)
		.map(Json)
		.map_err(|e| ApiError(EibcError::Other(e.into())))
}

/// 200 while the engine is running
async fn health_check(State(state): State<AppState>) -> StatusCode {
	if state.service.hub().engine().lifecycle().is_running().await {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	}
}

async fn get_status(State(state): State<AppState>) -> Json<Value> {
	let service = &state.service;
	let engine = service.hub().engine();

	Json(json!({
		"status": engine.lifecycle().state().await.to_string(),
		"hub": {
			"chain_id": service.config().hub.chain_id,
			"height": service.hub().current_height().await,
		},
		"orders": engine.stats().await,
		"forwards_held": engine.forwarding().held(),
		"pending_packets": engine.pending_packets().len(),
		"events_watched_to": service.watched_height(),
		"started_at": service.started_at().to_rfc3339(),
		"timestamp": chrono::Utc::now().timestamp()
	}))
}

async fn deliver_packet(State(state): State<AppState>, Json(transfer): Json<InboundTransfer>) -> ApiResult {
	let (outcome, tx) = state.service.hub().deliver_packet(transfer).await?;
	to_json(json!({ "result": outcome, "tx": tx }))
}

async fn list_packets(State(state): State<AppState>) -> ApiResult {
	to_json(state.service.hub().engine().pending_packets())
}

async fn get_packet(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
	let packet = state
		.service
		.hub()
		.engine()
		.packet(&id)
		.ok_or_else(|| EibcError::NotFound(format!("packet {}", id)))?;
	to_json(packet)
}

async fn list_orders(State(state): State<AppState>, Query(filter): Query<OrderFilter>) -> ApiResult {
	to_json(state.service.hub().engine().orders(&filter).await)
}

async fn get_order(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
	let order = state
		.service
		.hub()
		.engine()
		.order(&id)
		.await
		.map_err(EibcError::from)?;
	to_json(order)
}

#[derive(Debug, Deserialize)]
struct FulfillBody {
	fulfiller: String,
}

/// Failed executions are still included; see the transaction's `code`.
async fn fulfill_order(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(body): Json<FulfillBody>,
) -> ApiResult {
	to_json(state.service.hub().fulfill(&id, &body.fulfiller).await?)
}

async fn list_forwards(State(state): State<AppState>) -> ApiResult {
	to_json(state.service.hub().engine().forwards())
}

async fn get_forward(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
	let forward = state
		.service
		.hub()
		.engine()
		.forward(&id)
		.ok_or_else(|| EibcError::NotFound(format!("forward {}", id)))?;
	to_json(forward)
}

async fn cancel_forward(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
	to_json(state.service.hub().cancel_forward(&id).await?)
}

#[derive(Debug, Deserialize)]
struct TransferBody {
	sender: String,
	receiver: String,
	#[serde(with = "serde_helpers::amount")]
	amount: Amount,
	#[serde(default)]
	memo: String,
}

async fn rollapp_transfer(
	State(state): State<AppState>,
	Path(rollapp_id): Path<String>,
	Json(body): Json<TransferBody>,
) -> ApiResult {
	let (packet, outcome, tx) = state
		.service
		.send_from_rollapp(&rollapp_id, &body.sender, &body.receiver, body.amount, &body.memo)
		.await?;
	to_json(json!({ "packet": packet, "result": outcome, "tx": tx }))
}

async fn submit_state_update(State(state): State<AppState>, Path(rollapp_id): Path<String>) -> ApiResult {
	to_json(state.service.submit_state_update(&rollapp_id).await?)
}

#[derive(Debug, Deserialize)]
struct RevertBody {
	from_height: Height,
}

async fn revert_rollapp(
	State(state): State<AppState>,
	Path(rollapp_id): Path<String>,
	Json(body): Json<RevertBody>,
) -> ApiResult {
	state.service.rollapp(&rollapp_id)?;
	to_json(
		state
			.service
			.hub()
			.revert_rollapp(&rollapp_id, body.from_height)
			.await?,
	)
}

#[derive(Debug, Deserialize)]
struct FaucetBody {
	address: String,
	/// Defaults to the hub's native denom.
	denom: Option<String>,
	#[serde(with = "serde_helpers::amount")]
	amount: Amount,
}

async fn faucet(State(state): State<AppState>, Json(body): Json<FaucetBody>) -> ApiResult {
	let denom = body
		.denom
		.unwrap_or_else(|| state.service.config().hub.denom.clone());
	state.service.faucet(&body.address, &denom, body.amount).await?;
	let balance = state.service.hub().bank().balance(&body.address, &denom).await;
	to_json(json!({ "address": body.address, "denom": denom, "balance": balance.to_string() }))
}

async fn rollapp_faucet(
	State(state): State<AppState>,
	Path(rollapp_id): Path<String>,
	Json(body): Json<FaucetBody>,
) -> ApiResult {
	state
		.service
		.rollapp_faucet(&rollapp_id, &body.address, body.amount)
		.await?;
	let rollapp = state.service.rollapp(&rollapp_id)?;
	let balance = rollapp.bank().balance(&body.address, rollapp.denom()).await;
	to_json(json!({
		"address": body.address,
		"denom": rollapp.denom(),
		"balance": balance.to_string(),
	}))
}

#[derive(Debug, Deserialize)]
struct BalanceQuery {
	denom: Option<String>,
}

async fn get_balances(
	State(state): State<AppState>,
	Path(address): Path<String>,
	Query(query): Query<BalanceQuery>,
) -> ApiResult {
	let bank = state.service.hub().bank();
	let balances: Vec<Value> = match query.denom {
		Some(denom) => {
			let amount = bank.balance(&address, &denom).await;
			vec![json!({ "denom": denom, "amount": amount.to_string() })]
		}
		None => bank
			.balances_of(&address)
			.await
			.into_iter()
			.map(|(denom, amount)| json!({ "denom": denom, "amount": amount.to_string() }))
			.collect(),
	};
	to_json(json!({ "address": address, "balances": balances }))
}

#[derive(Debug, Deserialize)]
struct EventQuery {
	from: Option<Height>,
	to: Option<Height>,
	kind: Option<String>,
}

async fn get_events(State(state): State<AppState>, Query(query): Query<EventQuery>) -> ApiResult {
	let latest = state.service.hub().current_height().await;
	let from = query.from.unwrap_or(1);
	let to = query.to.unwrap_or(latest).min(latest);
	if from > to {
		return to_json(json!({ "events": [], "failed_heights": [] }));
	}

	let (events, errors) = state
		.service
		.scanner()
		.collect(from..=to, query.kind.as_deref())
		.await;
	let failed: Vec<Value> = errors
		.iter()
		.map(|e| json!({ "height": e.height(), "error": e.to_string() }))
		.collect();
	to_json(json!({ "events": events, "failed_heights": failed }))
}

async fn get_transaction(State(state): State<AppState>, Path(hash): Path<String>) -> ApiResult {
	let tx = state
		.service
		.hub()
		.get_transaction(&hash)
		.await?
		.ok_or_else(|| EibcError::NotFound(format!("transaction {}", hash)))?;
	to_json(tx)
}
