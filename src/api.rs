//! # HTTP API
//!
//! Warp-served control surface: health, key management, balance queries,
//! and the trade endpoints. Every route except `/metrics` honors the
//! configured bearer / `X-API-Key` token. Validation and chain errors map
//! to 400, auth failures to 401, disabled private export to 403, method
//! mismatches to 405; a failed pre-send simulation is still a 200 carrying
//! `simulation_error`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::blockchain::ChainClient;
use crate::config::Config;
use crate::errors::AppError;
use crate::keys::KeysManager;
use crate::metrics;
use crate::trade::{parse_address, ApproveRequest, BuyRequest, SellRequest, TradeService};
use crate::txbuilder::erc20;

pub struct ApiContext {
    pub cfg: Arc<Config>,
    pub keys: Arc<KeysManager>,
    pub trade: Arc<TradeService>,
    pub client: Arc<dyn ChainClient>,
}

#[derive(Debug)]
struct Unauthorized;
impl warp::reject::Reject for Unauthorized {}

pub async fn run_api(
    ctx: Arc<ApiContext>,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let listen: SocketAddr = ctx
        .cfg
        .api
        .listen
        .parse()
        .map_err(|e| AppError::Api(format!("invalid api.listen {:?}: {e}", ctx.cfg.api.listen)))?;
    let routes = routes(ctx);
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(listen, async move { cancel.cancelled().await })
        .map_err(|e| AppError::Api(format!("bind {listen}: {e}")))?;
    info!(target: "api", addr = %bound, "api server listening");
    server.await;
    Ok(())
}

pub fn routes(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let auth = with_auth(ctx.cfg.api.auth_token.clone());
    let with_ctx = {
        let ctx = ctx.clone();
        warp::any().map(move || ctx.clone())
    };

    let health = warp::path!("health")
        .and(warp::get())
        .and(auth.clone())
        .map(|| warp::reply::json(&json!({"status": "ok"})));

    let metrics_route = warp::path!("metrics").and(warp::get()).map(|| {
        warp::reply::with_header(metrics::render(), "Content-Type", "text/plain; version=0.0.4")
    });

    let keys_list = warp::path!("keys")
        .and(warp::get())
        .and(auth.clone())
        .and(with_ctx.clone())
        .and_then(handle_keys_list);

    let keys_create = warp::path!("keys")
        .and(warp::post())
        .and(auth.clone())
        .and(with_ctx.clone())
        .and_then(handle_keys_create);

    let keys_export = warp::path!("keys" / "export")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::body::json())
        .and(with_ctx.clone())
        .and_then(handle_keys_export);

    let balances = warp::path!("balances")
        .and(warp::get())
        .and(auth.clone())
        .and(warp::query::<BalanceQuery>())
        .and(with_ctx.clone())
        .and_then(handle_balances);

    let trade_buy = warp::path!("trade" / "buy")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::body::json())
        .and(with_ctx.clone())
        .and_then(handle_buy);

    let trade_sell = warp::path!("trade" / "sell")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::body::json())
        .and(with_ctx.clone())
        .and_then(handle_sell);

    let trade_approve = warp::path!("trade" / "approve")
        .and(warp::post())
        .and(auth)
        .and(warp::body::json())
        .and(with_ctx)
        .and_then(handle_approve);

    health
        .or(metrics_route)
        .or(keys_list)
        .or(keys_create)
        .or(keys_export)
        .or(balances)
        .or(trade_buy)
        .or(trade_sell)
        .or(trade_approve)
        .recover(handle_rejection)
}

fn with_auth(token: String) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-api-key")
        .and(warp::header::optional::<String>("authorization"))
        .and_then(move |api_key: Option<String>, authorization: Option<String>| {
            let expected = token.clone();
            async move {
                if expected.is_empty() {
                    return Ok(());
                }
                let presented = api_key.or_else(|| bearer_token(authorization));
                if presented.as_deref() == Some(expected.as_str()) {
                    Ok(())
                } else {
                    Err(warp::reject::custom(Unauthorized))
                }
            }
        })
        .untuple_one()
}

fn bearer_token(header: Option<String>) -> Option<String> {
    let header = header?;
    let (scheme, rest) = header.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(rest.trim().to_string())
    } else {
        None
    }
}

//================================================================================================//
//                                          HANDLERS                                              //
//================================================================================================//

#[derive(Debug, Deserialize)]
struct BalanceQuery {
    #[serde(default)]
    address: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct ExportRequest {
    #[serde(default)]
    address: String,
    #[serde(default)]
    format: String,
}

async fn handle_keys_list(ctx: Arc<ApiContext>) -> Result<impl Reply, Infallible> {
    let keys: Vec<String> = ctx
        .keys
        .accounts()
        .into_iter()
        .map(|a| format!("{a:#x}"))
        .collect();
    Ok(ok_json(&json!({ "keys": keys })))
}

async fn handle_keys_create(ctx: Arc<ApiContext>) -> Result<impl Reply, Infallible> {
    match ctx.keys.create_account() {
        Ok(addr) => Ok(ok_json(&json!({ "address": format!("{addr:#x}") }))),
        Err(e) => Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    }
}

async fn handle_keys_export(
    req: ExportRequest,
    ctx: Arc<ApiContext>,
) -> Result<impl Reply, Infallible> {
    let addr = match parse_address(&req.address) {
        Ok(addr) => addr,
        Err(e) => return Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    let format = req.format.trim().to_ascii_lowercase();
    let format = if format.is_empty() { "keystore".to_string() } else { format };
    match format.as_str() {
        "private" => {
            if !ctx.cfg.keystore.allow_private_export {
                return Ok(error_json(StatusCode::FORBIDDEN, "private export disabled"));
            }
            match ctx.keys.export_private_key_hex(addr) {
                Ok(key) => Ok(ok_json(
                    &json!({ "address": format!("{addr:#x}"), "private_key": key }),
                )),
                Err(e) => Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
            }
        }
        "keystore" => match ctx.keys.export_key_json(addr) {
            Ok(keystore) => Ok(ok_json(
                &json!({ "address": format!("{addr:#x}"), "keystore": keystore }),
            )),
            Err(e) => Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
        },
        other => Ok(error_json(
            StatusCode::BAD_REQUEST,
            &format!("unknown format {other:?}"),
        )),
    }
}

async fn handle_balances(
    query: BalanceQuery,
    ctx: Arc<ApiContext>,
) -> Result<impl Reply, Infallible> {
    let addr = match parse_address(&query.address) {
        Ok(addr) => addr,
        Err(e) => return Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    if query.token.trim().is_empty() {
        return match ctx.client.balance(addr).await {
            Ok(balance) => Ok(ok_json(&json!({
                "address": format!("{addr:#x}"),
                "eth_wei": balance.to_string(),
            }))),
            Err(e) => Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
        };
    }
    let token = match parse_address(&query.token) {
        Ok(token) => token,
        Err(e) => return Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    let balance = match erc20::read_erc20_balance(&ctx.client, token, addr).await {
        Ok(balance) => balance,
        Err(e) => return Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    let decimals = match erc20::read_erc20_decimals(&ctx.client, token).await {
        Ok(decimals) => decimals,
        Err(e) => return Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    Ok(ok_json(&json!({
        "address": format!("{addr:#x}"),
        "token": format!("{token:#x}"),
        "balance_wei": balance.to_string(),
        "decimals": decimals,
    })))
}

async fn handle_buy(req: BuyRequest, ctx: Arc<ApiContext>) -> Result<impl Reply, Infallible> {
    match ctx.trade.buy(req).await {
        Ok(outcome) => Ok(ok_json(&outcome)),
        Err(e) => Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    }
}

async fn handle_sell(req: SellRequest, ctx: Arc<ApiContext>) -> Result<impl Reply, Infallible> {
    match ctx.trade.sell(req).await {
        Ok(outcome) => Ok(ok_json(&outcome)),
        Err(e) => Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    }
}

async fn handle_approve(
    req: ApproveRequest,
    ctx: Arc<ApiContext>,
) -> Result<impl Reply, Infallible> {
    match ctx.trade.approve(req).await {
        Ok(outcome) => Ok(ok_json(&outcome)),
        Err(e) => Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string())),
    }
}

fn ok_json<T: serde::Serialize>(body: &T) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(body), StatusCode::OK).into_response()
}

fn error_json(status: StatusCode, message: &str) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status)
        .into_response()
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    if rejection.find::<Unauthorized>().is_some() {
        return Ok(error_json(StatusCode::UNAUTHORIZED, "unauthorized"));
    }
    if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        return Ok(error_json(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }
    if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(error_json(StatusCode::BAD_REQUEST, &e.to_string()));
    }
    if rejection.is_not_found() {
        return Ok(error_json(StatusCode::NOT_FOUND, "not found"));
    }
    Ok(error_json(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error",
    ))
}
