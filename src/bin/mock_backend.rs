use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{Days, Utc};
use clap::Parser;
use nanoid::nanoid;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;

const NICKNAMES: [&str; 8] = ["小明", "小红", "阿强", "文文", "大壮", "晓晓", "北辰", "七七"];

#[derive(Parser, Debug)]
struct Cli {
    /// Address to bind the mock backend
    #[arg(long, default_value = "127.0.0.1:58099")]
    bind: SocketAddr,

    /// Number of demo users to seed
    #[arg(long, default_value_t = 12)]
    seed_users: usize,

    /// Admin token accepted for mutations
    #[arg(long, default_value = "admin_secret_token")]
    admin_token: String,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
struct ForcedResponse {
    #[serde(default)]
    http_status: Option<u16>,
    #[serde(default)]
    reject: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    once: bool,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Default, Clone, Serialize)]
struct BackendState {
    users: BTreeMap<String, Value>,
    images_total: u64,
    images_daily: u64,
    forced: Option<ForcedResponse>,
    hits: BTreeMap<String, u64>,
}

struct AppState {
    inner: RwLock<BackendState>,
    admin_token: String,
}

#[derive(Deserialize)]
struct GetUserQuery {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLevelRequest {
    openid: String,
    new_level: String,
    #[serde(default)]
    admin_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteUserRequest {
    openid: String,
    #[serde(default)]
    admin_token: Option<String>,
}

#[derive(Deserialize)]
struct ForceRequest {
    #[serde(default)]
    http_status: Option<u16>,
    #[serde(default)]
    reject: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    once: bool,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut rng = rand::thread_rng();
    let state = Arc::new(AppState {
        inner: RwLock::new(BackendState {
            users: seed_users(cli.seed_users, &mut rng),
            images_total: rng.gen_range(100..800),
            images_daily: rng.gen_range(0..40),
            forced: None,
            hits: BTreeMap::new(),
        }),
        admin_token: cli.admin_token.clone(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/admin/get_all_users", get(get_all_users))
        .route("/admin/list_all_keys", get(list_all_keys))
        .route("/admin/get_user", get(get_user))
        .route("/admin/update_user_level", post(update_user_level))
        .route("/admin/delete_user", post(delete_user))
        .route("/admin/get_token_stats", get(get_token_stats))
        .route("/admin/get_token_history", get(get_token_history))
        .route("/admin/get_image_stats", get(get_image_stats))
        .route(
            "/__mock/force",
            post(set_forced_response).delete(clear_forced_response),
        )
        .route("/__mock/requests", get(read_hits).delete(reset_hits))
        .route("/__mock/state", get(read_state))
        .with_state(state);

    println!("Mock AIMO backend listening on http://{}", cli.bind);
    axum::serve(tokio::net::TcpListener::bind(cli.bind).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.count("/health").await;
    Json(json!({ "status": "ok" }))
}

async fn get_all_users(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/get_all_users").await {
        return intercepted;
    }

    let guard = state.inner.read().await;
    let users: Vec<Value> = guard.users.values().cloned().collect();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "users": users, "total": users.len() })),
    )
}

async fn list_all_keys(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/list_all_keys").await {
        return intercepted;
    }

    let guard = state.inner.read().await;
    let keys: Vec<Value> = guard
        .users
        .keys()
        .map(|openid| json!({ "name": format!("user:{openid}") }))
        .chain([
            json!({ "name": "config:app" }),
            json!({ "name": "counter:images" }),
        ])
        .collect();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "keys": keys })),
    )
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GetUserQuery>,
) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/get_user").await {
        return intercepted;
    }

    let guard = state.inner.read().await;
    let openid = query.key.strip_prefix("user:").unwrap_or(&query.key);
    match guard.users.get(openid) {
        Some(user) => (
            StatusCode::OK,
            Json(json!({ "success": true, "user": user })),
        ),
        None => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "用户不存在" })),
        ),
    }
}

async fn update_user_level(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UpdateLevelRequest>,
) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/update_user_level").await {
        return intercepted;
    }
    if payload.admin_token.as_deref() != Some(state.admin_token.as_str()) {
        return (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "管理口令错误" })),
        );
    }
    if !matches!(
        payload.new_level.as_str(),
        "normal" | "vip" | "svip" | "admin"
    ) {
        return (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "无效的等级" })),
        );
    }

    let mut guard = state.inner.write().await;
    match guard.users.get_mut(&payload.openid) {
        Some(user) => {
            if let Some(object) = user.as_object_mut() {
                object.insert("level".into(), Value::String(payload.new_level.clone()));
            }
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": format!("已将 {} 设为 {}", payload.openid, payload.new_level)
                })),
            )
        }
        None => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "用户不存在" })),
        ),
    }
}

async fn delete_user(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeleteUserRequest>,
) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/delete_user").await {
        return intercepted;
    }
    if payload.admin_token.as_deref() != Some(state.admin_token.as_str()) {
        return (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "管理口令错误" })),
        );
    }

    let mut guard = state.inner.write().await;
    if guard.users.remove(&payload.openid).is_some() {
        (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("已删除 {}", payload.openid)
            })),
        )
    } else {
        (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "用户不存在" })),
        )
    }
}

async fn get_token_stats(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/get_token_stats").await {
        return intercepted;
    }

    let guard = state.inner.read().await;
    let total: u64 = guard.users.values().map(|user| token_field(user, "total")).sum();
    let daily: u64 = guard.users.values().map(|user| token_field(user, "daily")).sum();
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "stats": { "totalTokens": total, "dailyTokens": daily }
        })),
    )
}

async fn get_token_history(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/get_token_history").await {
        return intercepted;
    }

    let guard = state.inner.read().await;
    let total: u64 = guard.users.values().map(|user| token_field(user, "total")).sum();
    let today = Utc::now().date_naive();
    let history: Vec<Value> = (0..7u64)
        .rev()
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .enumerate()
        .map(|(index, date)| {
            json!({
                "date": date.format("%Y-%m-%d").to_string(),
                "tokens": total / 7 + index as u64 * 3
            })
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "history": history })),
    )
}

async fn get_image_stats(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if let Some(intercepted) = intercept(&state, "/admin/get_image_stats").await {
        return intercepted;
    }

    let guard = state.inner.read().await;
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "stats": { "totalImages": guard.images_total, "dailyImages": guard.images_daily }
        })),
    )
}

async fn set_forced_response(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ForceRequest>,
) -> (StatusCode, Json<Value>) {
    if payload.http_status.is_none()
        && payload.reject.is_none()
        && payload.body.is_none()
        && payload.delay_ms.is_none()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "One of http_status, reject, body, or delay_ms is required" })),
        );
    }

    let mut guard = state.inner.write().await;
    guard.forced = Some(ForcedResponse {
        http_status: payload.http_status,
        reject: payload.reject,
        body: payload.body,
        once: payload.once,
        delay_ms: payload.delay_ms,
    });
    (StatusCode::OK, Json(json!({ "forced": guard.forced })))
}

async fn clear_forced_response(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let mut guard = state.inner.write().await;
    guard.forced = None;
    (StatusCode::NO_CONTENT, Json(json!({})))
}

async fn read_hits(State(state): State<Arc<AppState>>) -> Json<Value> {
    let guard = state.inner.read().await;
    Json(json!({ "hits": guard.hits }))
}

async fn reset_hits(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let mut guard = state.inner.write().await;
    guard.hits.clear();
    (StatusCode::NO_CONTENT, Json(json!({})))
}

async fn read_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    let guard = state.inner.read().await;
    Json(json!({
        "users": guard.users,
        "forced": guard.forced,
        "hits": guard.hits,
    }))
}

impl AppState {
    async fn count(&self, path: &str) {
        let mut guard = self.inner.write().await;
        *guard.hits.entry(path.to_owned()).or_insert(0) += 1;
    }
}

/// 记一次命中并在有强制响应时消费它；只带 delay 的强制响应延迟后走正常路径。
async fn intercept(state: &AppState, path: &str) -> Option<(StatusCode, Json<Value>)> {
    let forced = {
        let mut guard = state.inner.write().await;
        *guard.hits.entry(path.to_owned()).or_insert(0) += 1;
        let forced = guard.forced.clone();
        if guard.forced.as_ref().is_some_and(|force| force.once) {
            guard.forced = None;
        }
        forced
    };

    let force = forced?;
    if let Some(delay) = force.delay_ms {
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }
    if let Some(status) = force.http_status {
        let body = force
            .body
            .unwrap_or_else(|| json!({ "success": false, "error": format!("forced status {status}") }));
        return Some((
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(body),
        ));
    }
    if let Some(error) = force.reject {
        return Some((
            StatusCode::OK,
            Json(json!({ "success": false, "error": error })),
        ));
    }
    if let Some(custom) = force.body {
        return Some((StatusCode::OK, Json(custom)));
    }
    None
}

fn seed_users<R: Rng>(count: usize, rng: &mut R) -> BTreeMap<String, Value> {
    let now = Utc::now();
    let mut users = BTreeMap::new();

    for index in 0..count {
        let openid = format!("wx_{}", nanoid!(12));
        let level = match rng.gen_range(0..10) {
            0..=5 => "normal",
            6..=7 => "vip",
            8 => "svip",
            _ => "admin",
        };
        let created_at = now
            .checked_sub_days(Days::new(rng.gen_range(0..10)))
            .unwrap_or(now);
        let last_login = match rng.gen_range(0..4) {
            0 => None,
            1 => Some(now),
            _ => now.checked_sub_days(Days::new(rng.gen_range(1..6))),
        };

        let user = json!({
            "openid": openid.clone(),
            "nickname": format!("{}{}", NICKNAMES[index % NICKNAMES.len()], index),
            "level": level,
            "createdAt": created_at.to_rfc3339(),
            "lastLoginAt": last_login.map(|at| at.to_rfc3339()),
            "usage": { "daily": rng.gen_range(0..5), "total": rng.gen_range(0..40) },
            "articleUsage": { "daily": rng.gen_range(0..3), "total": rng.gen_range(0..20) },
            "tokenUsage": { "daily": rng.gen_range(0..200), "total": rng.gen_range(0..1500) },
            "limits": { "daily": 10, "features": ["article", "image"] }
        });
        users.insert(openid, user);
    }

    users
}

fn token_field(user: &Value, field: &str) -> u64 {
    user.get("tokenUsage")
        .and_then(|usage| usage.get(field))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}
