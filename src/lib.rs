use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use log::{debug, error, warn};
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// 管理后台的默认基础地址。
pub const DEFAULT_BASE_URL: &str = "https://aimorelogybackend.site";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(30_000);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 注册趋势的滑动窗口长度（天）。
pub const TREND_WINDOW_DAYS: usize = 7;

const LEGACY_USER_KEY_PREFIX: &str = "user:";

const USER_ENDPOINTS: &[&str] = &[
    "/admin/get_all_users",
    "/admin/list_all_keys",
    "/admin/get_user",
];

const STATS_ENDPOINTS: &[&str] = &[
    "/admin/get_token_stats",
    "/admin/get_token_history",
    "/admin/get_image_stats",
];

const USAGE_BUCKET_LABELS: [&str; 5] = ["0次", "1-5次", "6-10次", "11-20次", "20次以上"];
const USAGE_BUCKET_EDGES: [u64; 4] = [0, 5, 10, 20];

const TOKEN_BUCKET_LABELS: [&str; 5] = ["0", "1-100", "101-500", "501-1000", "1000以上"];
const TOKEN_BUCKET_EDGES: [u64; 4] = [0, 100, 500, 1000];

/// `AdminClient` 的构造配置。
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub base_url: String,
    pub admin_token: String,
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
}

impl AdminConfig {
    pub fn new(base_url: impl Into<String>, admin_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            admin_token: admin_token.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// 管理后台的 HTTP 客户端，内置按端点缓存的响应层。
/// 读请求在 TTL 窗口内复用缓存，变更在成功后使相关分组失效，失败从不写入缓存。
#[derive(Debug)]
pub struct AdminClient {
    client: Client,
    base_url: Url,
    admin_token: String,
    cache: RequestCache,
}

impl AdminClient {
    pub fn new(config: AdminConfig) -> Result<Self, AdminError> {
        let base_url =
            Url::parse(&config.base_url).map_err(|source| AdminError::InvalidBaseUrl {
                url: config.base_url.clone(),
                source,
            })?;
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            base_url,
            admin_token: config.admin_token,
            cache: RequestCache::new(config.cache_ttl),
        })
    }

    /// 拉取全部用户并做宽松解码。坏记录逐条跳过，不会放弃整个列表。
    pub async fn get_users(&self, use_cache: bool) -> Result<UserDirectory, AdminError> {
        let payload = self
            .fetch_cached("/admin/get_all_users", None, use_cache)
            .await?;
        let users = decode_users(&payload);
        let total = users.len();
        Ok(UserDirectory { users, total })
    }

    /// 旧版列举：先列出全部 KV 键，再逐个拉取 `user:` 前缀的记录。
    /// 单个用户拉取失败只记日志并跳过。
    pub async fn scan_users(&self, use_cache: bool) -> Result<UserDirectory, AdminError> {
        let keys_payload = self
            .fetch_cached("/admin/list_all_keys", None, use_cache)
            .await?;

        let key_names: Vec<String> = keys_payload
            .get("keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|entry| entry.get("name").and_then(Value::as_str))
                    .filter(|name| name.starts_with(LEGACY_USER_KEY_PREFIX))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let mut users = Vec::with_capacity(key_names.len());
        for name in &key_names {
            let mut params = BTreeMap::new();
            params.insert("key".to_owned(), name.clone());

            match self
                .fetch_cached("/admin/get_user", Some(&params), use_cache)
                .await
            {
                Ok(payload) => {
                    if let Some(raw) = payload.get("user")
                        && let Some(user) = decode_user(raw)
                    {
                        users.push(user);
                    }
                }
                Err(err) => warn!("skipping {name}: {err}"),
            }
        }

        let total = users.len();
        Ok(UserDirectory { users, total })
    }

    /// 拉取用户并在本地推导聚合统计。推导结果本身不缓存，只有其输入缓存。
    pub async fn get_stats(&self, use_cache: bool) -> Result<AggregateStats, AdminError> {
        let directory = self.get_users(use_cache).await?;
        Ok(derive_stats(&directory.users, Utc::now().date_naive()))
    }

    pub async fn get_token_stats(&self, use_cache: bool) -> Result<TokenStats, AdminError> {
        let payload = self
            .fetch_cached("/admin/get_token_stats", None, use_cache)
            .await?;
        decode_section("/admin/get_token_stats", &payload, "stats")
    }

    pub async fn get_token_history(
        &self,
        use_cache: bool,
    ) -> Result<Vec<TokenHistoryPoint>, AdminError> {
        let payload = self
            .fetch_cached("/admin/get_token_history", None, use_cache)
            .await?;
        decode_section("/admin/get_token_history", &payload, "history")
    }

    pub async fn get_image_stats(&self, use_cache: bool) -> Result<ImageStats, AdminError> {
        let payload = self
            .fetch_cached("/admin/get_image_stats", None, use_cache)
            .await?;
        decode_section("/admin/get_image_stats", &payload, "stats")
    }

    /// 应用用户变更；成功后使用户与统计分组的缓存失效。
    pub async fn update_user(
        &self,
        openid: &str,
        update: UserUpdate,
    ) -> Result<Ack, AdminError> {
        let body = json!({
            "openid": openid,
            "newLevel": update.level.as_str(),
            "adminToken": self.admin_token,
        });
        let payload = self
            .request_envelope(Method::POST, "/admin/update_user_level", None, Some(&body))
            .await?;
        self.invalidate_user_views();
        Ok(decode_ack(&payload))
    }

    pub async fn delete_user(&self, openid: &str) -> Result<Ack, AdminError> {
        let body = json!({
            "openid": openid,
            "adminToken": self.admin_token,
        });
        let payload = self
            .request_envelope(Method::POST, "/admin/delete_user", None, Some(&body))
            .await?;
        self.invalidate_user_views();
        Ok(decode_ack(&payload))
    }

    /// 健康探测。总是返回一个状态而不是错误，也从不读写缓存。
    pub async fn check_status(&self) -> BackendStatus {
        let checked_at = Utc::now();
        match self.fetch_json(Method::GET, "/health", None, None).await {
            Ok(_) => BackendStatus {
                online: true,
                message: "连接正常".to_owned(),
                checked_at,
            },
            Err(err) => {
                error!("health probe failed: {err}");
                BackendStatus {
                    online: false,
                    message: err.to_string(),
                    checked_at,
                }
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_diagnostics(&self) -> CacheDiagnostics {
        self.cache.diagnostics()
    }

    /// 带缓存的 GET：命中直接返回，未命中则拉取并在信封校验通过后写入。
    async fn fetch_cached(
        &self,
        endpoint: &str,
        params: Option<&BTreeMap<String, String>>,
        use_cache: bool,
    ) -> Result<Value, AdminError> {
        let key = cache_key(endpoint, params);

        if use_cache && let Some(hit) = self.cache.lookup(&key) {
            debug!("cache hit {key}");
            return Ok(hit);
        }

        let payload = self
            .request_envelope(Method::GET, endpoint, params, None)
            .await?;
        self.cache.insert(key, payload.clone());
        Ok(payload)
    }

    /// 请求并执行信封约定：2xx 且 `success: true` 才算成功。
    async fn request_envelope(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&BTreeMap<String, String>>,
        body: Option<&Value>,
    ) -> Result<Value, AdminError> {
        let payload = self.fetch_json(method, endpoint, params, body).await?;
        ensure_success(endpoint, payload)
    }

    /// 原始 JSON 请求；传输失败、非 2xx 与解码失败都映射为类型化错误。
    async fn fetch_json(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&BTreeMap<String, String>>,
        body: Option<&Value>,
    ) -> Result<Value, AdminError> {
        let mut url = self.base_url.clone();
        url.set_path(endpoint);

        if let Some(params) = params {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }

        debug!("{method} {url}");

        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(AdminError::Status {
                endpoint: endpoint.to_owned(),
                status,
                message: extract_error_message(&text),
            });
        }

        serde_json::from_str(&text).map_err(|source| AdminError::Decode {
            endpoint: endpoint.to_owned(),
            source,
        })
    }

    fn invalidate_user_views(&self) {
        let removed = self.cache.invalidate_containing(USER_ENDPOINTS)
            + self.cache.invalidate_containing(STATS_ENDPOINTS);
        debug!("invalidated {removed} cached responses after mutation");
    }
}

/// 按键缓存响应负载的 TTL 缓存。过期以写入时间计量，没有滑动续期；
/// 过期条目按未命中处理，不做后台清理，由下一次成功拉取原地覆盖。
#[derive(Debug)]
pub struct RequestCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    stored_at: Instant,
}

impl RequestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 单次原子查找：条目存在且未过期才算命中。
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.payload.clone())
        } else {
            None
        }
    }

    /// 无条件覆盖写入并重置写入时间。同键并发时后写的赢。
    pub fn insert(&self, key: impl Into<String>, payload: Value) {
        self.entries.write().insert(
            key.into(),
            CacheEntry {
                payload,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        before - entries.len()
    }

    pub fn invalidate_containing(&self, fragments: &[&str]) -> usize {
        self.invalidate_where(|key| fragments.iter().any(|fragment| key.contains(fragment)))
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn diagnostics(&self) -> CacheDiagnostics {
        let entries = self.entries.read();
        let mut keys: Vec<CachedKeyInfo> = entries
            .iter()
            .map(|(key, entry)| {
                let age = entry.stored_at.elapsed();
                CachedKeyInfo {
                    key: key.clone(),
                    age_ms: age.as_millis() as u64,
                    fresh: age < self.ttl,
                }
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        CacheDiagnostics {
            count: keys.len(),
            keys,
        }
    }
}

pub fn level_distribution(users: &[UserRecord]) -> LevelDistribution {
    let mut distribution = LevelDistribution::default();
    for user in users {
        match user.level {
            UserLevel::Normal => distribution.normal += 1,
            UserLevel::Vip => distribution.vip += 1,
            UserLevel::Svip => distribution.svip += 1,
            UserLevel::Admin => distribution.admin += 1,
        }
    }
    distribution
}

/// 截至 `today`（含）的最近 `window` 天注册数，按天零填充，从旧到新。
/// 比较按 UTC 日历日进行，缺失注册时间的记录不参与计数。
pub fn registration_trend(
    users: &[UserRecord],
    today: NaiveDate,
    window: usize,
) -> Vec<TrendPoint> {
    (0..window)
        .rev()
        .filter_map(|offset| today.checked_sub_days(Days::new(offset as u64)))
        .map(|date| {
            let count = users
                .iter()
                .filter(|user| user.created_at.is_some_and(|at| at.date_naive() == date))
                .count();
            TrendPoint {
                date,
                count,
                label: trend_label(date),
            }
        })
        .collect()
}

/// 最后登录落在 `today`（UTC 日历日）的用户数。
pub fn daily_active(users: &[UserRecord], today: NaiveDate) -> usize {
    users
        .iter()
        .filter(|user| user.last_login_at.is_some_and(|at| at.date_naive() == today))
        .count()
}

/// 按总使用次数分桶，上边界含端点。
pub fn usage_histogram(users: &[UserRecord]) -> Vec<BucketCount> {
    bucket_histogram(users, USAGE_BUCKET_LABELS, USAGE_BUCKET_EDGES, |user| {
        user.usage.total
    })
}

/// 按总 token 消耗分桶，上边界含端点。
pub fn token_histogram(users: &[UserRecord]) -> Vec<BucketCount> {
    bucket_histogram(users, TOKEN_BUCKET_LABELS, TOKEN_BUCKET_EDGES, |user| {
        user.token_usage.total
    })
}

/// 各等级的平均总使用次数，四舍五入为整数，无人时为 0。
pub fn activity_by_level(users: &[UserRecord]) -> Vec<LevelAverage> {
    UserLevel::ALL
        .into_iter()
        .map(|level| {
            let mut sum = 0u64;
            let mut count = 0u64;
            for user in users.iter().filter(|user| user.level == level) {
                sum += user.usage.total;
                count += 1;
            }
            let average = if count > 0 {
                (sum as f64 / count as f64).round() as u64
            } else {
                0
            };
            LevelAverage { level, average }
        })
        .collect()
}

/// 汇总一份完整的聚合统计。纯函数，按需重算，从不持久化。
pub fn derive_stats(users: &[UserRecord], today: NaiveDate) -> AggregateStats {
    AggregateStats {
        total: users.len(),
        levels: level_distribution(users),
        daily_active: daily_active(users, today),
        registration_trend: registration_trend(users, today, TREND_WINDOW_DAYS),
        usage_histogram: usage_histogram(users),
        token_histogram: token_histogram(users),
        activity_by_level: activity_by_level(users),
        missing_created_at: users.iter().filter(|user| user.created_at.is_none()).count(),
        missing_last_login: users
            .iter()
            .filter(|user| user.last_login_at.is_none())
            .count(),
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UserLevel {
    #[default]
    Normal,
    Vip,
    Svip,
    Admin,
}

impl UserLevel {
    /// 固定的展示顺序。
    pub const ALL: [UserLevel; 4] = [
        UserLevel::Normal,
        UserLevel::Vip,
        UserLevel::Svip,
        UserLevel::Admin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UserLevel::Normal => "normal",
            UserLevel::Vip => "vip",
            UserLevel::Svip => "svip",
            UserLevel::Admin => "admin",
        }
    }

    /// 中文显示名。
    pub fn label(self) -> &'static str {
        match self {
            UserLevel::Normal => "普通用户",
            UserLevel::Vip => "VIP",
            UserLevel::Svip => "SVIP",
            UserLevel::Admin => "管理员",
        }
    }
}

impl std::str::FromStr for UserLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(UserLevel::Normal),
            "vip" => Ok(UserLevel::Vip),
            "svip" => Ok(UserLevel::Svip),
            "admin" => Ok(UserLevel::Admin),
            other => Err(format!("unknown level '{other}'")),
        }
    }
}

/// 单个用户记录。解码在边界处宽松处理：缺失或畸形的数值回落为 0，
/// 未知等级回落为 normal，畸形时间戳回落为 None；openid 是唯一必填字段。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub openid: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub nickname: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub avatar: Option<String>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub level: UserLevel,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub last_login_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub usage: UsageCounters,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub article_usage: UsageCounters,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub token_usage: TokenCounters,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub limits: UsageLimits,
}

/// 使用次数计数。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default, deserialize_with = "lenient_count")]
    pub daily: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total: u64,
}

/// token 消耗计数。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounters {
    #[serde(default, deserialize_with = "lenient_count")]
    pub daily: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total: u64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub last_reset: Option<String>,
}

/// 配额限制。daily 缺省为 10。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimits {
    #[serde(default = "default_daily_limit", deserialize_with = "lenient_limit")]
    pub daily: u64,
    #[serde(default)]
    pub features: Vec<String>,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            daily: default_daily_limit(),
            features: Vec::new(),
        }
    }
}

/// 用户列表视图。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDirectory {
    pub users: Vec<UserRecord>,
    pub total: usize,
}

/// 等级分布。四个分量之和恒等于用户总数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelDistribution {
    pub normal: usize,
    pub vip: usize,
    pub svip: usize,
    pub admin: usize,
}

impl LevelDistribution {
    pub fn count(&self, level: UserLevel) -> usize {
        match level {
            UserLevel::Normal => self.normal,
            UserLevel::Vip => self.vip,
            UserLevel::Svip => self.svip,
            UserLevel::Admin => self.admin,
        }
    }

    pub fn total(&self) -> usize {
        self.normal + self.vip + self.svip + self.admin
    }
}

/// 注册趋势中的一天。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub count: usize,
    pub label: String,
}

/// 直方图中的一个区间。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketCount {
    pub label: &'static str,
    pub count: usize,
}

/// 单个等级的平均使用次数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelAverage {
    pub level: UserLevel,
    pub average: u64,
}

/// 在客户端推导出的聚合视图，每次读取即时重算。`missing_*` 统计缺失
/// 时间戳的记录数，这些记录不参与日期类计数但会被显式计入而非无声丢弃。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub total: usize,
    pub levels: LevelDistribution,
    pub daily_active: usize,
    pub registration_trend: Vec<TrendPoint>,
    pub usage_histogram: Vec<BucketCount>,
    pub token_histogram: Vec<BucketCount>,
    pub activity_by_level: Vec<LevelAverage>,
    pub missing_created_at: usize,
    pub missing_last_login: usize,
}

/// 服务端计算的 token 汇总。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStats {
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_tokens: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub daily_tokens: u64,
}

/// token 消耗历史中的一天。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenHistoryPoint {
    pub date: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub tokens: u64,
}

/// 服务端计算的图片生成汇总。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStats {
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_images: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub daily_images: u64,
}

/// 用户变更请求。后端目前只支持调整等级。
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UserUpdate {
    pub level: UserLevel,
}

/// 变更操作的回执。
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub message: Option<String>,
}

/// 健康探测结果。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub online: bool,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

/// 缓存自检视图。
#[derive(Debug, Clone, Serialize)]
pub struct CacheDiagnostics {
    pub count: usize,
    pub keys: Vec<CachedKeyInfo>,
}

/// 单个缓存键的状态。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedKeyInfo {
    pub key: String,
    pub age_ms: u64,
    pub fresh: bool,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid base url '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status} for {endpoint}: {message}")]
    Status {
        endpoint: String,
        status: StatusCode,
        message: String,
    },
    #[error("malformed response from {endpoint}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("backend rejected {endpoint}: {message}")]
    Rejected { endpoint: String, message: String },
}

/// 由端点与参数推导缓存键。参数经 `BTreeMap` 做序规范化，
/// 插入顺序不影响键；无参数与空参数都序列化为 `{}`。
pub fn cache_key(endpoint: &str, params: Option<&BTreeMap<String, String>>) -> String {
    let canonical = params
        .map(|map| serde_json::to_string(map).unwrap_or_else(|_| "{}".to_owned()))
        .unwrap_or_else(|| "{}".to_owned());
    format!("{endpoint}_{canonical}")
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn ensure_success(endpoint: &str, payload: Value) -> Result<Value, AdminError> {
    let envelope: Envelope =
        serde_json::from_value(payload.clone()).map_err(|source| AdminError::Decode {
            endpoint: endpoint.to_owned(),
            source,
        })?;

    if envelope.success {
        Ok(payload)
    } else {
        Err(AdminError::Rejected {
            endpoint: endpoint.to_owned(),
            message: envelope
                .error
                .unwrap_or_else(|| "unknown error".to_owned()),
        })
    }
}

fn decode_users(payload: &Value) -> Vec<UserRecord> {
    payload
        .get("users")
        .and_then(Value::as_array)
        .map(|records| records.iter().filter_map(decode_user).collect())
        .unwrap_or_default()
}

fn decode_user(raw: &Value) -> Option<UserRecord> {
    match serde_json::from_value::<UserRecord>(raw.clone()) {
        Ok(user) if !user.openid.is_empty() => Some(user),
        Ok(_) => {
            warn!("skipping user record with empty openid");
            None
        }
        Err(err) => {
            warn!("skipping malformed user record: {err}");
            None
        }
    }
}

fn decode_section<T>(endpoint: &str, payload: &Value, field: &str) -> Result<T, AdminError>
where
    T: serde::de::DeserializeOwned,
{
    let section = payload.get(field).cloned().unwrap_or(Value::Null);
    serde_json::from_value(section).map_err(|source| AdminError::Decode {
        endpoint: endpoint.to_owned(),
        source,
    })
}

fn decode_ack(payload: &Value) -> Ack {
    Ack {
        message: payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no response body".to_owned()
            } else {
                trimmed.chars().take(200).collect()
            }
        })
}

fn bucket_histogram<F>(
    users: &[UserRecord],
    labels: [&'static str; 5],
    edges: [u64; 4],
    field: F,
) -> Vec<BucketCount>
where
    F: Fn(&UserRecord) -> u64,
{
    let mut counts = [0usize; 5];
    for user in users {
        let value = field(user);
        let index = edges.iter().position(|edge| value <= *edge).unwrap_or(4);
        counts[index] += 1;
    }

    labels
        .into_iter()
        .zip(counts)
        .map(|(label, count)| BucketCount { label, count })
        .collect()
}

fn trend_label(date: NaiveDate) -> String {
    format!("{}月{}日", date.month(), date.day())
}

fn default_daily_limit() -> u64 {
    10
}

fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(raw) if !raw.is_empty() => Some(raw),
        _ => None,
    })
}

fn lenient_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(flexible_count(&value))
}

fn lenient_limit<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => default_daily_limit(),
        other => flexible_count(&other),
    })
}

fn flexible_count(value: &Value) -> u64 {
    match value {
        Value::Number(raw) => raw
            .as_u64()
            .or_else(|| raw.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .unwrap_or(0),
        Value::String(raw) => raw.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(flexible_datetime(&value))
}

fn flexible_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        }
        // 数值时间戳按毫秒解释
        Value::Number(raw) => raw.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn sample_user(openid: &str, level: UserLevel, usage_total: u64) -> UserRecord {
        UserRecord {
            openid: openid.to_owned(),
            nickname: Some(format!("用户{openid}")),
            avatar: None,
            level,
            created_at: None,
            last_login_at: None,
            usage: UsageCounters {
                daily: 0,
                total: usage_total,
            },
            article_usage: UsageCounters::default(),
            token_usage: TokenCounters::default(),
            limits: UsageLimits::default(),
        }
    }

    fn with_tokens(mut user: UserRecord, tokens: u64) -> UserRecord {
        user.token_usage.total = tokens;
        user
    }

    fn day(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn at_midday(date: NaiveDate) -> DateTime<Utc> {
        date.and_hms_opt(12, 0, 0).unwrap().and_utc()
    }

    #[test]
    fn cache_key_is_canonical_over_param_order() {
        let mut forward = BTreeMap::new();
        forward.insert("a".to_owned(), "1".to_owned());
        forward.insert("b".to_owned(), "2".to_owned());

        let mut reverse = BTreeMap::new();
        reverse.insert("b".to_owned(), "2".to_owned());
        reverse.insert("a".to_owned(), "1".to_owned());

        assert_eq!(
            cache_key("/admin/get_user", Some(&forward)),
            cache_key("/admin/get_user", Some(&reverse))
        );
        assert_eq!(
            cache_key("/admin/get_user", Some(&forward)),
            r#"/admin/get_user_{"a":"1","b":"2"}"#
        );
    }

    #[test]
    fn cache_key_distinguishes_params_and_defaults_to_empty_object() {
        let mut params = BTreeMap::new();
        params.insert("key".to_owned(), "user:abc".to_owned());

        assert_ne!(
            cache_key("/admin/get_user", Some(&params)),
            cache_key("/admin/get_user", None)
        );
        assert_eq!(cache_key("/admin/get_image_stats", None), "/admin/get_image_stats_{}");
        assert_eq!(
            cache_key("/admin/get_all_users", Some(&BTreeMap::new())),
            "/admin/get_all_users_{}"
        );
    }

    #[test]
    fn lookup_misses_absent_keys() {
        let cache = RequestCache::new(DEFAULT_CACHE_TTL);
        assert!(cache.lookup("missing").is_none());
    }

    #[test]
    fn lookup_hits_within_ttl_and_misses_after() {
        let cache = RequestCache::new(Duration::from_millis(40));
        cache.insert("k", json!({"n": 1}));

        assert_eq!(cache.lookup("k"), Some(json!({"n": 1})));

        thread::sleep(Duration::from_millis(60));
        assert!(cache.lookup("k").is_none());

        // 过期是未命中而不是删除，条目仍可见于自检
        let diagnostics = cache.diagnostics();
        assert_eq!(diagnostics.count, 1);
        assert!(!diagnostics.keys[0].fresh);
    }

    #[test]
    fn insert_overwrites_and_later_write_wins() {
        let cache = RequestCache::new(DEFAULT_CACHE_TTL);
        cache.insert("k", json!({"version": 1}));
        cache.insert("k", json!({"version": 2}));

        assert_eq!(cache.lookup("k"), Some(json!({"version": 2})));
        assert_eq!(cache.diagnostics().count, 1);
    }

    #[test]
    fn overwrite_resets_entry_age() {
        let cache = RequestCache::new(Duration::from_millis(200));
        cache.insert("k", json!(1));
        thread::sleep(Duration::from_millis(120));
        cache.insert("k", json!(2));
        thread::sleep(Duration::from_millis(120));

        // 距第一次写入已超 TTL，但覆盖重置了时钟
        assert_eq!(cache.lookup("k"), Some(json!(2)));
    }

    #[test]
    fn remove_targets_a_single_key() {
        let cache = RequestCache::new(DEFAULT_CACHE_TTL);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(cache.lookup("a").is_none());
        assert_eq!(cache.lookup("b"), Some(json!(2)));
    }

    #[test]
    fn invalidate_containing_removes_matching_group_only() {
        let cache = RequestCache::new(DEFAULT_CACHE_TTL);
        cache.insert(cache_key("/admin/get_all_users", None), json!(1));
        cache.insert(cache_key("/admin/list_all_keys", None), json!(2));
        cache.insert(cache_key("/admin/get_token_stats", None), json!(3));
        cache.insert(cache_key("/health", None), json!(4));

        let removed = cache.invalidate_containing(USER_ENDPOINTS);
        assert_eq!(removed, 2);
        assert!(cache.lookup(&cache_key("/admin/get_all_users", None)).is_none());
        assert!(cache.lookup(&cache_key("/admin/list_all_keys", None)).is_none());
        assert!(cache.lookup(&cache_key("/admin/get_token_stats", None)).is_some());
        assert!(cache.lookup(&cache_key("/health", None)).is_some());
    }

    #[test]
    fn invalidate_where_uses_predicate() {
        let cache = RequestCache::new(DEFAULT_CACHE_TTL);
        cache.insert("keep_me", json!(1));
        cache.insert("drop_me", json!(2));

        let removed = cache.invalidate_where(|key| key.starts_with("drop"));
        assert_eq!(removed, 1);
        assert!(cache.lookup("keep_me").is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = RequestCache::new(DEFAULT_CACHE_TTL);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        cache.clear();

        assert_eq!(cache.diagnostics().count, 0);
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn diagnostics_sorts_keys_and_reports_freshness() {
        let cache = RequestCache::new(DEFAULT_CACHE_TTL);
        cache.insert("b", json!(2));
        cache.insert("a", json!(1));

        let diagnostics = cache.diagnostics();
        assert_eq!(diagnostics.count, 2);
        assert_eq!(diagnostics.keys[0].key, "a");
        assert_eq!(diagnostics.keys[1].key, "b");
        assert!(diagnostics.keys.iter().all(|info| info.fresh));
    }

    #[test]
    fn level_distribution_sums_to_total() {
        let users = vec![
            sample_user("a", UserLevel::Normal, 0),
            sample_user("b", UserLevel::Vip, 3),
            sample_user("c", UserLevel::Vip, 9),
            sample_user("d", UserLevel::Admin, 40),
        ];

        let distribution = level_distribution(&users);
        assert_eq!(distribution.normal, 1);
        assert_eq!(distribution.vip, 2);
        assert_eq!(distribution.svip, 0);
        assert_eq!(distribution.admin, 1);
        assert_eq!(distribution.total(), users.len());

        assert_eq!(level_distribution(&[]).total(), 0);
    }

    #[test]
    fn example_scenario_distribution_and_usage_histogram() {
        let users = vec![
            sample_user("a", UserLevel::Normal, 0),
            sample_user("b", UserLevel::Vip, 7),
            sample_user("c", UserLevel::Vip, 12),
        ];

        let distribution = level_distribution(&users);
        assert_eq!(
            (distribution.normal, distribution.vip, distribution.svip, distribution.admin),
            (1, 2, 0, 0)
        );

        let histogram = usage_histogram(&users);
        let counts: Vec<(&str, usize)> = histogram
            .iter()
            .map(|bucket| (bucket.label, bucket.count))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("0次", 1),
                ("1-5次", 0),
                ("6-10次", 1),
                ("11-20次", 1),
                ("20次以上", 0),
            ]
        );
    }

    #[test]
    fn usage_histogram_is_upper_edge_inclusive() {
        let users: Vec<UserRecord> = [0u64, 1, 5, 6, 10, 11, 20, 21]
            .iter()
            .enumerate()
            .map(|(index, total)| sample_user(&format!("u{index}"), UserLevel::Normal, *total))
            .collect();

        let histogram = usage_histogram(&users);
        assert_eq!(histogram[0].count, 1); // 0
        assert_eq!(histogram[1].count, 2); // 1, 5
        assert_eq!(histogram[2].count, 2); // 6, 10
        assert_eq!(histogram[3].count, 2); // 11, 20
        assert_eq!(histogram[4].count, 1); // 21

        let sum: usize = histogram.iter().map(|bucket| bucket.count).sum();
        assert_eq!(sum, users.len());
    }

    #[test]
    fn token_histogram_is_upper_edge_inclusive() {
        let users: Vec<UserRecord> = [0u64, 1, 100, 101, 500, 501, 1000, 1001]
            .iter()
            .enumerate()
            .map(|(index, total)| {
                with_tokens(
                    sample_user(&format!("u{index}"), UserLevel::Normal, 0),
                    *total,
                )
            })
            .collect();

        let histogram = token_histogram(&users);
        let counts: Vec<usize> = histogram.iter().map(|bucket| bucket.count).collect();
        assert_eq!(counts, vec![1, 2, 2, 2, 1]);
    }

    #[test]
    fn registration_trend_is_zero_filled_and_ordered() {
        let today = day(2024, 5, 10);
        let users = vec![
            {
                let mut user = sample_user("a", UserLevel::Normal, 0);
                user.created_at = Some(at_midday(day(2024, 5, 10)));
                user
            },
            {
                let mut user = sample_user("b", UserLevel::Vip, 1);
                user.created_at = Some(at_midday(day(2024, 5, 8)));
                user
            },
            {
                let mut user = sample_user("c", UserLevel::Vip, 2);
                user.created_at = Some(at_midday(day(2024, 5, 8)));
                user
            },
            {
                // 窗口之外
                let mut user = sample_user("d", UserLevel::Normal, 0);
                user.created_at = Some(at_midday(day(2024, 5, 1)));
                user
            },
        ];

        let trend = registration_trend(&users, today, TREND_WINDOW_DAYS);
        assert_eq!(trend.len(), TREND_WINDOW_DAYS);
        assert_eq!(trend[0].date, day(2024, 5, 4));
        assert_eq!(trend[6].date, today);
        assert!(trend.windows(2).all(|pair| pair[0].date < pair[1].date));

        let counts: Vec<usize> = trend.iter().map(|point| point.count).collect();
        assert_eq!(counts, vec![0, 0, 0, 0, 2, 0, 1]);
        assert_eq!(trend[6].label, "5月10日");
    }

    #[test]
    fn registration_trend_on_empty_input_is_all_zero() {
        let trend = registration_trend(&[], day(2024, 1, 15), TREND_WINDOW_DAYS);
        assert_eq!(trend.len(), TREND_WINDOW_DAYS);
        assert!(trend.iter().all(|point| point.count == 0));
    }

    #[test]
    fn daily_active_counts_only_todays_logins() {
        let today = day(2024, 5, 10);
        let users = vec![
            {
                let mut user = sample_user("a", UserLevel::Normal, 0);
                user.last_login_at = Some(at_midday(today));
                user
            },
            {
                let mut user = sample_user("b", UserLevel::Vip, 0);
                user.last_login_at = Some(at_midday(day(2024, 5, 9)));
                user
            },
            sample_user("c", UserLevel::Svip, 0),
        ];

        assert_eq!(daily_active(&users, today), 1);
    }

    #[test]
    fn activity_averages_round_half_up_and_default_to_zero() {
        let users = vec![
            sample_user("a", UserLevel::Normal, 1),
            sample_user("b", UserLevel::Normal, 2),
            sample_user("c", UserLevel::Vip, 10),
        ];

        let averages = activity_by_level(&users);
        assert_eq!(averages.len(), 4);
        assert_eq!(averages[0], LevelAverage { level: UserLevel::Normal, average: 2 }); // 1.5 -> 2
        assert_eq!(averages[1], LevelAverage { level: UserLevel::Vip, average: 10 });
        assert_eq!(averages[2], LevelAverage { level: UserLevel::Svip, average: 0 });
        assert_eq!(averages[3], LevelAverage { level: UserLevel::Admin, average: 0 });
    }

    #[test]
    fn derive_stats_holds_invariants_and_counts_missing_timestamps() {
        let today = day(2024, 5, 10);
        let mut with_dates = sample_user("a", UserLevel::Vip, 5);
        with_dates.created_at = Some(at_midday(today));
        with_dates.last_login_at = Some(at_midday(today));
        let users = vec![
            with_dates,
            sample_user("b", UserLevel::Normal, 0),
            sample_user("c", UserLevel::Svip, 30),
        ];

        let stats = derive_stats(&users, today);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.levels.total(), stats.total);
        assert_eq!(stats.registration_trend.len(), TREND_WINDOW_DAYS);
        assert_eq!(stats.daily_active, 1);
        assert_eq!(stats.missing_created_at, 2);
        assert_eq!(stats.missing_last_login, 2);

        let usage_sum: usize = stats.usage_histogram.iter().map(|bucket| bucket.count).sum();
        let token_sum: usize = stats.token_histogram.iter().map(|bucket| bucket.count).sum();
        assert_eq!(usage_sum, stats.total);
        assert_eq!(token_sum, stats.total);
    }

    #[test]
    fn user_decode_defaults_malformed_fields() {
        let raw = json!({
            "openid": "wx_001",
            "nickname": 42,
            "level": "gold",
            "createdAt": "not a date",
            "lastLoginAt": "2024-05-10T08:00:00Z",
            "usage": { "daily": "oops", "total": 7 },
            "tokenUsage": "broken",
            "limits": { "daily": null }
        });

        let user = decode_user(&raw).unwrap();
        assert_eq!(user.openid, "wx_001");
        assert_eq!(user.nickname, None);
        assert_eq!(user.level, UserLevel::Normal);
        assert_eq!(user.created_at, None);
        assert_eq!(
            user.last_login_at.map(|at| at.date_naive()),
            Some(day(2024, 5, 10))
        );
        assert_eq!(user.usage.daily, 0);
        assert_eq!(user.usage.total, 7);
        assert_eq!(user.token_usage.total, 0);
        assert_eq!(user.limits.daily, 10);
    }

    #[test]
    fn user_decode_accepts_millisecond_timestamps() {
        let raw = json!({
            "openid": "wx_002",
            "createdAt": 1_715_328_000_000i64
        });

        let user = decode_user(&raw).unwrap();
        assert_eq!(
            user.created_at.map(|at| at.date_naive()),
            Some(day(2024, 5, 10))
        );
    }

    #[test]
    fn user_decode_skips_records_without_identity() {
        assert!(decode_user(&json!({ "nickname": "无名" })).is_none());
        assert!(decode_user(&json!({ "openid": "" })).is_none());

        let payload = json!({
            "success": true,
            "users": [
                { "openid": "wx_a" },
                { "nickname": "幽灵" },
                { "openid": "wx_b", "level": "vip" }
            ]
        });
        let users = decode_users(&payload);
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].level, UserLevel::Vip);
    }

    #[test]
    fn limits_default_to_ten_when_absent() {
        let user = decode_user(&json!({ "openid": "wx_003" })).unwrap();
        assert_eq!(user.limits.daily, 10);
        assert!(user.limits.features.is_empty());

        let explicit = decode_user(&json!({
            "openid": "wx_004",
            "limits": { "daily": 0, "features": ["article"] }
        }))
        .unwrap();
        assert_eq!(explicit.limits.daily, 0);
        assert_eq!(explicit.limits.features, vec!["article".to_owned()]);
    }

    #[test]
    fn envelope_success_passes_payload_through() {
        let payload = json!({ "success": true, "users": [] });
        let passed = ensure_success("/admin/get_all_users", payload.clone()).unwrap();
        assert_eq!(passed, payload);
    }

    #[test]
    fn envelope_failure_maps_to_rejected() {
        let err = ensure_success(
            "/admin/update_user_level",
            json!({ "success": false, "error": "权限不足" }),
        )
        .unwrap_err();

        match err {
            AdminError::Rejected { endpoint, message } => {
                assert_eq!(endpoint, "/admin/update_user_level");
                assert_eq!(message, "权限不足");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn envelope_without_success_flag_is_a_decode_error() {
        let err = ensure_success("/health", json!({ "status": "ok" })).unwrap_err();
        assert!(matches!(err, AdminError::Decode { .. }));
    }

    #[test]
    fn token_stats_decode_is_lenient() {
        let stats: TokenStats = decode_section(
            "/admin/get_token_stats",
            &json!({ "success": true, "stats": { "totalTokens": "1200", "dailyTokens": null } }),
            "stats",
        )
        .unwrap();
        assert_eq!(stats.total_tokens, 1200);
        assert_eq!(stats.daily_tokens, 0);

        let missing: Result<TokenStats, _> = decode_section(
            "/admin/get_token_stats",
            &json!({ "success": true }),
            "stats",
        );
        assert!(missing.is_err());
    }

    #[test]
    fn error_body_message_extraction_prefers_error_field() {
        assert_eq!(
            extract_error_message(r#"{"success":false,"error":"服务器内部错误"}"#),
            "服务器内部错误"
        );
        assert_eq!(extract_error_message("plain text failure"), "plain text failure");
        assert_eq!(extract_error_message("   "), "no response body");
    }

    #[test]
    fn level_parsing_accepts_known_names_only() {
        assert_eq!("VIP".parse::<UserLevel>().unwrap(), UserLevel::Vip);
        assert_eq!(" svip ".parse::<UserLevel>().unwrap(), UserLevel::Svip);
        assert!("gold".parse::<UserLevel>().is_err());
    }
}
