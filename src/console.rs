use std::path::Path;

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use aimo_admin::{
    AdminClient, AdminError, ImageStats, TokenStats, UserLevel, UserRecord, UserUpdate,
};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 用户列表的过滤条件。
#[derive(Debug, Clone, Copy, Default)]
pub struct UserFilter<'a> {
    pub search: Option<&'a str>,
    pub level: Option<UserLevel>,
}

/// 总览面板。token 与图片汇总拿不到时降级为零值而不是整体失败。
pub async fn dashboard(
    client: &AdminClient,
    use_cache: bool,
    json: bool,
) -> Result<(), ConsoleError> {
    let stats = client.get_stats(use_cache).await?;
    let tokens = match client.get_token_stats(use_cache).await {
        Ok(tokens) => tokens,
        Err(err) => {
            warn!("token stats unavailable: {err}");
            TokenStats::default()
        }
    };
    let images = match client.get_image_stats(use_cache).await {
        Ok(images) => images,
        Err(err) => {
            warn!("image stats unavailable: {err}");
            ImageStats::default()
        }
    };

    if json {
        return print_json(&json!({
            "stats": stats,
            "tokenStats": tokens,
            "imageStats": images,
        }));
    }

    println!("== 系统总览 ==");
    println!("总用户数      {}", stats.total);
    println!("VIP 用户      {}", stats.levels.vip);
    println!("SVIP 用户     {}", stats.levels.svip);
    println!("管理员        {}", stats.levels.admin);
    println!("今日活跃      {}", stats.daily_active);
    println!("Token 总消耗  {}", tokens.total_tokens);
    println!("今日 Token    {}", tokens.daily_tokens);
    println!("图片总量      {}", images.total_images);
    println!("今日图片      {}", images.daily_images);

    println!();
    println!("最近 7 天注册");
    for point in &stats.registration_trend {
        println!("  {:<8} {:>4}  {}", point.label, point.count, bar(point.count));
    }

    println!();
    println!("使用次数分布");
    for bucket in &stats.usage_histogram {
        println!("  {:<8} {:>4}", bucket.label, bucket.count);
    }

    println!();
    println!("各等级平均使用");
    for entry in &stats.activity_by_level {
        println!("  {:<6} {:>6}", entry.level.label(), entry.average);
    }

    if stats.missing_created_at > 0 || stats.missing_last_login > 0 {
        println!();
        println!(
            "数据质量: {} 条缺注册时间，{} 条缺登录时间",
            stats.missing_created_at, stats.missing_last_login
        );
    }

    Ok(())
}

pub async fn users(
    client: &AdminClient,
    filter: UserFilter<'_>,
    page: usize,
    page_size: usize,
    legacy_scan: bool,
    use_cache: bool,
    json: bool,
) -> Result<(), ConsoleError> {
    let directory = if legacy_scan {
        client.scan_users(use_cache).await?
    } else {
        client.get_users(use_cache).await?
    };

    let filtered = filter_users(&directory.users, &filter);
    let (rows, page, total_pages) = paginate(&filtered, page, page_size);

    if json {
        return print_json(&json!({
            "users": rows,
            "matched": filtered.len(),
            "total": directory.total,
            "page": page,
            "totalPages": total_pages,
        }));
    }

    print_user_table(rows);
    println!();
    println!(
        "匹配 {} 个用户（全部 {} 个），第 {} 页，共 {} 页",
        filtered.len(),
        directory.total,
        page,
        total_pages
    );

    Ok(())
}

pub async fn export(
    client: &AdminClient,
    output: Option<&Path>,
    filter: UserFilter<'_>,
    use_cache: bool,
) -> Result<(), ConsoleError> {
    let directory = client.get_users(use_cache).await?;
    let filtered = filter_users(&directory.users, &filter);

    let mut writer = csv::Writer::from_writer(vec![]);
    write_users_csv(&mut writer, &filtered)?;
    let data = writer.into_inner().map_err(|err| err.into_error())?;

    match output {
        Some(path) => {
            std::fs::write(path, &data)?;
            println!("已导出 {} 个用户到 {}", filtered.len(), path.display());
        }
        None => print!("{}", String::from_utf8_lossy(&data)),
    }

    Ok(())
}

pub async fn stats(client: &AdminClient, use_cache: bool) -> Result<(), ConsoleError> {
    let stats = client.get_stats(use_cache).await?;
    print_json(&stats)
}

pub async fn tokens(
    client: &AdminClient,
    history: bool,
    use_cache: bool,
    json: bool,
) -> Result<(), ConsoleError> {
    let stats = client.get_token_stats(use_cache).await?;
    let points = if history {
        Some(client.get_token_history(use_cache).await?)
    } else {
        None
    };

    if json {
        return print_json(&json!({
            "stats": stats,
            "history": points,
        }));
    }

    println!("Token 总消耗  {}", stats.total_tokens);
    println!("今日 Token    {}", stats.daily_tokens);
    if let Some(points) = points {
        println!();
        println!("最近消耗");
        for point in points {
            println!("  {:<12} {:>8}", point.date, point.tokens);
        }
    }

    Ok(())
}

pub async fn set_level(
    client: &AdminClient,
    openid: &str,
    level: UserLevel,
) -> Result<(), ConsoleError> {
    let ack = client.update_user(openid, UserUpdate { level }).await?;
    println!("已将 {openid} 设为 {}", level.label());
    if let Some(message) = ack.message {
        println!("{message}");
    }
    Ok(())
}

pub async fn delete(client: &AdminClient, openid: &str, yes: bool) -> Result<(), ConsoleError> {
    if !yes {
        eprintln!("删除不可恢复，请加 --yes 确认");
        std::process::exit(2);
    }

    let ack = client.delete_user(openid).await?;
    println!("已删除用户 {openid}");
    if let Some(message) = ack.message {
        println!("{message}");
    }
    Ok(())
}

pub async fn status(client: &AdminClient, json: bool) -> Result<(), ConsoleError> {
    let status = client.check_status().await;

    if json {
        print_json(&status)?;
    } else {
        println!("{}  {}", if status.online { "在线" } else { "离线" }, status.message);
        println!("检查时间 {}", status.checked_at.to_rfc3339());
    }

    if !status.online {
        std::process::exit(1);
    }
    Ok(())
}

/// 缓存自检。进程内缓存起步是空的，先做两次典型读取填充再展示。
pub async fn cache(client: &AdminClient, clear: bool, json: bool) -> Result<(), ConsoleError> {
    client.get_users(true).await?;
    client.get_token_stats(true).await?;

    let populated = client.cache_diagnostics();
    if clear {
        client.clear_cache();
    }
    let remaining = client.cache_diagnostics();

    if json {
        return print_json(&json!({
            "populated": populated,
            "afterClear": if clear { Some(&remaining) } else { None },
        }));
    }

    println!("缓存条目 {}", populated.count);
    for info in &populated.keys {
        println!(
            "  {:<52} {:>6}ms  {}",
            info.key,
            info.age_ms,
            if info.fresh { "fresh" } else { "stale" }
        );
    }
    if clear {
        println!("已清空缓存（剩余 {} 条）", remaining.count);
    }

    Ok(())
}

fn filter_users<'a>(users: &'a [UserRecord], filter: &UserFilter<'_>) -> Vec<&'a UserRecord> {
    users
        .iter()
        .filter(|user| {
            let matches_search = filter.search.is_none_or(|needle| {
                let needle = needle.to_lowercase();
                user.openid.to_lowercase().contains(&needle)
                    || user
                        .nickname
                        .as_deref()
                        .is_some_and(|nickname| nickname.to_lowercase().contains(&needle))
            });
            let matches_level = filter.level.is_none_or(|level| user.level == level);
            matches_search && matches_level
        })
        .collect()
}

fn paginate<'a>(
    users: &'a [&'a UserRecord],
    page: usize,
    page_size: usize,
) -> (&'a [&'a UserRecord], usize, usize) {
    let page_size = page_size.max(1);
    let total_pages = users.len().div_ceil(page_size).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let end = (start + page_size).min(users.len());
    (&users[start..end], page, total_pages)
}

fn print_user_table(rows: &[&UserRecord]) {
    if rows.is_empty() {
        println!("没有匹配的用户");
        return;
    }

    println!(
        "{:<24} {:<14} {:<10} {:<12} {:<12} {:>8} {:>10}",
        "OpenID", "昵称", "等级", "注册时间", "最后登录", "总使用", "今日/限额"
    );
    for user in rows {
        println!(
            "{:<24} {:<14} {:<10} {:<12} {:<12} {:>8} {:>10}",
            truncate_openid(&user.openid),
            user.nickname.as_deref().unwrap_or("未设置"),
            user.level.label(),
            format_date(user.created_at),
            format_date(user.last_login_at),
            user.usage.total,
            format!("{}/{}", user.article_usage.daily, user.limits.daily),
        );
    }
}

fn write_users_csv<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    users: &[&UserRecord],
) -> Result<(), csv::Error> {
    writer.write_record([
        "昵称",
        "OpenID",
        "等级",
        "注册时间",
        "最后登录",
        "总使用次数",
        "今日使用",
        "每日限额",
    ])?;
    for user in users {
        writer.write_record([
            user.nickname.clone().unwrap_or_default(),
            user.openid.clone(),
            user.level.label().to_owned(),
            user
                .created_at
                .map(|at| at.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            user
                .last_login_at
                .map(|at| at.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            user.usage.total.to_string(),
            user.usage.daily.to_string(),
            user.limits.daily.to_string(),
        ])?;
    }
    Ok(())
}

fn truncate_openid(openid: &str) -> String {
    if openid.chars().count() > 20 {
        let head: String = openid.chars().take(20).collect();
        format!("{head}...")
    } else {
        openid.to_owned()
    }
}

fn format_date(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "未知".to_owned())
}

fn bar(count: usize) -> String {
    "█".repeat(count.min(32))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ConsoleError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
