use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Server configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Defaults are suitable for local development; production deployments MUST
/// override at least `JWT_SECRET` and the database credentials.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// TCP port for the HTTP + Socket.IO listener.
    pub port: u16,
    /// Address announced in ICE candidates. `None` announces the listen IP,
    /// which only works when clients share a network with the server.
    pub announced_ip: Option<String>,
    /// UDP/TCP port range handed to the media workers.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    // ── Auth ────────────────────────────────────────────────────────────
    pub jwt_secret: String,
    /// Token lifetime in seconds, parsed from `JWT_EXPIRES_IN` (e.g. `7d`).
    pub jwt_expires_secs: i64,

    // ── Database ────────────────────────────────────────────────────────
    pub database_url: String,

    // ── Filesystem ──────────────────────────────────────────────────────
    pub uploads_dir: String,
    pub recordings_dir: String,

    // ── Muxer ───────────────────────────────────────────────────────────
    pub ffmpeg_bin: String,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                let secret = uuid::Uuid::new_v4().to_string();
                warn!("JWT_SECRET not set — using random value (not suitable for production)");
                secret
            }
        };

        let jwt_expires_secs = parse_duration_secs(&env_or("JWT_EXPIRES_IN", "7d"))
            .unwrap_or_else(|| {
                warn!("JWT_EXPIRES_IN is not a valid duration — falling back to 7d");
                7 * 24 * 3600
            });

        let port = env_or("PORT", "3000").parse::<u16>().unwrap_or(3000);

        let db_host = env_or("DB_HOST", "localhost");
        let db_port = env_or("DB_PORT", "5432");
        let db_name = env_or("DB_NAME", "huddle");
        let db_user = env_or("DB_USER", "huddle");
        let db_password = env_or("DB_PASSWORD", "huddle");
        let database_url =
            format!("postgres://{db_user}:{db_password}@{db_host}:{db_port}/{db_name}");

        let announced_ip = std::env::var("ANNOUNCED_IP").ok().filter(|s| !s.is_empty());

        let rtc_min_port = env_or("RTC_MIN_PORT", "40000").parse::<u16>().unwrap_or(40000);
        let rtc_max_port = env_or("RTC_MAX_PORT", "49999").parse::<u16>().unwrap_or(49999);

        let config = Config {
            port,
            announced_ip,
            rtc_min_port,
            rtc_max_port,
            jwt_secret,
            jwt_expires_secs,
            database_url,
            uploads_dir: env_or("UPLOADS_DIR", "./uploads"),
            recordings_dir: env_or("RECORDINGS_DIR", "./recordings"),
            ffmpeg_bin: env_or("FFMPEG_BIN", "ffmpeg"),
            log_level: env_or("LOG_LEVEL", "info"),
        };

        config.log_summary(&db_host, &db_name);
        config
    }

    fn log_summary(&self, db_host: &str, db_name: &str) {
        info!("──── Huddle Configuration ────");
        info!("  port            : {}", self.port);
        info!(
            "  announced_ip    : {}",
            self.announced_ip.as_deref().unwrap_or("(listen ip)")
        );
        info!("  rtc_ports       : {}-{}", self.rtc_min_port, self.rtc_max_port);
        info!("  database        : {db_host}/{db_name}");
        info!("  uploads_dir     : {}", self.uploads_dir);
        info!("  recordings_dir  : {}", self.recordings_dir);
        info!("  ffmpeg_bin      : {}", self.ffmpeg_bin);
        info!("  jwt_expires     : {}s", self.jwt_expires_secs);
        info!("──────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse a human duration like `7d`, `12h`, `30m` or `3600` (plain seconds).
fn parse_duration_secs(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<i64>() {
        return (secs > 0).then_some(secs);
    }
    let (number, unit) = value.split_at(value.len() - 1);
    let number = number.parse::<i64>().ok()?;
    if number <= 0 {
        return None;
    }
    match unit {
        "s" => Some(number),
        "m" => Some(number * 60),
        "h" => Some(number * 3600),
        "d" => Some(number * 86400),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration_secs("7d"), Some(7 * 86400));
        assert_eq!(parse_duration_secs("12h"), Some(12 * 3600));
        assert_eq!(parse_duration_secs("30m"), Some(1800));
        assert_eq!(parse_duration_secs("45s"), Some(45));
        assert_eq!(parse_duration_secs("3600"), Some(3600));
    }

    #[test]
    fn duration_rejects_garbage() {
        assert_eq!(parse_duration_secs(""), None);
        assert_eq!(parse_duration_secs("0d"), None);
        assert_eq!(parse_duration_secs("-5m"), None);
        assert_eq!(parse_duration_secs("soon"), None);
        assert_eq!(parse_duration_secs("7w"), None);
    }
}
