use sqlx::{Connection, PgConnection};
use tracing::{error, info};
use url::Url;

/// Tries to open a connection, logging the outcome without credentials.
pub async fn check_db_connection(db_url: &str) -> bool {
    let redacted = redact_url(db_url);
    match PgConnection::connect(db_url).await {
        Ok(conn) => {
            info!("✓ Successfully connected to {}", redacted);
            let _ = conn.close().await;
            true
        }
        Err(e) => {
            error!("Failed to connect to {}: {}", redacted, e);
            false
        }
    }
}

/// Strips the password from a connection URL for logging.
pub fn redact_url(db_url: &str) -> String {
    match Url::parse(db_url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
