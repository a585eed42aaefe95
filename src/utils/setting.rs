use sqlx::{Connection, MySqlConnection, PgConnection};
use tracing::{error, info};

use crate::model::ConnectionInfo;

/// Opens and closes a single connection to the datasource.
pub async fn check_db_connection(conn: &ConnectionInfo) -> bool {
    let url = match conn.to_url() {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "Cannot build a connection URL");
            return false;
        }
    };
    let result = match conn.datasource_type.as_str() {
        "mysql" => match MySqlConnection::connect(&url).await {
            Ok(c) => c.close().await,
            Err(e) => Err(e),
        },
        _ => match PgConnection::connect(&url).await {
            Ok(c) => c.close().await,
            Err(e) => Err(e),
        },
    };
    match result {
        Ok(()) => {
            info!(host = %conn.host, database = %conn.database, "Successfully connected");
            true
        }
        Err(e) => {
            error!(host = %conn.host, database = %conn.database, error = %e, "Failed to connect");
            false
        }
    }
}
