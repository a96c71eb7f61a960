//! Connection settings of the MongoDB score store.

use std::time::Duration;

use mongodb::{Client, Database, bson::doc, options::ClientOptions};
use tokio::time::sleep;
use tracing::debug;

use super::error::{MongoDaoError, MongoResult};

const DEFAULT_DB: &str = "score_mesh";
const PING_ATTEMPTS: u32 = 5;
const FIRST_PING_BACKOFF: Duration = Duration::from_millis(250);
const MAX_PING_BACKOFF: Duration = Duration::from_secs(5);

/// Parsed client options plus the database holding the score collections.
#[derive(Clone)]
pub struct MongoConfig {
    pub options: ClientOptions,
    pub database_name: String,
}

impl MongoConfig {
    /// Parse `uri`; `db_name` defaults to `score_mesh`.
    pub async fn from_uri(uri: &str, db_name: Option<&str>) -> MongoResult<Self> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|source| MongoDaoError::InvalidUri {
                uri: uri.to_owned(),
                source,
            })?;

        Ok(Self {
            options,
            database_name: db_name.unwrap_or(DEFAULT_DB).to_owned(),
        })
    }

    /// Build a client and wait until the server answers a ping, backing off between tries.
    pub(super) async fn open(&self) -> MongoResult<(Client, Database)> {
        let client = Client::with_options(self.options.clone())
            .map_err(|source| MongoDaoError::ClientConstruction { source })?;
        let database = client.database(&self.database_name);

        let mut backoff = FIRST_PING_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match database.run_command(doc! { "ping": 1 }).await {
                Ok(_) => return Ok((client, database)),
                Err(source) if attempt >= PING_ATTEMPTS => {
                    return Err(MongoDaoError::InitialPing {
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    debug!(attempt, error = %err, "MongoDB not answering yet");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_PING_BACKOFF);
                }
            }
        }
    }
}
