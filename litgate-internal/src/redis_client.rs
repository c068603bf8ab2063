use std::sync::Arc;

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::instrument;

use crate::auth::{ApiKeyRecord, Auth};
use crate::error::{Error, ErrorDetails};
use crate::usage_limit::{TierLimitTable, UsageMeter};

const API_KEY_KEY_PREFIX: &str = "api_key:";
const TIER_LIMIT_UPDATES_CHANNEL: &str = "tier_limit_updates";

/// Live account registry.
///
/// Loads `api_key:*` records at startup, then keeps the in-process auth
/// registry and tier limit table current from keyspace notifications and the
/// tier-limit update channel. The gateway stays usable without this (config
/// seeded keys, built-in tier table), but plan changes then require a
/// restart.
pub struct RedisClient {
    client: redis::Client,
    conn: MultiplexedConnection,
    auth: Auth,
    usage_meter: Arc<UsageMeter>,
}

impl RedisClient {
    pub async fn new(url: &str, auth: Auth, usage_meter: Arc<UsageMeter>) -> Result<Self, Error> {
        let (client, conn) = Self::init_conn(url).await.map_err(|e| {
            tracing::error!("Failed to connect to Redis: {e}");
            Error::new(ErrorDetails::InternalError {
                message: format!("Redis connection failed: {e}"),
            })
        })?;
        Ok(Self {
            client,
            conn,
            auth,
            usage_meter,
        })
    }

    async fn init_conn(url: &str) -> Result<(redis::Client, MultiplexedConnection), Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;

        Ok((client, conn))
    }

    fn parse_api_key_record(json: &str) -> Result<ApiKeyRecord, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse API key record from redis: {e}"),
            })
        })
    }

    async fn handle_set_key_event(
        key: &str,
        conn: &mut MultiplexedConnection,
        auth: &Auth,
    ) -> Result<(), Error> {
        match key {
            k if k.starts_with(API_KEY_KEY_PREFIX) => {
                let value = conn.get::<_, String>(key).await.map_err(|e| {
                    Error::new(ErrorDetails::Config {
                        message: format!("Failed to get value for key {key} from Redis: {e}"),
                    })
                })?;

                match Self::parse_api_key_record(&value) {
                    Ok(record) => {
                        // Redis keys carry the already-hashed form:
                        // "api_key:<hash>".
                        let hashed_key = key.strip_prefix(API_KEY_KEY_PREFIX).unwrap_or(key);
                        auth.update_api_key(hashed_key, record);
                        tracing::debug!("Updated API key record");
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse API key record (key: {key}): {e}")
                    }
                }
            }
            _ => {
                tracing::debug!("Ignoring set event for unknown key pattern: {key}");
            }
        }

        Ok(())
    }

    fn handle_del_key_event(key: &str, auth: &Auth) {
        if let Some(hashed_key) = key.strip_prefix(API_KEY_KEY_PREFIX) {
            auth.delete_api_key(hashed_key);
            tracing::info!("Deleted API key");
        } else {
            tracing::debug!("Ignoring del event for unknown key pattern: {key}");
        }
    }

    /// Handle a tier limit update from pub/sub. The payload is the override
    /// table; it lands on top of the built-in defaults the same way config
    /// file overrides do.
    fn handle_tier_limit_update(payload: &str, usage_meter: &UsageMeter) -> Result<(), Error> {
        let overrides: TierLimitTable = serde_json::from_str(payload).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse tier limit update: {e}"),
            })
        })?;

        usage_meter.update_limits(overrides.overlaid_on_defaults());
        tracing::info!("Applied tier limit update");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn start(mut self) -> Result<(), Error> {
        // Initial fetch: load all api_key:* records.
        if let Ok(api_key_keys) = self
            .conn
            .keys::<_, Vec<String>>(format!("{API_KEY_KEY_PREFIX}*"))
            .await
        {
            for key in api_key_keys {
                if let Ok(json) = self.conn.get::<_, String>(&key).await {
                    match Self::parse_api_key_record(&json) {
                        Ok(record) => {
                            let hashed_key =
                                key.strip_prefix(API_KEY_KEY_PREFIX).unwrap_or(&key);
                            self.auth.update_api_key(hashed_key, record);
                        }
                        Err(e) => tracing::error!(
                            "Failed to parse initial API key record (key: {key}): {e}"
                        ),
                    }
                }
            }
            tracing::info!(count = self.auth.key_count(), "Loaded API key registry");
        }

        // Get a connection for pubsub
        let mut pubsub_conn = self.client.get_async_pubsub().await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to connect to redis: {e}"),
            })
        })?;

        pubsub_conn
            .psubscribe("__keyevent@*__:set")
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to redis: {e}"),
                })
            })?;

        pubsub_conn
            .psubscribe("__keyevent@*__:del")
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to redis: {e}"),
                })
            })?;

        pubsub_conn
            .psubscribe("__keyevent@*__:expired")
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to redis: {e}"),
                })
            })?;

        pubsub_conn
            .subscribe(TIER_LIMIT_UPDATES_CHANNEL)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to tier limit updates: {e}"),
                })
            })?;

        let auth = self.auth.clone();
        let usage_meter = Arc::clone(&self.usage_meter);
        let mut conn = self.conn.clone();

        tokio::spawn(async move {
            let mut stream = pubsub_conn.on_message();
            while let Some(msg) = stream.next().await {
                let channel: String = msg.get_channel_name().to_string();

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("Failed to decode redis message: {e}");
                        continue;
                    }
                };

                match channel.as_str() {
                    c if c.ends_with("__:set") => {
                        if let Err(e) =
                            Self::handle_set_key_event(payload.as_str(), &mut conn, &auth).await
                        {
                            tracing::error!("Failed to handle set key event: {e}");
                        }
                    }
                    c if c.ends_with("__:del") || c.ends_with("__:expired") => {
                        Self::handle_del_key_event(payload.as_str(), &auth);
                    }
                    TIER_LIMIT_UPDATES_CHANNEL => {
                        if let Err(e) = Self::handle_tier_limit_update(&payload, &usage_meter) {
                            tracing::error!("Failed to handle tier limit update: {e}");
                        }
                    }
                    _ => {
                        tracing::warn!("Received message from unknown channel: {channel}");
                    }
                }
            }
        });

        Ok(())
    }
}
