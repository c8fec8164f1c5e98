use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde_json::Value;
use shared::domain::{ConnectionId, ConnectionInfo};

use crate::{
    keys::{connection_key, state_key},
    ModuleStates, SessionStore, StateFactory, StoreError,
};

/// Backend on an external Redis deployment. The connection marker and each
/// module state are separate keys with their own expiry; batch writes and
/// renewals go through `MULTI/EXEC`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str, ttl: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            ttl,
        })
    }

    fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    async fn ensure_connection(
        &self,
        conn: &mut ConnectionManager,
        id: &ConnectionId,
    ) -> Result<(), StoreError> {
        let exists: bool = redis::cmd("EXISTS")
            .arg(connection_key(&self.prefix, id))
            .query_async(conn)
            .await?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::UnknownConnection(id.clone()))
        }
    }
}

fn encode(key: &str, value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

#[async_trait]
impl SessionStore for RedisStore {
    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn new_connection(&self) -> Result<ConnectionId, StoreError> {
        let id = ConnectionId::generate();
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(connection_key(&self.prefix, &id))
            .arg(Utc::now().timestamp_millis())
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn connection_info(&self, id: &ConnectionId) -> Result<ConnectionInfo, StoreError> {
        let key = connection_key(&self.prefix, id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        let raw = raw.ok_or_else(|| StoreError::UnknownConnection(id.clone()))?;
        let millis: i64 = decode(&key, &raw)?;
        Ok(ConnectionInfo {
            id: id.clone(),
            created_at: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default(),
        })
    }

    async fn renew_connection(
        &self,
        id: &ConnectionId,
        module_names: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.ensure_connection(&mut conn, id).await?;

        let ttl = self.ttl_seconds();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("EXPIRE")
            .arg(connection_key(&self.prefix, id))
            .arg(ttl)
            .ignore();
        for module_name in module_names {
            pipe.cmd("EXPIRE")
                .arg(state_key(&self.prefix, id, module_name))
                .arg(ttl)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_state(
        &self,
        id: &ConnectionId,
        module_name: &str,
        initial: StateFactory<'_>,
    ) -> Result<Value, StoreError> {
        let mut conn = self.conn.clone();
        self.ensure_connection(&mut conn, id).await?;

        let key = state_key(&self.prefix, id, module_name);
        let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        if let Some(raw) = raw {
            return decode(&key, &raw);
        }

        let value = initial();
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(encode(&key, &value)?)
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn update_state(
        &self,
        id: &ConnectionId,
        states: &ModuleStates,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.ensure_connection(&mut conn, id).await?;
        if states.is_empty() {
            return Ok(());
        }

        let ttl = self.ttl_seconds();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (module_name, value) in states {
            let key = state_key(&self.prefix, id, module_name);
            let encoded = encode(&key, value)?;
            pipe.cmd("SET").arg(key).arg(encoded).arg("EX").arg(ttl).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
