// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Redis fast path for the lock manager.
//!
//! Only an accelerator: a hit here short-circuits an obviously contended
//! acquire without a database round trip. The Postgres row remains the source
//! of truth, so any Redis failure just falls back to the durable path.

use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

// Delete only when the caller still holds the key.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub(crate) struct RedisLockCache {
    conn: ConnectionManager,
}

impl RedisLockCache {
    pub(crate) fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// SET NX PX. `Ok(false)` means some live holder already has the key.
    pub(crate) async fn try_acquire(
        &self,
        key: &str,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder_token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub(crate) async fn release(
        &self,
        key: &str,
        holder_token: &str,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(holder_token)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }
}
