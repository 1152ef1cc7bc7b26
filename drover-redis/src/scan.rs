use async_trait::async_trait;
use drover::{
    backend::BackendError,
    metrics::{KeyScan, ScanBatch},
};
use redis::{aio::ConnectionManager, Client};

use crate::map_err;

/// Counts the keys under a prefix with a single `SCAN` pass.
///
/// A pass returns at most roughly `count` keys; a non zero cursor means the keyspace was not
/// exhausted and the batch is reported as incomplete.
#[derive(Clone)]
pub struct ScanCounter {
    conn: ConnectionManager,
    pattern: String,
    count: u64,
}

impl std::fmt::Debug for ScanCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCounter")
            .field("pattern", &self.pattern)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl ScanCounter {
    pub const DEFAULT_COUNT: u64 = 10_000;

    pub async fn from_url(redis_url: &str, prefix: &str) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;
        Ok(Self::new(conn, prefix))
    }

    /// Counts the keys matching `{prefix}:*`.
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            pattern: format!("{prefix}:*"),
            count: Self::DEFAULT_COUNT,
        }
    }

    pub fn with_count(self, count: u64) -> Self {
        Self { count, ..self }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

#[async_trait]
impl KeyScan for ScanCounter {
    async fn scan_once(&self) -> Result<ScanBatch, BackendError> {
        let mut conn = self.conn.clone();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(0)
            .arg("MATCH")
            .arg(&self.pattern)
            .arg("COUNT")
            .arg(self.count)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(ScanBatch {
            keys: keys.len() as u64,
            complete: cursor == 0,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use drover::metrics::ReadPositionGauge;
    use rand::{distributions::Alphanumeric, Rng};

    const DEFAULT_URL: &str = "redis://127.0.0.1";

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn counts_keys_in_one_pass() {
        let prefix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let counter = ScanCounter::from_url(DEFAULT_URL, &format!("positions-{prefix}"))
            .await
            .unwrap();
        let mut conn = counter.conn.clone();
        for user in 0..3 {
            let _: () = redis::cmd("SET")
                .arg(format!("positions-{prefix}:user-{user}"))
                .arg(1)
                .query_async(&mut conn)
                .await
                .unwrap();
        }

        let gauge = ReadPositionGauge::new(counter.clone());
        assert_eq!(gauge.read().await.unwrap(), 3);
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn truncated_scans_report_the_sentinel() {
        let counter = ScanCounter::from_url(DEFAULT_URL, "positions")
            .await
            .unwrap()
            .with_count(1);
        let mut conn = counter.conn.clone();
        for key in 0..50 {
            let _: () = redis::cmd("SET")
                .arg(format!("filler-{key}"))
                .arg(1)
                .query_async(&mut conn)
                .await
                .unwrap();
        }

        let gauge = ReadPositionGauge::new(counter).with_sentinel(7);
        assert_eq!(gauge.read().await.unwrap(), 7);
    }
}
