//! A Redis broker for [`drover`].
//!
//! Every queue lives under its own namespace, `drover:{queue}` by default. The braces are part of
//! the key: they make the queue name a cluster hash tag, so every key of a queue maps to the same
//! slot and the scripts may derive keys from the namespace.
//!
//! | key                         | type   | content                                            |
//! |-----------------------------|--------|----------------------------------------------------|
//! | `{ns}:id`                   | string | counter allocating job ids                         |
//! | `{ns}:seq`                  | string | enqueue sequence used to break ties                |
//! | `{ns}:job:{id}`             | hash   | the job                                            |
//! | `{ns}:job:{id}:errors`      | list   | the errors of failed attempts as JSON              |
//! | `{ns}:waiting`              | zset   | waiting jobs scored by sequence                    |
//! | `{ns}:prioritized`          | zset   | prioritized jobs scored by priority then sequence  |
//! | `{ns}:delayed`              | zset   | delayed jobs scored by when they become due        |
//! | `{ns}:active`               | zset   | active jobs scored by lock expiry                  |
//! | `{ns}:completed`/`failed`   | zset   | finished jobs scored by when they finished         |
//! | `{ns}:expiry`               | zset   | finished jobs scored by when they may be pruned    |
//! | `{ns}:repeat`               | hash   | repeatable entries by key                          |
//! | `{ns}:repeat:next`          | zset   | repeatable entries scored by their next run        |
//!
//! All timestamps are unix milliseconds. Transitions touching more than one key run as Lua
//! scripts (see `scripts.rs`) so concurrent workers never observe a job in two states.
use std::sync::{Arc, RwLock};

use drover::{
    backend::BackendError,
    events::{QueueEvent, EVENT_CAPACITY},
    job::{JobId, JobState},
};
use redis::{aio::ConnectionManager, Client, RedisError, ToRedisArgs};
use tokio::sync::broadcast;

mod backend;
mod scan;
mod scripts;
mod types;

pub use scan::ScanCounter;

use scripts::Scripts;

/// A [`drover::backend::Backend`] storing jobs in Redis.
///
/// Clones share the connection, closing one closes all of them.
#[derive(Clone)]
pub struct RedisBackend {
    conn: Arc<RwLock<Option<ConnectionManager>>>,
    namespace: NameSpace,
    scripts: Arc<Scripts>,
    events: broadcast::Sender<QueueEvent>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.namespace.0)
            .finish_non_exhaustive()
    }
}

/// Maps connection failures to [`BackendError::BrokerUnavailable`] and everything else to
/// [`BackendError::Broker`].
pub(crate) fn map_err(error: RedisError) -> BackendError {
    if error.is_io_error()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        BackendError::BrokerUnavailable(error.to_string())
    } else {
        BackendError::Broker(error.to_string())
    }
}

impl RedisBackend {
    pub const DEFAULT_PREFIX: &'static str = "drover";

    /// Connects to `redis_url` and stores the jobs of `queue` under `drover:{queue}`, braces
    /// included.
    pub async fn from_url(redis_url: &str, queue: &str) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;
        tracing::debug!(queue, "Connected to redis");
        Ok(Self::new(conn, queue))
    }

    pub fn new(conn: ConnectionManager, queue: &str) -> Self {
        Self::with_namespace(conn, queue_namespace(Self::DEFAULT_PREFIX, queue))
    }

    pub fn with_namespace(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conn: Arc::new(RwLock::new(Some(conn))),
            namespace: NameSpace(namespace.into()),
            scripts: Arc::new(Scripts::new()),
            events,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace.0
    }

    /// A handle on the shared connection, or an error once the backend was closed.
    fn connection(&self) -> Result<ConnectionManager, BackendError> {
        self.conn
            .read()
            .map_err(|_| BackendError::BadState)?
            .clone()
            .ok_or_else(|| BackendError::BrokerUnavailable("redis backend closed".to_owned()))
    }

    /// Drops the shared connection. Calls already holding a handle finish on it, the socket is
    /// closed once the last of them returns.
    fn release(&self) -> Result<bool, BackendError> {
        Ok(self
            .conn
            .write()
            .map_err(|_| BackendError::BadState)?
            .take()
            .is_some())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

/// `{prefix}:{queue}` with the queue name as a hash tag.
fn queue_namespace(prefix: &str, queue: &str) -> String {
    format!("{prefix}:{{{queue}}}")
}

#[derive(Clone, Debug)]
struct NameSpace(String);

impl NameSpace {
    fn key<'a>(&'a self, kind: KeyType<'a>) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
    }

    fn job<'a>(&'a self, id: &'a JobId) -> NameSpacedKey<'a> {
        self.key(KeyType::Job(id))
    }

    fn errors<'a>(&'a self, id: &'a JobId) -> NameSpacedKey<'a> {
        self.key(KeyType::Errors(id))
    }

    fn state(&self, state: JobState) -> NameSpacedKey<'_> {
        self.key(KeyType::State(state))
    }

    fn repeat(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Repeat)
    }

    fn repeat_next(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::RepeatNext)
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType<'a>,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Job(id) => write!(f, ":job:{id}"),
            KeyType::Errors(id) => write!(f, ":job:{id}:errors"),
            KeyType::State(state) => write!(f, ":{state}"),
            KeyType::Repeat => write!(f, ":repeat"),
            KeyType::RepeatNext => write!(f, ":repeat:next"),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType<'a> {
    Job(&'a JobId),
    Errors(&'a JobId),
    State(JobState),
    Repeat,
    RepeatNext,
}
