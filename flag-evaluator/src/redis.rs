use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

// Store reads sit on the request path; anything slower than this is treated
// as unavailable and the caller falls back.
const REDIS_TIMEOUT_MILLISECS: u64 = 100;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("not found in redis")]
    NotFound,
    #[error("redis command timed out")]
    Timeout,
    #[error("parse error: {0}")]
    ParseError(String),
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

/// A simple redis wrapper exposing just the commands the flag store needs.
#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    /// Returns whether the key was set (false means it already existed).
    async fn set_nx(&self, k: String, v: String) -> Result<bool, CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    async fn sadd(&self, k: String, member: String) -> Result<(), CustomRedisError>;
    async fn smembers(&self, k: String) -> Result<Vec<String>, CustomRedisError>;
    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }

    async fn connection(&self) -> Result<redis::aio::Connection, CustomRedisError> {
        Ok(self.client.get_async_connection().await?)
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection().await?;

        let results = conn.get::<_, Option<String>>(k);
        let value = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        value.ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection().await?;

        let results = conn.set::<_, _, ()>(k, v);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        Ok(())
    }

    async fn set_nx(&self, k: String, v: String) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection().await?;

        let results = conn.set_nx::<_, _, bool>(k, v);
        let created = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        Ok(created)
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection().await?;

        let results = conn.del::<_, ()>(k);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        Ok(())
    }

    async fn sadd(&self, k: String, member: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection().await?;

        let results = conn.sadd::<_, _, ()>(k, member);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        Ok(())
    }

    async fn smembers(&self, k: String) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection().await?;

        let results = conn.smembers::<_, Vec<String>>(k);
        let members = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        Ok(members)
    }

    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("MGET");
        cmd.arg(&keys);
        let results = cmd.query_async::<_, Vec<Option<String>>>(&mut conn);
        let values = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        Ok(values)
    }
}

#[derive(Default)]
struct MockState {
    strings: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// In-memory stand-in for [`RedisClient`] so store tests run without a
/// server. Behaves like a tiny redis (including SET NX semantics) and can be
/// told to fail every command with a canned error.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
    fail_with: Arc<Mutex<Option<CustomRedisError>>>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        MockRedisClient::default()
    }

    /// Make every subsequent command fail with `err`; `None` heals it.
    pub fn fail_with(&self, err: Option<CustomRedisError>) {
        *self.fail_with.lock().expect("mock mutex poisoned") = err;
    }

    pub fn contains_key(&self, k: &str) -> bool {
        self.state
            .lock()
            .expect("mock mutex poisoned")
            .strings
            .contains_key(k)
    }

    fn check_healthy(&self) -> Result<(), CustomRedisError> {
        match &*self.fail_with.lock().expect("mock mutex poisoned") {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        self.check_healthy()?;
        let state = self.state.lock().expect("mock mutex poisoned");
        state.strings.get(&k).cloned().ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        self.check_healthy()?;
        let mut state = self.state.lock().expect("mock mutex poisoned");
        state.strings.insert(k, v);
        Ok(())
    }

    async fn set_nx(&self, k: String, v: String) -> Result<bool, CustomRedisError> {
        self.check_healthy()?;
        let mut state = self.state.lock().expect("mock mutex poisoned");
        if state.strings.contains_key(&k) {
            return Ok(false);
        }
        state.strings.insert(k, v);
        Ok(true)
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        self.check_healthy()?;
        let mut state = self.state.lock().expect("mock mutex poisoned");
        state.strings.remove(&k);
        Ok(())
    }

    async fn sadd(&self, k: String, member: String) -> Result<(), CustomRedisError> {
        self.check_healthy()?;
        let mut state = self.state.lock().expect("mock mutex poisoned");
        state.sets.entry(k).or_default().insert(member);
        Ok(())
    }

    async fn smembers(&self, k: String) -> Result<Vec<String>, CustomRedisError> {
        self.check_healthy()?;
        let state = self.state.lock().expect("mock mutex poisoned");
        Ok(state
            .sets
            .get(&k)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError> {
        self.check_healthy()?;
        let state = self.state.lock().expect("mock mutex poisoned");
        Ok(keys
            .iter()
            .map(|k| state.strings.get(k).cloned())
            .collect())
    }
}
