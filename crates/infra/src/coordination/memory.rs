//! In-memory coordination store for tests/dev.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Coordination, CoordinationError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Single-process stand-in for Redis, with key expiry.
#[derive(Debug, Default)]
pub struct InMemoryCoordination {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().ok()?;
        Self::purge(&mut entries, key);
        entries
            .get(key)?
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn purge(entries: &mut HashMap<String, Entry>, key: &str) {
        if entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now())
        {
            entries.remove(key);
        }
    }

    fn with<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T, CoordinationError>,
    ) -> Result<T, CoordinationError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoordinationError::Connection("coordination lock poisoned".into()))?;
        Self::purge(&mut entries, key);
        f(&mut entries)
    }
}

fn entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, init: fn() -> Value) -> &'a mut Entry {
    entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: init(),
        expires_at: None,
    })
}

fn wrong_type(key: &str) -> CoordinationError {
    CoordinationError::WrongType(key.to_string())
}

#[async_trait]
impl Coordination for InMemoryCoordination {
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, CoordinationError> {
        self.with(key, |entries| match &mut entry(entries, key, || Value::List(VecDeque::new())).value {
            Value::List(list) => {
                list.push_back(value.to_string());
                Ok(list.len() as u64)
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        self.with(key, |entries| {
            let popped = match entries.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(None),
                Some(Value::List(list)) => list.pop_front(),
                Some(_) => return Err(wrong_type(key)),
            };
            if matches!(entries.get(key).map(|e| &e.value), Some(Value::List(l)) if l.is_empty()) {
                entries.remove(key);
            }
            Ok(popped)
        })
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        self.with(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn llen(&self, key: &str) -> Result<u64, CoordinationError> {
        self.with(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CoordinationError> {
        self.with(key, |entries| match &mut entry(entries, key, || Value::Set(HashSet::new())).value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CoordinationError> {
        self.with(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        self.with(key, |entries| Ok(entries.contains_key(key)))
    }

    async fn del(&self, key: &str) -> Result<(), CoordinationError> {
        self.with(key, |entries| {
            entries.remove(key);
            Ok(())
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError> {
        self.with(key, |entries| {
            if let Some(e) = entries.get_mut(key) {
                e.expires_at = Some(Instant::now() + ttl);
            }
            Ok(())
        })
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CoordinationError> {
        self.with(key, |entries| {
            let e = entry(entries, key, || Value::Str("0".to_string()));
            let next = match &e.value {
                Value::Str(s) => s.parse::<i64>().map_err(|_| wrong_type(key))? + 1,
                _ => return Err(wrong_type(key)),
            };
            e.value = Value::Str(next.to_string());
            if e.expires_at.is_none() {
                e.expires_at = Some(Instant::now() + ttl);
            }
            Ok(next)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        self.with(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        self.with(key, |entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CoordinationError> {
        self.with(key, |entries| match &mut entry(entries, key, || Value::Hash(HashMap::new())).value {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, CoordinationError> {
        self.with(key, |entries| match &mut entry(entries, key, || Value::Hash(HashMap::new())).value {
            Value::Hash(hash) if hash.contains_key(field) => Ok(false),
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(true)
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CoordinationError> {
        self.with(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CoordinationError> {
        self.with(key, |entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64, CoordinationError> {
        self.with(key, |entries| match &mut entry(entries, key, || Value::Hash(HashMap::new())).value {
            Value::Hash(hash) => {
                let current = match hash.get(field) {
                    Some(v) => v.parse::<i64>().map_err(|_| wrong_type(key))?,
                    None => 0,
                };
                let next = current + by;
                hash.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn ping(&self) -> Result<(), CoordinationError> {
        Ok(())
    }
}
