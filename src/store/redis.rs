//! Redis-backed [`StorageBackend`].
//!
//! Reads map one-to-one onto Redis commands. Transactions are shipped to a
//! single Lua script so the guard check and the body execute as one atomic
//! unit on the server; `MULTI`/`EXEC` alone cannot skip the body based on a
//! guard's reply.
//!
//! Script arguments are flattened as
//! `ARGV = [guard_count, body_count, (argc, arg...)*]`. Keys travel in ARGV,
//! which restricts this backend to non-clustered deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::debug;

use super::{BackendError, Command, StorageBackend, Timestamp, Transaction, TxOutcome};

const TX_SCRIPT: &str = r#"
local guards = tonumber(ARGV[1])
local total = guards + tonumber(ARGV[2])
local replies = {}
local pos = 3
local guarded = 0
for i = 1, total do
  local argc = tonumber(ARGV[pos])
  local args = {}
  for j = 1, argc do
    args[j] = ARGV[pos + j]
  end
  pos = pos + argc + 1
  local reply
  if args[1] == 'HCREATE' then
    reply = 0
    if redis.call('EXISTS', args[2]) == 0 then
      args[1] = 'HSET'
      redis.call(unpack(args))
      reply = 1
    end
  elseif args[1] == 'HUPDATE' then
    reply = 0
    if redis.call('EXISTS', args[2]) == 1 then
      args[1] = 'HSET'
      redis.call(unpack(args))
      reply = 1
    end
  else
    reply = redis.call(unpack(args))
  end
  if type(reply) ~= 'number' then
    reply = 1
  end
  replies[i] = reply
  if i <= guards then
    guarded = guarded + reply
    if i == guards and guarded == 0 then
      return false
    end
  end
end
return replies
"#;

#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    script: Script,
}

impl RedisBackend {
    /// Opens a multiplexed connection to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("🔌 connected to redis at {url}");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            script: Script::new(TX_SCRIPT),
        }
    }
}

fn command_args(command: &Command) -> Vec<String> {
    match command {
        Command::HSet { key, fields } => {
            let mut args = vec!["HSET".to_string(), key.clone()];
            for (field, value) in fields {
                args.push(field.clone());
                args.push(value.clone());
            }
            args
        }
        Command::HCreate { key, fields } => {
            let mut args = vec!["HCREATE".to_string(), key.clone()];
            for (field, value) in fields {
                args.push(field.clone());
                args.push(value.clone());
            }
            args
        }
        Command::HUpdate { key, fields } => {
            let mut args = vec!["HUPDATE".to_string(), key.clone()];
            for (field, value) in fields {
                args.push(field.clone());
                args.push(value.clone());
            }
            args
        }
        Command::HIncrBy { key, field, delta } => vec![
            "HINCRBY".to_string(),
            key.clone(),
            field.clone(),
            delta.to_string(),
        ],
        Command::Del { key } => vec!["DEL".to_string(), key.clone()],
        Command::ZAdd { key, member, score } => vec![
            "ZADD".to_string(),
            key.clone(),
            score.to_string(),
            member.clone(),
        ],
        Command::ZRem { key, member } => vec!["ZREM".to_string(), key.clone(), member.clone()],
        Command::SAdd { key, member } => vec!["SADD".to_string(), key.clone(), member.clone()],
    }
}

fn script_args(tx: &Transaction) -> Vec<String> {
    let mut argv = vec![tx.guards().len().to_string(), tx.body().len().to_string()];
    for command in tx.guards().iter().chain(tx.body()) {
        let args = command_args(command);
        argv.push(args.len().to_string());
        argv.extend(args);
    }
    argv
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn now(&self) -> Result<Timestamp, BackendError> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1_000 + micros / 1_000)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Timestamp)>, BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg("-inf").arg(max).arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let members: Vec<(String, f64)> = cmd.query_async(&mut conn).await?;
        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as Timestamp))
            .collect())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<Timestamp>, BackendError> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score.map(|s| s as Timestamp))
    }

    async fn zcard(&self, key: &str) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> =
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        members.sort();
        Ok(members)
    }

    async fn exec(&self, tx: Transaction) -> Result<TxOutcome, BackendError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.prepare_invoke();
        for arg in script_args(&tx) {
            invocation.arg(arg);
        }
        let replies: Option<Vec<i64>> = invocation.invoke_async(&mut conn).await?;
        Ok(match replies {
            Some(replies) => TxOutcome::Applied(replies),
            None => TxOutcome::Aborted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_guards_before_body() {
        let tx = Transaction::new()
            .guard(Command::ZRem {
                key: "q:M".into(),
                member: "A".into(),
            })
            .then(Command::ZAdd {
                key: "q:H".into(),
                member: "A".into(),
                score: 42,
            });

        assert_eq!(
            script_args(&tx),
            vec!["1", "1", "3", "ZREM", "q:M", "A", "4", "ZADD", "q:H", "42", "A"]
        );
    }
}
