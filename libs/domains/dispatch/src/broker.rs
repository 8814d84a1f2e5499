//! Typed Redis surface for the dispatch engine.
//!
//! All cross-worker mutable state (priority streams, dedup set, retry and
//! scheduled sets, dead-letter list, counters, token buckets) is owned by
//! Redis and mutated exclusively through this client, either as a server-side
//! Lua script or a MULTI/EXEC pipeline. Workers and the scheduler never cache
//! shared counters locally.

use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::metrics;
use crate::models::{EmailJob, JobStatus, Priority, ProviderKind};
use crate::retry::{backoff_delay, DeadLetterEntry};
use crate::streams;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Atomic dedup-checked enqueue. Rejecting, marking and appending happen in
/// one script so no interleaving can enqueue the same job id twice.
const ENQUEUE_SCRIPT: &str = r#"
local stream_key = KEYS[1]
local dedup_key = KEYS[2]
local job_id = ARGV[1]
local job_data = ARGV[2]
local dedup_ttl = tonumber(ARGV[3])

if redis.call('SISMEMBER', dedup_key, job_id) == 1 then
    return 0
end

redis.call('SADD', dedup_key, job_id)
redis.call('EXPIRE', dedup_key, dedup_ttl)

return redis.call('XADD', stream_key, '*', 'job', job_data)
"#;

/// Token bucket check-and-consume. Refill is computed from wall-clock time at
/// the server; the bucket hash expires after an hour of inactivity so a cold
/// provider restarts with a full bucket.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local bucket_size = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local tokens_requested = tonumber(ARGV[3])
local current_time = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or bucket_size
local last_refill = tonumber(bucket[2]) or current_time

local time_elapsed = current_time - last_refill
local tokens_to_add = math.floor(time_elapsed * refill_rate / 60)

if tokens_to_add > 0 then
    tokens = math.min(bucket_size, tokens + tokens_to_add)
    last_refill = current_time
end

if tokens >= tokens_requested then
    tokens = tokens - tokens_requested
    redis.call('HMSET', key, 'tokens', tokens, 'last_refill', last_refill)
    redis.call('EXPIRE', key, 3600)
    return 1
else
    redis.call('HMSET', key, 'tokens', tokens, 'last_refill', last_refill)
    redis.call('EXPIRE', key, 3600)
    return 0
end
"#;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to a priority stream at this entry id.
    Queued(String),
    /// Rejected by the dedup window. Treated as success by intake.
    Duplicate,
}

/// Where a promotion came from, for logs and metrics.
#[derive(Debug, Clone, Copy)]
enum PromotionSource {
    Scheduled,
    Retry,
}

impl PromotionSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Retry => "retry",
        }
    }

    fn set_key(&self) -> &'static str {
        match self {
            Self::Scheduled => streams::SCHEDULED_KEY,
            Self::Retry => streams::RETRY_KEY,
        }
    }
}

/// System-wide statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    /// Jobs delivered today.
    pub sent_today: u64,
    /// Failed attempts today (including attempts that later succeeded).
    pub failed_today: u64,
    /// Stream length per priority.
    pub queue_depths: BTreeMap<String, u64>,
    /// Jobs waiting in the retry set.
    pub retry_pending: u64,
    /// Jobs waiting in the scheduled set.
    pub scheduled_pending: u64,
    /// Entries in the dead-letter store.
    pub dead_letters: u64,
    /// Current token level per provider with bucket state.
    pub provider_tokens: BTreeMap<String, u64>,
}

/// Redis client for email dispatch operations.
pub struct BrokerClient {
    redis: ConnectionManager,
    config: Arc<DispatchConfig>,
    enqueue_script: Script,
    token_bucket_script: Script,
}

impl BrokerClient {
    /// Create a broker client over an established connection.
    pub fn new(redis: ConnectionManager, config: Arc<DispatchConfig>) -> Self {
        Self {
            redis,
            config,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            token_bucket_script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    /// Open a connection from Redis config and wrap it.
    pub async fn connect(
        redis_config: &core_config::redis::RedisConfig,
        config: Arc<DispatchConfig>,
    ) -> DispatchResult<Self> {
        let client = redis::Client::open(redis_config.uri())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager, config))
    }

    /// Engine configuration this client operates with.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Enqueue a job into its priority stream, deduplicating on job id.
    pub async fn enqueue(&self, job: &EmailJob) -> DispatchResult<EnqueueOutcome> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(job)?;
        let job_id = job.job_id();

        let value: redis::Value = self
            .enqueue_script
            .key(streams::queue_key(job.priority))
            .key(streams::DEDUP_KEY)
            .arg(&job_id)
            .arg(&payload)
            .arg(self.config.dedup_ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        match value {
            redis::Value::Int(0) => {
                debug!(job_id = %job_id, "Duplicate enqueue rejected by dedup window");
                Ok(EnqueueOutcome::Duplicate)
            }
            redis::Value::BulkString(bytes) => {
                let stream_id = String::from_utf8_lossy(&bytes).into_owned();
                debug!(
                    job_id = %job_id,
                    stream_id = %stream_id,
                    priority = %job.priority,
                    "Queued email job"
                );
                Ok(EnqueueOutcome::Queued(stream_id))
            }
            redis::Value::SimpleString(s) => Ok(EnqueueOutcome::Queued(s)),
            other => Err(DispatchError::Internal(format!(
                "unexpected enqueue reply: {other:?}"
            ))),
        }
    }

    /// Read up to `count` jobs for this consumer, scanning priorities
    /// HIGH -> MEDIUM -> LOW and stopping at the first non-empty stream.
    /// A batch therefore never mixes priorities.
    ///
    /// The consumer's own pending entries (redeliveries after a crash, or
    /// entries claimed from dead consumers) are drained before new messages.
    pub async fn dequeue(&self, consumer: &str, count: usize) -> DispatchResult<Vec<EmailJob>> {
        for priority in Priority::ALL {
            let key = streams::queue_key(priority);

            let pending = self.read_stream(&key, consumer, count, false).await?;
            if !pending.is_empty() {
                debug!(count = pending.len(), priority = %priority, "Re-reading pending messages");
                return Ok(pending);
            }

            let fresh = self.read_stream(&key, consumer, count, true).await?;
            if !fresh.is_empty() {
                return Ok(fresh);
            }
        }

        Ok(vec![])
    }

    async fn read_stream(
        &self,
        key: &str,
        consumer: &str,
        count: usize,
        new_messages: bool,
    ) -> DispatchResult<Vec<EmailJob>> {
        let mut conn = self.redis.clone();

        let mut opts = StreamReadOptions::default()
            .group(streams::CONSUMER_GROUP, consumer)
            .count(count);

        // ">" reads new messages with a short block so priority preemption
        // latency stays bounded; "0" re-reads this consumer's pending list.
        let id = if new_messages {
            opts = opts.block(self.config.block_timeout_ms as usize);
            ">"
        } else {
            "0"
        };

        let result: Result<StreamReadReply, _> = conn.xread_options(&[key], &[id], &opts).await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if is_nogroup_error(&e) => {
                self.ensure_consumer_group(key).await?;
                return Ok(vec![]);
            }
            Err(e) if is_block_timeout(&e) => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        for stream_key in reply.keys {
            for message in stream_key.ids {
                match parse_job(&message.map) {
                    Ok(mut job) => {
                        job.stream_id = Some(message.id.clone());
                        jobs.push(job);
                    }
                    Err(e) => {
                        warn!(
                            message_id = %message.id,
                            error = %e,
                            "Failed to parse job, quarantining raw entry"
                        );
                        if let Err(qe) = self.quarantine_raw(key, &message.id, &message.map).await {
                            warn!(message_id = %message.id, error = %qe, "Failed to quarantine entry");
                        }
                    }
                }
            }
        }

        Ok(jobs)
    }

    /// Acknowledge a processed job and apply the state-machine transition.
    ///
    /// Success: ack + delete the stream entry and bump the daily `sent`
    /// counter. Failure: bump `retry_count`; dead-letter once retries are
    /// exhausted, otherwise park in the retry set at `now + backoff`. Every
    /// branch runs as a single MULTI/EXEC so the job is never visible in two
    /// places at once.
    pub async fn ack(&self, job: &mut EmailJob, success: bool) -> DispatchResult<()> {
        let stream_id = job
            .stream_id
            .clone()
            .ok_or_else(|| DispatchError::Internal("cannot ack a job without a stream id".into()))?;
        let queue_key = streams::queue_key(job.priority);
        let job_id = job.job_id();
        let mut conn = self.redis.clone();

        if success {
            job.status = JobStatus::Sent;

            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("XACK")
                .arg(&queue_key)
                .arg(streams::CONSUMER_GROUP)
                .arg(&stream_id)
                .ignore()
                .cmd("XDEL")
                .arg(&queue_key)
                .arg(&stream_id)
                .ignore()
                .cmd("HINCRBY")
                .arg(streams::STATS_KEY)
                .arg("sent")
                .arg(1)
                .ignore();
            pipe.query_async::<()>(&mut conn).await?;

            debug!(job_id = %job_id, stream_id = %stream_id, "Acknowledged sent job");
            return Ok(());
        }

        job.retry_count += 1;

        if job.retry_count >= self.config.retry_attempts {
            job.status = JobStatus::DeadLetter;
            let error = job
                .last_error
                .clone()
                .unwrap_or_else(|| "send failed".to_string());
            self.finalize_dead_letter(job, &queue_key, &stream_id, &error)
                .await?;

            warn!(
                job_id = %job_id,
                retry_count = job.retry_count,
                "Job exhausted retries, moved to dead letter"
            );
            return Ok(());
        }

        job.status = JobStatus::Retry;
        let delay = backoff_delay(job.retry_count);
        let due = Utc::now().timestamp() + delay.as_secs() as i64;

        // Body is persisted alongside the retry entry so promotion can
        // re-enqueue the full snapshot; the dedup mark is released in the
        // same transaction that removes the job from the live stream.
        let mut body = job.clone();
        body.stream_id = None;
        let payload = serde_json::to_string(&body)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(streams::RETRY_KEY, &job_id, due)
            .ignore()
            .set_ex(
                streams::job_body_key(&job_id),
                &payload,
                self.config.dead_letter_ttl_secs,
            )
            .ignore()
            .srem(streams::DEDUP_KEY, &job_id)
            .ignore()
            .cmd("XACK")
            .arg(&queue_key)
            .arg(streams::CONSUMER_GROUP)
            .arg(&stream_id)
            .ignore()
            .cmd("XDEL")
            .arg(&queue_key)
            .arg(&stream_id)
            .ignore()
            .cmd("HINCRBY")
            .arg(streams::STATS_KEY)
            .arg("failed")
            .arg(1)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        metrics::record_retry(job.provider.as_str(), job.retry_count);
        info!(
            job_id = %job_id,
            retry_count = job.retry_count,
            delay_secs = delay.as_secs(),
            "Scheduled job retry with backoff"
        );
        Ok(())
    }

    /// Move a job straight to the dead-letter store after a permanent
    /// failure, leaving `retry_count` untouched.
    pub async fn dead_letter(&self, job: &mut EmailJob, error: &str) -> DispatchResult<()> {
        let stream_id = job
            .stream_id
            .clone()
            .ok_or_else(|| DispatchError::Internal("cannot ack a job without a stream id".into()))?;
        let queue_key = streams::queue_key(job.priority);

        job.status = JobStatus::DeadLetter;
        self.finalize_dead_letter(job, &queue_key, &stream_id, error)
            .await?;

        warn!(job_id = %job.job_id(), error = %error, "Permanent failure, moved to dead letter");
        Ok(())
    }

    async fn finalize_dead_letter(
        &self,
        job: &EmailJob,
        queue_key: &str,
        stream_id: &str,
        error: &str,
    ) -> DispatchResult<()> {
        let mut conn = self.redis.clone();
        let job_id = job.job_id();

        let mut snapshot = job.clone();
        snapshot.stream_id = None;
        snapshot.last_error = Some(error.to_string());
        let entry = serde_json::to_string(&DeadLetterEntry::new(snapshot, error))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(streams::DEAD_LETTER_KEY, &entry)
            .ignore()
            .expire(
                streams::DEAD_LETTER_KEY,
                self.config.dead_letter_ttl_secs as i64,
            )
            .ignore()
            .srem(streams::DEDUP_KEY, &job_id)
            .ignore()
            .cmd("XACK")
            .arg(queue_key)
            .arg(streams::CONSUMER_GROUP)
            .arg(stream_id)
            .ignore()
            .cmd("XDEL")
            .arg(queue_key)
            .arg(stream_id)
            .ignore()
            .cmd("HINCRBY")
            .arg(streams::STATS_KEY)
            .arg("failed")
            .arg(1)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        metrics::record_job_processed(job.provider.as_str(), metrics::JobOutcome::DeadLettered);
        Ok(())
    }

    /// Check-and-consume `tokens` from the provider's bucket.
    ///
    /// Returns `false` when the bucket cannot cover the request; the caller
    /// must not call the provider and routes the job to the retry path.
    pub async fn check_rate(&self, provider: ProviderKind, tokens: u32) -> DispatchResult<bool> {
        let mut conn = self.redis.clone();
        let limits = self.config.rate_limit(provider);

        let allowed: i64 = self
            .token_bucket_script
            .key(streams::rate_limit_key(provider))
            .arg(limits.bucket_size)
            .arg(limits.refill_rate)
            .arg(tokens)
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await?;

        Ok(allowed == 1)
    }

    /// Park a future-dated job: schedule entry plus body under a 7-day TTL so
    /// a long outage cannot leave an entry pointing at nothing.
    pub async fn schedule(&self, job: &EmailJob) -> DispatchResult<()> {
        let scheduled_at = job.scheduled_at.ok_or_else(|| {
            DispatchError::Internal("schedule() requires a scheduled_at timestamp".into())
        })?;
        let mut conn = self.redis.clone();
        let job_id = job.job_id();
        let payload = serde_json::to_string(job)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(streams::SCHEDULED_KEY, &job_id, scheduled_at.timestamp())
            .ignore()
            .set_ex(
                streams::job_body_key(&job_id),
                &payload,
                self.config.dead_letter_ttl_secs,
            )
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        info!(
            job_id = %job_id,
            scheduled_at = %scheduled_at,
            "Scheduled email for future delivery"
        );
        Ok(())
    }

    /// Promote scheduled jobs whose send time has arrived.
    pub async fn promote_due_scheduled(&self, now: i64) -> DispatchResult<usize> {
        self.promote_due(PromotionSource::Scheduled, now).await
    }

    /// Promote retry entries whose due time has arrived.
    pub async fn process_due_retries(&self, now: i64) -> DispatchResult<usize> {
        self.promote_due(PromotionSource::Retry, now).await
    }

    async fn promote_due(&self, source: PromotionSource, now: i64) -> DispatchResult<usize> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = conn.zrangebyscore(source.set_key(), 0, now).await?;

        let mut promoted = 0;
        for job_id in due {
            match self.promote_one(source, &job_id).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        job_id = %job_id,
                        source = source.as_str(),
                        error = %e,
                        "Failed to promote job"
                    );
                }
            }
        }

        if promoted > 0 {
            info!(count = promoted, source = source.as_str(), "Promoted due jobs");
        }
        Ok(promoted)
    }

    /// Promote a single entry: append first, remove the set entry after, so
    /// a crash leaves the job in the set or the stream, never in neither.
    /// The dedup guard inside `enqueue` makes a concurrent promoter
    /// harmless.
    async fn promote_one(&self, source: PromotionSource, job_id: &str) -> DispatchResult<bool> {
        let mut conn = self.redis.clone();
        let body_key = streams::job_body_key(job_id);

        let body: Option<String> = conn.get(&body_key).await?;
        let Some(raw) = body else {
            let _: () = conn.zrem(source.set_key(), job_id).await?;
            metrics::record_promotion_dropped(source.as_str());
            warn!(
                job_id = %job_id,
                source = source.as_str(),
                "Job body expired before promotion, dropping entry"
            );
            return Ok(false);
        };

        let mut job: EmailJob = serde_json::from_str(&raw)?;
        job.status = JobStatus::Pending;
        job.stream_id = None;

        self.enqueue(&job).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(source.set_key(), job_id)
            .ignore()
            .del(&body_key)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(true)
    }

    /// Create the consumer group on every priority stream. Safe to call
    /// repeatedly; BUSYGROUP is ignored.
    pub async fn ensure_groups(&self) -> DispatchResult<()> {
        for priority in Priority::ALL {
            self.ensure_consumer_group(&streams::queue_key(priority))
                .await?;
        }
        Ok(())
    }

    async fn ensure_consumer_group(&self, key: &str) -> DispatchResult<()> {
        let mut conn = self.redis.clone();

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(streams::CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream = %key, group = streams::CONSUMER_GROUP, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %key, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(DispatchError::Queue(e.to_string())),
        }
    }

    /// Claim pending entries idle longer than `min_idle_ms` onto this
    /// consumer, across all priority streams. With `min_idle_ms = 0` this
    /// adopts everything pending in the group, which workers do on startup.
    pub async fn claim_stale(&self, consumer: &str, min_idle_ms: u64) -> DispatchResult<usize> {
        let mut conn = self.redis.clone();
        let mut total_claimed = 0;

        for priority in Priority::ALL {
            let key = streams::queue_key(priority);
            let mut start_id = "0-0".to_string();

            loop {
                // XAUTOCLAIM response: [next-start-id, [[msg-id, fields], ...], [deleted-ids]]
                let result: redis::Value = redis::cmd("XAUTOCLAIM")
                    .arg(&key)
                    .arg(streams::CONSUMER_GROUP)
                    .arg(consumer)
                    .arg(min_idle_ms)
                    .arg(&start_id)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .unwrap_or(redis::Value::Nil);

                let redis::Value::Array(arr) = &result else { break };
                if arr.len() < 2 {
                    break;
                }

                let redis::Value::BulkString(next_id) = &arr[0] else { break };
                let next = String::from_utf8_lossy(next_id).to_string();

                if let redis::Value::Array(messages) = &arr[1] {
                    total_claimed += messages.len();
                    if messages.is_empty() && next == "0-0" {
                        break;
                    }
                } else {
                    break;
                }

                if next == "0-0" {
                    break;
                }
                start_id = next;
            }
        }

        if total_claimed > 0 {
            info!(count = total_claimed, consumer = %consumer, "Claimed pending messages");
        }
        Ok(total_claimed)
    }

    /// Snapshot of counters, queue depths and token levels.
    pub async fn stats(&self) -> DispatchResult<StatsSnapshot> {
        let mut conn = self.redis.clone();

        let counters: HashMap<String, String> = conn.hgetall(streams::STATS_KEY).await?;
        let read_counter = |field: &str| {
            counters
                .get(field)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let mut queue_depths = BTreeMap::new();
        for priority in Priority::ALL {
            let depth: u64 = conn.xlen(streams::queue_key(priority)).await?;
            metrics::set_queue_depth(priority.as_str(), depth as f64);
            queue_depths.insert(priority.as_str().to_string(), depth);
        }

        let mut provider_tokens = BTreeMap::new();
        for provider in ProviderKind::ALL {
            if !self.config.rate_limits.contains_key(&provider) {
                continue;
            }
            let tokens: Option<String> = conn
                .hget(streams::rate_limit_key(provider), "tokens")
                .await?;
            if let Some(tokens) = tokens.and_then(|t| t.parse::<u64>().ok()) {
                provider_tokens.insert(provider.as_str().to_string(), tokens);
            }
        }

        let retry_pending: u64 = conn.zcard(streams::RETRY_KEY).await?;
        let scheduled_pending: u64 = conn.zcard(streams::SCHEDULED_KEY).await?;
        let dead_letters: u64 = conn.llen(streams::DEAD_LETTER_KEY).await?;

        Ok(StatsSnapshot {
            sent_today: read_counter("sent"),
            failed_today: read_counter("failed"),
            queue_depths,
            retry_pending,
            scheduled_pending,
            dead_letters,
            provider_tokens,
        })
    }

    /// Most recent dead-letter entries, newest first.
    pub async fn dead_letters(&self, limit: usize) -> DispatchResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn
            .lrange(streams::DEAD_LETTER_KEY, 0, limit as isize - 1)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<DeadLetterEntry>(&item) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping unparseable dead letter entry"),
            }
        }
        Ok(entries)
    }

    /// Quarantine a stream entry whose payload cannot be parsed: the raw
    /// fields go to the dead-letter store and the entry is acked so it cannot
    /// loop forever.
    async fn quarantine_raw(
        &self,
        queue_key: &str,
        message_id: &str,
        map: &HashMap<String, redis::Value>,
    ) -> DispatchResult<()> {
        let mut conn = self.redis.clone();

        let entry = serde_json::json!({
            "raw_message": format!("{map:?}"),
            "original_id": message_id,
            "error": "Failed to parse job",
            "failed_at": Utc::now().to_rfc3339(),
        });

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(streams::DEAD_LETTER_KEY, entry.to_string())
            .ignore()
            .expire(
                streams::DEAD_LETTER_KEY,
                self.config.dead_letter_ttl_secs as i64,
            )
            .ignore()
            .cmd("XACK")
            .arg(queue_key)
            .arg(streams::CONSUMER_GROUP)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(queue_key)
            .arg(message_id)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(())
    }
}

/// Parse a job out of a stream entry's field map.
fn parse_job(map: &HashMap<String, redis::Value>) -> DispatchResult<EmailJob> {
    let job_value = map
        .get("job")
        .ok_or_else(|| DispatchError::Internal("Missing 'job' field in message".to_string()))?;

    let job_str = match job_value {
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        redis::Value::SimpleString(s) => s.clone(),
        _ => {
            return Err(DispatchError::Internal(
                "Invalid 'job' field type".to_string(),
            ));
        }
    };

    let job: EmailJob = serde_json::from_str(&job_str)?;
    Ok(job)
}

/// BLOCK timeouts are normal behavior (no messages within the window), not
/// errors. Patterns cover the shapes Redis and the connection layer produce.
fn is_block_timeout(e: &redis::RedisError) -> bool {
    let err_str = e.to_string().to_lowercase();
    err_str.contains("timeout")
        || err_str.contains("timed out")
        || err_str.contains("nil")
        || (err_str.contains("response") && err_str.contains("type"))
}

fn is_nogroup_error(e: &redis::RedisError) -> bool {
    e.to_string().contains("NOGROUP")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_job_from_bulk_string() {
        let job = EmailJob::new(
            vec!["user@example.com".to_string()],
            "notification",
            json!({"subject": "hi"}),
            Priority::High,
            ProviderKind::Sendgrid,
        )
        .unwrap();
        let payload = serde_json::to_string(&job).unwrap();

        let mut map = HashMap::new();
        map.insert(
            "job".to_string(),
            redis::Value::BulkString(payload.into_bytes()),
        );

        let parsed = parse_job(&map).unwrap();
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.priority, Priority::High);
    }

    #[test]
    fn test_parse_job_missing_field() {
        let map = HashMap::new();
        assert!(parse_job(&map).is_err());
    }

    #[test]
    fn test_parse_job_invalid_payload() {
        let mut map = HashMap::new();
        map.insert(
            "job".to_string(),
            redis::Value::BulkString(b"not json".to_vec()),
        );
        assert!(parse_job(&map).is_err());
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let mut snapshot = StatsSnapshot::default();
        snapshot.sent_today = 12;
        snapshot
            .queue_depths
            .insert("high".to_string(), 3);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["sent_today"], 12);
        assert_eq!(value["queue_depths"]["high"], 3);
    }

    #[test]
    fn test_enqueue_script_shape() {
        // The dedup window and the append must live in one script.
        assert!(ENQUEUE_SCRIPT.contains("SISMEMBER"));
        assert!(ENQUEUE_SCRIPT.contains("XADD"));
        assert!(TOKEN_BUCKET_SCRIPT.contains("HMGET"));
        assert!(TOKEN_BUCKET_SCRIPT.contains("EXPIRE"));
    }
}
