//! Lua scripts performing every multi-key state transition atomically.
//!
//! Every script takes the queue namespace as `KEYS[1]` and derives the other keys from it using
//! the layout documented at the crate root. Job keys are only known once a script ran (a claim
//! pops its id), so they cannot be declared up front. The namespace carries the queue name as a
//! hash tag, which keeps every derived key in the slot of `KEYS[1]` on a cluster.
use redis::Script;

/// Shared helpers prepended to every script.
const PRELUDE: &str = r#"
local ns = KEYS[1]
local function job_key(id) return ns .. ":job:" .. id end
local function errors_key(id) return ns .. ":job:" .. id .. ":errors" end

-- Scores of prioritized jobs order by priority then by enqueue sequence.
local SEQ_SPACE = 4294967296

local function make_ready(id)
  local key = job_key(id)
  local seq = redis.call("INCR", ns .. ":seq")
  local priority = tonumber(redis.call("HGET", key, "priority") or "0")
  local state
  if priority > 0 then
    state = "prioritized"
    redis.call("ZADD", ns .. ":prioritized", priority * SEQ_SPACE + seq, id)
  else
    state = "waiting"
    redis.call("ZADD", ns .. ":waiting", seq, id)
  end
  redis.call("HSET", key, "state", state, "seq", seq)
  return state
end

local function finish(id, state, now)
  local key = job_key(id)
  redis.call("ZREM", ns .. ":active", id)
  redis.call("ZADD", ns .. ":" .. state, now, id)
  redis.call("HSET", key, "state", state, "finished_at", now)
  local field = "keep_completed_ms"
  if state == "failed" then field = "keep_failed_ms" end
  local keep = tonumber(redis.call("HGET", key, field) or "-1")
  if keep >= 0 then
    redis.call("ZADD", ns .. ":expiry", now + keep, id)
  end
end

local function record_error(id, error_type, message, now)
  local attempt = tonumber(redis.call("HGET", job_key(id), "attempts_made") or "0")
  redis.call("RPUSH", errors_key(id), cjson.encode({
    attempt = attempt,
    error_type = error_type,
    message = message,
    recorded_at = now,
  }))
  return attempt
end

-- Returns -1 for a missing job, 0 for a job that is not active under the claim of `attempt` and
-- 1 otherwise.
local function check_claim(id, attempt)
  local fields = redis.call("HMGET", job_key(id), "state", "attempts_made")
  if not fields[1] then return -1 end
  if fields[1] ~= "active" or tonumber(fields[2]) ~= tonumber(attempt) then return 0 end
  return 1
end
"#;

/// ARGV: id (empty to allocate one), now, scheduled_at, priority, type_name, payload,
/// max_attempts, backoff, repeat (empty for none), retention, keep_completed_ms, keep_failed_ms.
///
/// Returns `{id, inserted}`.
const ENQUEUE: &str = r#"
local id = ARGV[1]
if id == "" then
  id = tostring(redis.call("INCR", ns .. ":id"))
end
local key = job_key(id)
local existing = redis.call("HGET", key, "state")
if existing then
  if existing ~= "completed" and existing ~= "failed" then
    return {id, 0}
  end
  redis.call("ZREM", ns .. ":" .. existing, id)
  redis.call("ZREM", ns .. ":expiry", id)
  redis.call("DEL", key, errors_key(id))
end

local now = tonumber(ARGV[2])
local scheduled_at = tonumber(ARGV[3])
redis.call("HSET", key,
  "type_name", ARGV[5],
  "payload", ARGV[6],
  "priority", ARGV[4],
  "max_attempts", ARGV[7],
  "backoff", ARGV[8],
  "repeat", ARGV[9],
  "retention", ARGV[10],
  "keep_completed_ms", ARGV[11],
  "keep_failed_ms", ARGV[12],
  "attempts_made", 0,
  "created_at", now,
  "scheduled_at", scheduled_at)
if scheduled_at > now then
  redis.call("ZADD", ns .. ":delayed", scheduled_at, id)
  redis.call("HSET", key, "state", "delayed", "seq", redis.call("INCR", ns .. ":seq"))
else
  make_ready(id)
end
return {id, 1}
"#;

/// ARGV: now, lock_ms.
///
/// Promotes the due delayed jobs then claims the next ready one. Returns its id or nil.
const CLAIM: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call("ZRANGEBYSCORE", ns .. ":delayed", "-inf", now, "LIMIT", 0, 1000)
for _, id in ipairs(due) do
  redis.call("ZREM", ns .. ":delayed", id)
  make_ready(id)
end

local claimed = redis.call("ZPOPMIN", ns .. ":waiting")
if #claimed == 0 then
  claimed = redis.call("ZPOPMIN", ns .. ":prioritized")
end
if #claimed == 0 then
  return false
end
local id = claimed[1]
local key = job_key(id)
redis.call("HINCRBY", key, "attempts_made", 1)
redis.call("HSET", key, "state", "active", "processed_at", now)
redis.call("ZADD", ns .. ":active", now + tonumber(ARGV[2]), id)
return id
"#;

/// ARGV: id, attempt, lock_until. Returns 1 if the lock was extended.
const EXTEND_LOCK: &str = r#"
if check_claim(ARGV[1], ARGV[2]) == 1 then
  redis.call("ZADD", ns .. ":active", "XX", ARGV[3], ARGV[1])
  return 1
end
return 0
"#;

/// ARGV: id, attempt, now, return_value. Returns the result of `check_claim`.
const COMPLETE: &str = r#"
local id = ARGV[1]
local status = check_claim(id, ARGV[2])
if status ~= 1 then return status end
redis.call("HSET", job_key(id), "return_value", ARGV[4])
finish(id, "completed", tonumber(ARGV[3]))
return 1
"#;

/// ARGV: id, attempt, now, retry_at, error_type, message.
///
/// Returns `{status, attempt}` where status is the result of `check_claim`.
const RETRY: &str = r#"
local id = ARGV[1]
local status = check_claim(id, ARGV[2])
if status ~= 1 then return {status, 0} end
local attempt = record_error(id, ARGV[5], ARGV[6], tonumber(ARGV[3]))
redis.call("ZREM", ns .. ":active", id)
redis.call("ZADD", ns .. ":delayed", ARGV[4], id)
redis.call("HSET", job_key(id), "state", "delayed", "scheduled_at", ARGV[4])
return {1, attempt}
"#;

/// ARGV: id, attempt, now, error_type, message.
///
/// Returns `{status, attempt}` where status is the result of `check_claim`.
const FAIL: &str = r#"
local id = ARGV[1]
local status = check_claim(id, ARGV[2])
if status ~= 1 then return {status, 0} end
local now = tonumber(ARGV[3])
local attempt = record_error(id, ARGV[4], ARGV[5], now)
finish(id, "failed", now)
return {1, attempt}
"#;

/// ARGV: now, error_type, message.
///
/// Returns a flat list of `id, state` pairs for every recovered job.
const RECOVER_STALLED: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call("ZRANGEBYSCORE", ns .. ":active", "-inf", "(" .. now)
local recovered = {}
for _, id in ipairs(expired) do
  local key = job_key(id)
  local attempts = tonumber(redis.call("HGET", key, "attempts_made") or "0")
  local max_attempts = tonumber(redis.call("HGET", key, "max_attempts") or "1")
  local state
  if attempts >= max_attempts then
    record_error(id, ARGV[2], ARGV[3], now)
    finish(id, "failed", now)
    state = "failed"
  else
    redis.call("ZREM", ns .. ":active", id)
    state = make_ready(id)
  end
  table.insert(recovered, id)
  table.insert(recovered, state)
end
return recovered
"#;

/// ARGV: id. Returns 1 if a job was removed.
const REMOVE: &str = r#"
local id = ARGV[1]
local state = redis.call("HGET", job_key(id), "state")
if not state then return 0 end
redis.call("ZREM", ns .. ":" .. state, id)
redis.call("ZREM", ns .. ":expiry", id)
redis.call("DEL", job_key(id), errors_key(id))
return 1
"#;

/// ARGV: now. Returns the number of removed jobs.
const PRUNE: &str = r#"
local expired = redis.call("ZRANGEBYSCORE", ns .. ":expiry", "-inf", ARGV[1])
local removed = 0
for _, id in ipairs(expired) do
  local state = redis.call("HGET", job_key(id), "state")
  if state == "completed" or state == "failed" then
    redis.call("ZREM", ns .. ":" .. state, id)
    redis.call("DEL", job_key(id), errors_key(id))
    removed = removed + 1
  end
  redis.call("ZREM", ns .. ":expiry", id)
end
return removed
"#;

/// ARGV: key, entry, next_run_at. Returns 1 if the entry was inserted.
const ADD_REPEATABLE: &str = r#"
if redis.call("HSETNX", ns .. ":repeat", ARGV[1], ARGV[2]) == 1 then
  redis.call("ZADD", ns .. ":repeat:next", ARGV[3], ARGV[1])
  return 1
end
return 0
"#;

/// ARGV: key, next_run_at. Returns 1 if the entry exists.
const ADVANCE_REPEATABLE: &str = r#"
if redis.call("HEXISTS", ns .. ":repeat", ARGV[1]) == 1 then
  redis.call("ZADD", ns .. ":repeat:next", ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

/// ARGV: key. Returns `{entry, next_run_at}` of the removed entry or nil.
const REMOVE_REPEATABLE: &str = r#"
local entry = redis.call("HGET", ns .. ":repeat", ARGV[1])
if not entry then return false end
local next_run_at = redis.call("ZSCORE", ns .. ":repeat:next", ARGV[1])
redis.call("HDEL", ns .. ":repeat", ARGV[1])
redis.call("ZREM", ns .. ":repeat:next", ARGV[1])
return {entry, next_run_at}
"#;

fn script(body: &str) -> Script {
    Script::new(&format!("{PRELUDE}\n{body}"))
}

/// The loaded scripts of a backend.
pub(crate) struct Scripts {
    pub enqueue: Script,
    pub claim: Script,
    pub extend_lock: Script,
    pub complete: Script,
    pub retry: Script,
    pub fail: Script,
    pub recover_stalled: Script,
    pub remove: Script,
    pub prune: Script,
    pub add_repeatable: Script,
    pub advance_repeatable: Script,
    pub remove_repeatable: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: script(ENQUEUE),
            claim: script(CLAIM),
            extend_lock: script(EXTEND_LOCK),
            complete: script(COMPLETE),
            retry: script(RETRY),
            fail: script(FAIL),
            recover_stalled: script(RECOVER_STALLED),
            remove: script(REMOVE),
            prune: script(PRUNE),
            add_repeatable: script(ADD_REPEATABLE),
            advance_repeatable: script(ADVANCE_REPEATABLE),
            remove_repeatable: script(REMOVE_REPEATABLE),
        }
    }
}
