//! Lua sources for the server-side atomic operations, and the per-connection
//! cache of their SHA1 handles.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Payloads are passed to `redis.call` in slices of this size to stay under
/// Lua's `unpack` stack limit.
const CHUNK_HELPERS: &str = r#"
local function call_chunked(command, key, values)
  local step = 1000
  for i = 1, #values, step do
    redis.call(command, key, unpack(values, i, math.min(i + step - 1, #values)))
  end
end
"#;

// KEYS: batches index, queue, unique set
// ARGV: batch name, remember unique ('1' or '0'), messages...
const MERGE_ENQUEUE_BODY: &str = r#"
local batches = KEYS[1]
local queue = KEYS[2]
local unique_messages = KEYS[3]
local name = ARGV[1]
local remember_unique = ARGV[2] == '1'

local accepted = {}
local seen = {}
for i = 3, #ARGV do
  local message = ARGV[i]
  if not remember_unique then
    accepted[#accepted + 1] = message
  elseif not seen[message] then
    seen[message] = true
    if redis.call('sismember', unique_messages, message) == 0 then
      accepted[#accepted + 1] = message
    end
  end
end

redis.call('sadd', batches, name)
if #accepted > 0 then
  call_chunked('rpush', queue, accepted)
  if remember_unique then
    call_chunked('sadd', unique_messages, accepted)
  end
end
return #accepted
"#;

// KEYS: queue, unique set
// ARGV: limit
const PLUCK_BODY: &str = r#"
local queue = KEYS[1]
local unique_messages = KEYS[2]
local limit = tonumber(ARGV[1])

-- A huge limit would reach LPOP in exponent notation, so clamp to the length
local count = math.min(limit, redis.call('llen', queue))
if count <= 0 then
  return {}
end
local values = redis.call('lpop', queue, count)
call_chunked('srem', unique_messages, values)
return values
"#;

// KEYS: queue, unique set, pending ledger, pending job
// ARGV: limit, now (epoch ms)
const RELIABLE_PLUCK_BODY: &str = r#"
local queue = KEYS[1]
local unique_messages = KEYS[2]
local pending_jobs = KEYS[3]
local this_job = KEYS[4]
local limit = tonumber(ARGV[1])
local now = ARGV[2]

local count = math.min(limit, redis.call('llen', queue))
if count <= 0 then
  return {}
end

redis.call('zadd', pending_jobs, now, this_job)
local values = {}
for i = 1, count do
  values[i] = redis.call('lmove', queue, this_job, 'LEFT', 'RIGHT')
end
call_chunked('srem', unique_messages, values)
return values
"#;

// KEYS: pending job, queue, pending ledger, unique set
// ARGV: unique ('1' or '0')
const REQUEUE_BODY: &str = r#"
local pending_job = KEYS[1]
local queue = KEYS[2]
local pending_jobs = KEYS[3]
local unique_messages = KEYS[4]
local unique = ARGV[1] == '1'

if not redis.call('zscore', pending_jobs, pending_job) then
  return 0
end

if unique then
  local messages = redis.call('lrange', pending_job, 0, -1)
  for i = 1, #messages do
    local message = messages[i]
    if redis.call('sismember', unique_messages, message) == 0 then
      redis.call('rpush', queue, message)
      redis.call('sadd', unique_messages, message)
    end
  end
  redis.call('del', pending_job)
else
  while redis.call('lmove', pending_job, queue, 'LEFT', 'RIGHT') do
  end
end

redis.call('zrem', pending_jobs, pending_job)
return 1
"#;

/// The server-side scripts, one per atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    MergeEnqueue,
    Pluck,
    ReliablePluck,
    Requeue,
}

impl AtomicOp {
    pub const ALL: [AtomicOp; 4] = [
        AtomicOp::MergeEnqueue,
        AtomicOp::Pluck,
        AtomicOp::ReliablePluck,
        AtomicOp::Requeue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AtomicOp::MergeEnqueue => "merge_enqueue",
            AtomicOp::Pluck => "pluck",
            AtomicOp::ReliablePluck => "reliable_pluck",
            AtomicOp::Requeue => "requeue",
        }
    }

    /// Full Lua source, including shared helpers.
    pub fn source(self) -> String {
        let body = match self {
            AtomicOp::MergeEnqueue => MERGE_ENQUEUE_BODY,
            AtomicOp::Pluck => PLUCK_BODY,
            AtomicOp::ReliablePluck => RELIABLE_PLUCK_BODY,
            AtomicOp::Requeue => REQUEUE_BODY,
        };
        format!("{CHUNK_HELPERS}{body}")
    }
}

/// SHA1 handles of loaded scripts. Scoped to one connection; entries are
/// dropped when the server reports a script unknown and reloaded lazily.
#[derive(Debug, Default)]
pub struct ScriptCache {
    shas: Mutex<HashMap<AtomicOp, String>>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are plain strings, so a poisoned map is still consistent
    fn shas(&self) -> MutexGuard<'_, HashMap<AtomicOp, String>> {
        self.shas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, op: AtomicOp) -> Option<String> {
        self.shas().get(&op).cloned()
    }

    pub fn insert(&self, op: AtomicOp, sha: String) {
        self.shas().insert(op, sha);
    }

    pub fn invalidate(&self, op: AtomicOp) {
        self.shas().remove(&op);
    }

    pub fn len(&self) -> usize {
        self.shas().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_script_carries_helpers() {
        for op in AtomicOp::ALL {
            let src = op.source();
            assert!(src.contains("local function call_chunked"), "{}", op.name());
            assert!(src.contains("return"), "{}", op.name());
        }
    }

    #[test]
    fn plucks_clamp_limit_to_queue_length() {
        for op in [AtomicOp::Pluck, AtomicOp::ReliablePluck] {
            let src = op.source();
            assert!(
                src.contains("math.min(limit, redis.call('llen', queue))"),
                "{}",
                op.name()
            );
        }
    }

    #[test]
    fn cache_invalidation_drops_only_one_entry() {
        let cache = ScriptCache::new();
        assert!(cache.is_empty());
        cache.insert(AtomicOp::Pluck, "abc".to_string());
        cache.insert(AtomicOp::Requeue, "def".to_string());
        cache.invalidate(AtomicOp::Pluck);
        assert_eq!(cache.get(AtomicOp::Pluck), None);
        assert_eq!(cache.get(AtomicOp::Requeue).as_deref(), Some("def"));
        assert_eq!(cache.len(), 1);
    }
}
