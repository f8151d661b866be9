// Server-resident Lua scripts.
//
// All state changes happen inside these scripts so that a sweep + check +
// insert is one atomic step on the server. Every script first receives the
// ledger keys (KEYS[1] = global, optional KEYS[2] = tenant); numeric ARGVs
// arrive as decimal strings and are read through `tonumber`.
//
// Expiry convention: a member with `score <= now_ms` is gone. Key-level
// TTLs are extend-only — PEXPIRE runs only when it would push the TTL out.

use redis::Script;

/// Script status codes, first element of every mutating script's reply.
pub(crate) const STATUS_OK: i64 = 0;
pub(crate) const STATUS_CAPACITY_FULL: i64 = 1;
pub(crate) const STATUS_TENANT_QUOTA_EXCEEDED: i64 = 2;
pub(crate) const STATUS_NOT_HELD: i64 = 3;

/// Acquire: sweep both ledgers, check capacity and tenant quota, insert.
///
/// KEYS[1] = global ledger, KEYS[2] = tenant ledger (optional).
/// ARGV = (now_ms, expires_ms, permit_id, capacity, tenant_quota, margin_ms).
/// Returns {status, global_count, tenant_count}.
const ACQUIRE_LUA: &str = r#"
local now = tonumber(ARGV[1])
local expires = tonumber(ARGV[2])
local permit_id = ARGV[3]
local capacity = tonumber(ARGV[4])
local tenant_quota = tonumber(ARGV[5])
local margin = tonumber(ARGV[6])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if KEYS[2] then
    redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now)
end

local global_count = redis.call('ZCARD', KEYS[1])
if global_count >= capacity then
    return {1, global_count, 0}
end

local tenant_count = 0
if KEYS[2] then
    tenant_count = redis.call('ZCARD', KEYS[2])
    if tenant_count >= tenant_quota then
        return {2, global_count, tenant_count}
    end
end

redis.call('ZADD', KEYS[1], expires, permit_id)
local key_ttl = expires - now + margin
if redis.call('PTTL', KEYS[1]) < key_ttl then
    redis.call('PEXPIRE', KEYS[1], key_ttl)
end
if KEYS[2] then
    redis.call('ZADD', KEYS[2], expires, permit_id)
    if redis.call('PTTL', KEYS[2]) < key_ttl then
        redis.call('PEXPIRE', KEYS[2], key_ttl)
    end
    tenant_count = tenant_count + 1
end

return {0, global_count + 1, tenant_count}
"#;

/// Release: remove the member from both ledgers.
///
/// KEYS as in acquire. ARGV = (permit_id).
/// Returns {status, removed}; status 3 when the global ledger had no member.
const RELEASE_LUA: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if KEYS[2] then
    redis.call('ZREM', KEYS[2], ARGV[1])
end
if removed == 0 then
    return {3, 0}
end
return {0, removed}
"#;

/// Extend: move a live member's score forward.
///
/// KEYS as in acquire. ARGV = (now_ms, new_expires_ms, permit_id, margin_ms).
/// Returns {status}; status 3 when the member is missing or already expired
/// (expired residue is removed on the way out).
const EXTEND_LUA: &str = r#"
local now = tonumber(ARGV[1])
local expires = tonumber(ARGV[2])
local permit_id = ARGV[3]
local margin = tonumber(ARGV[4])

local score = redis.call('ZSCORE', KEYS[1], permit_id)
if not score or tonumber(score) <= now then
    redis.call('ZREM', KEYS[1], permit_id)
    if KEYS[2] then
        redis.call('ZREM', KEYS[2], permit_id)
    end
    return {3}
end

redis.call('ZADD', KEYS[1], 'XX', expires, permit_id)
local key_ttl = expires - now + margin
if redis.call('PTTL', KEYS[1]) < key_ttl then
    redis.call('PEXPIRE', KEYS[1], key_ttl)
end
if KEYS[2] then
    redis.call('ZADD', KEYS[2], 'XX', expires, permit_id)
    if redis.call('PTTL', KEYS[2]) < key_ttl then
        redis.call('PEXPIRE', KEYS[2], key_ttl)
    end
end

return {0}
"#;

/// Query: count live members without touching anything.
///
/// KEYS as in acquire. ARGV = (now_ms).
/// Returns {global_count, tenant_count}.
const QUERY_LUA: &str = r#"
local live = '(' .. ARGV[1]
local global_count = redis.call('ZCOUNT', KEYS[1], live, '+inf')
local tenant_count = 0
if KEYS[2] then
    tenant_count = redis.call('ZCOUNT', KEYS[2], live, '+inf')
end
return {global_count, tenant_count}
"#;

/// A named script; the name lets test runners dispatch without parsing Lua.
pub struct SemScript {
    pub name: &'static str,
    pub script: Script,
}

impl SemScript {
    fn new(name: &'static str, lua: &str) -> Self {
        Self { name, script: Script::new(lua) }
    }
}

/// The four scripts, compiled once per semaphore instance.
pub(crate) struct Scripts {
    pub acquire: SemScript,
    pub release: SemScript,
    pub extend: SemScript,
    pub query: SemScript,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            acquire: SemScript::new("acquire", ACQUIRE_LUA),
            release: SemScript::new("release", RELEASE_LUA),
            extend: SemScript::new("extend", EXTEND_LUA),
            query: SemScript::new("query", QUERY_LUA),
        }
    }
}
