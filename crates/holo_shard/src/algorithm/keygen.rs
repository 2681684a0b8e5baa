//! Key generators for INSERT statements that omit the key column.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Result, ShardingError};
use crate::value::SqlValue;

use super::{AlgorithmProps, AlgorithmRegistry, KeyGenerator};

pub(crate) fn register(registry: &mut AlgorithmRegistry) {
    registry.register_key_generator("SNOWFLAKE", |props| {
        Ok(Arc::new(SnowflakeKeyGenerator::new(props)?) as Arc<dyn KeyGenerator>)
    });
    registry.register_key_generator("UUID", |_| {
        Ok(Arc::new(UuidKeyGenerator) as Arc<dyn KeyGenerator>)
    });
}

/// 2016-11-01T00:00:00Z in milliseconds.
pub const SNOWFLAKE_EPOCH_MILLIS: i64 = 1_477_958_400_000;

const SEQUENCE_BITS: u32 = 12;
const WORKER_ID_BITS: u32 = 10;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const MAX_WORKER_ID: i64 = (1 << WORKER_ID_BITS) - 1;
const DEFAULT_MAX_TOLERATE_MILLIS: i64 = 10;

fn system_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Default)]
struct SnowflakeState {
    last_millis: i64,
    sequence: i64,
}

/// 64-bit time-ordered ids: `(millis - epoch) << 22 | worker << 12 | sequence`.
///
/// Each new millisecond starts its sequence at a random offset up to
/// `max-vibration-offset`, so low-traffic tables do not get only even keys.
pub struct SnowflakeKeyGenerator {
    worker_id: i64,
    max_vibration_offset: i64,
    max_tolerate_millis: i64,
    clock: fn() -> i64,
    state: Mutex<SnowflakeState>,
}

impl SnowflakeKeyGenerator {
    pub fn new(props: &AlgorithmProps) -> Result<Self> {
        let worker_id: i64 = props.parse_or("SNOWFLAKE", "worker-id", 0)?;
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(ShardingError::Config(format!(
                "SNOWFLAKE `worker-id` must be within [0, {MAX_WORKER_ID}], got {worker_id}"
            )));
        }
        let max_vibration_offset: i64 = props.parse_or("SNOWFLAKE", "max-vibration-offset", 1)?;
        if !(0..=SEQUENCE_MASK).contains(&max_vibration_offset) {
            return Err(ShardingError::Config(format!(
                "SNOWFLAKE `max-vibration-offset` must be within [0, {SEQUENCE_MASK}]"
            )));
        }
        let max_tolerate_millis: i64 = props.parse_or(
            "SNOWFLAKE",
            "max-tolerate-time-difference-milliseconds",
            DEFAULT_MAX_TOLERATE_MILLIS,
        )?;
        Ok(Self {
            worker_id,
            max_vibration_offset,
            max_tolerate_millis,
            clock: system_millis,
            state: Mutex::new(SnowflakeState::default()),
        })
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    fn wait_until_after(&self, last: i64) -> i64 {
        let mut now = (self.clock)();
        while now <= last {
            std::thread::yield_now();
            now = (self.clock)();
        }
        now
    }

    pub fn next_id(&self) -> Result<i64> {
        let mut state = self.state.lock();
        let mut now = (self.clock)();
        if now < state.last_millis {
            let behind = state.last_millis - now;
            if behind > self.max_tolerate_millis {
                return Err(ShardingError::Config(format!(
                    "clock moved backwards by {behind}ms, refusing to generate snowflake ids"
                )));
            }
            std::thread::sleep(std::time::Duration::from_millis(behind as u64));
            now = self.wait_until_after(state.last_millis - 1);
        }

        if now == state.last_millis {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                now = self.wait_until_after(state.last_millis);
                state.sequence = self.vibration();
            }
        } else {
            state.sequence = self.vibration();
        }
        state.last_millis = now;

        Ok(((now - SNOWFLAKE_EPOCH_MILLIS) << (SEQUENCE_BITS + WORKER_ID_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence)
    }

    fn vibration(&self) -> i64 {
        if self.max_vibration_offset == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_vibration_offset)
        }
    }
}

impl KeyGenerator for SnowflakeKeyGenerator {
    fn kind(&self) -> &str {
        "SNOWFLAKE"
    }

    fn generate_key(&self) -> Result<SqlValue> {
        self.next_id().map(SqlValue::Int)
    }
}

/// Random UUID v4 rendered without hyphens.
#[derive(Debug, Default)]
pub struct UuidKeyGenerator;

impl KeyGenerator for UuidKeyGenerator {
    fn kind(&self) -> &str {
        "UUID"
    }

    fn generate_key(&self) -> Result<SqlValue> {
        Ok(SqlValue::Text(uuid::Uuid::new_v4().simple().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_clock() -> i64 {
        SNOWFLAKE_EPOCH_MILLIS + 1_000
    }

    #[test]
    fn snowflake_ids_encode_worker_and_increase() {
        let generator =
            SnowflakeKeyGenerator::new(&AlgorithmProps::new().with("worker-id", "7"))
                .expect("snowflake");
        let mut previous = 0;
        for _ in 0..1_000 {
            let id = generator.next_id().expect("id");
            assert!(id > previous, "{id} <= {previous}");
            assert_eq!((id >> SEQUENCE_BITS) & MAX_WORKER_ID, 7);
            previous = id;
        }
    }

    #[test]
    fn snowflake_sequence_advances_within_one_millisecond() {
        let generator = SnowflakeKeyGenerator::new(
            &AlgorithmProps::new().with("max-vibration-offset", "0"),
        )
        .expect("snowflake")
        .with_clock(fixed_clock);
        let first = generator.next_id().expect("id");
        let second = generator.next_id().expect("id");
        assert_eq!(first >> 22, 1_000);
        assert_eq!(first & SEQUENCE_MASK, 0);
        assert_eq!(second & SEQUENCE_MASK, 1);
    }

    #[test]
    fn snowflake_rejects_out_of_range_worker() {
        let err = SnowflakeKeyGenerator::new(&AlgorithmProps::new().with("worker-id", "1024"))
            .err()
            .expect("invalid worker");
        assert!(err.to_string().contains("worker-id"));
    }

    #[test]
    fn uuid_keys_are_32_hex_chars() {
        let key = UuidKeyGenerator.generate_key().expect("uuid");
        let SqlValue::Text(text) = key else {
            panic!("expected text key");
        };
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn registry_builds_key_generators_by_name() {
        let registry = AlgorithmRegistry::with_builtins();
        let generator = registry
            .create_key_generator("snowflake", &AlgorithmProps::new())
            .expect("snowflake");
        assert_eq!(generator.kind(), "SNOWFLAKE");
        assert!(registry
            .create_key_generator("SEQUENCE", &AlgorithmProps::new())
            .is_err());
    }
}
