// src/poller.rs - Per-connection poll worker
//
// One worker per connection. Each poll cycle reads the connection's
// registers in contiguous blocks and publishes one batch to the connection's
// `RegisterCache`. Read failures become `success = false` samples; they never
// reach the engine as errors.

use crate::cache::{RegisterCache, RegisterKey, RegisterSample};
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::protocols::{open_source, RegisterSource, SourceError};
use crate::register::{FunctionCode, RegisterDefinition};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Largest number of words requested in one read
pub const MAX_BLOCK_WORDS: u16 = 100;

// ============================================================================
// BLOCK PLANNING
// ============================================================================

/// One contiguous read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    pub function_code: FunctionCode,
    pub start: u16,
    pub count: u16,
    /// Register key, word offset inside the block, word count
    pub registers: Vec<(RegisterKey, usize, usize)>,
}

/// Group registers into contiguous blocks per function code
///
/// Blocks never exceed [`MAX_BLOCK_WORDS`] and a register never straddles two
/// blocks.
pub fn plan_blocks(registers: &[RegisterDefinition]) -> Vec<ReadBlock> {
    let mut sorted: Vec<&RegisterDefinition> = registers.iter().collect();
    sorted.sort_by_key(|r| (r.function_code, r.address));

    let mut blocks: Vec<ReadBlock> = Vec::new();
    for reg in sorted {
        let words = reg.word_count() as u16;
        let key = RegisterKey::new(reg.function_code, reg.address);

        if let Some(block) = blocks.last_mut() {
            let contiguous = block.function_code == reg.function_code
                && block.start as u32 + block.count as u32 == reg.address as u32;
            if contiguous && block.count + words <= MAX_BLOCK_WORDS {
                block.registers.push((key, block.count as usize, words as usize));
                block.count += words;
                continue;
            }
        }

        blocks.push(ReadBlock {
            function_code: reg.function_code,
            start: reg.address,
            count: words,
            registers: vec![(key, 0, words as usize)],
        });
    }
    blocks
}

// ============================================================================
// STATUS
// ============================================================================

/// Connection health counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollerStatus {
    pub connection: String,
    pub polls: u64,
    pub errors: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Last poll cycle completed without a failed block
    pub connected: bool,
}

// ============================================================================
// WORKER
// ============================================================================

/// Handle to a running poll worker
pub struct PollerHandle {
    config_tx: watch::Sender<ConnectionConfig>,
    stop_tx: watch::Sender<bool>,
    cache: RegisterCache,
    status: Arc<RwLock<PollerStatus>>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    pub fn cache(&self) -> RegisterCache {
        self.cache.clone()
    }

    pub fn status(&self) -> PollerStatus {
        self.status.read().clone()
    }

    pub fn connection(&self) -> ConnectionConfig {
        self.config_tx.borrow().clone()
    }

    /// Hand the worker a new connection definition
    pub fn reconfigure(&self, config: ConnectionConfig) -> Result<()> {
        open_source(&config)?;
        self.config_tx.send_replace(config);
        Ok(())
    }

    /// Stop polling, close the transport and wait for the worker to exit
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            warn!("poll worker ended abnormally: {}", e);
        }
    }
}

/// Poll worker state
pub struct PollWorker {
    unit_id: String,
    config: ConnectionConfig,
    blocks: Vec<ReadBlock>,
    source: Box<dyn RegisterSource>,
    cache: RegisterCache,
    status: Arc<RwLock<PollerStatus>>,
}

impl PollWorker {
    pub fn new(
        unit_id: impl Into<String>,
        config: ConnectionConfig,
        source: Box<dyn RegisterSource>,
        cache: RegisterCache,
    ) -> Self {
        let status = PollerStatus {
            connection: config.name.clone(),
            ..Default::default()
        };
        Self {
            unit_id: unit_id.into(),
            blocks: plan_blocks(&config.registers),
            config,
            source,
            cache,
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub fn status(&self) -> PollerStatus {
        self.status.read().clone()
    }

    /// Spawn a worker for `config` using the transport it names
    pub fn spawn(unit_id: impl Into<String>, config: ConnectionConfig) -> Result<PollerHandle> {
        let source = open_source(&config)?;
        let cache = RegisterCache::new();
        let worker = PollWorker::new(unit_id, config.clone(), source, cache.clone());
        let status = worker.status.clone();

        let (config_tx, config_rx) = watch::channel(config);
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(worker.run(config_rx, stop_rx));

        Ok(PollerHandle {
            config_tx,
            stop_tx,
            cache,
            status,
            join,
        })
    }

    /// Read every block once and publish the batch
    pub async fn poll_once(&mut self) {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut batch = Vec::with_capacity(self.blocks.iter().map(|b| b.registers.len()).sum());
        let mut failed_blocks = 0u64;
        let mut last_error = None;

        for block in &self.blocks {
            let read = tokio::time::timeout(
                timeout,
                self.source.read(block.function_code, block.start, block.count),
            )
            .await
            .unwrap_or(Err(SourceError::Timeout(self.config.timeout_ms)))
            .and_then(|words| {
                if words.len() < block.count as usize {
                    Err(SourceError::ShortRead {
                        expected: block.count as usize,
                        actual: words.len(),
                    })
                } else {
                    Ok(words)
                }
            });
            let read_at = Utc::now();

            match read {
                Ok(words) => {
                    for (key, offset, len) in &block.registers {
                        let slice = words[*offset..*offset + *len].to_vec();
                        batch.push((*key, RegisterSample::ok(slice, read_at)));
                    }
                }
                Err(e) => {
                    debug!(
                        "[{}/{}] block fc={} @{} x{} failed: {}",
                        self.unit_id,
                        self.config.name,
                        block.function_code.code(),
                        block.start,
                        block.count,
                        e
                    );
                    failed_blocks += 1;
                    last_error = Some(e.to_string());
                    for (key, _, _) in &block.registers {
                        batch.push((*key, RegisterSample::failed(read_at)));
                    }
                }
            }
        }

        self.cache.publish(batch);

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("gcs_polls_total").increment(1);
            metrics::counter!("gcs_poll_errors_total").increment(failed_blocks);
        }

        let mut status = self.status.write();
        status.polls += 1;
        status.errors += failed_blocks;
        status.last_poll = Some(Utc::now());
        status.connected = failed_blocks == 0;
        if last_error.is_some() {
            status.last_error = last_error;
        }
    }

    /// Swap in a new connection definition between polls
    async fn apply(&mut self, config: ConnectionConfig) {
        if config == self.config {
            return;
        }
        let new_source = config.transport != self.config.transport
            || config.slave_id != self.config.slave_id
            || config.registers != self.config.registers;
        if new_source {
            match open_source(&config) {
                Ok(source) => {
                    self.source.close().await;
                    self.source = source;
                }
                Err(e) => {
                    warn!("[{}/{}] keeping previous transport: {}", self.unit_id, config.name, e);
                    return;
                }
            }
        }

        self.blocks = plan_blocks(&config.registers);
        let keys: Vec<RegisterKey> = config
            .registers
            .iter()
            .map(|r| RegisterKey::new(r.function_code, r.address))
            .collect();
        self.cache.retain(|k| keys.contains(k));
        self.status.write().connection = config.name.clone();
        info!(
            "[{}/{}] connection reconfigured ({} blocks)",
            self.unit_id,
            config.name,
            self.blocks.len()
        );
        self.config = config;
    }

    /// Poll until stopped; the in-flight poll completes before exit
    pub async fn run(
        mut self,
        mut config_rx: watch::Receiver<ConnectionConfig>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!(
            "[{}/{}] polling {} every {} ms via {}",
            self.unit_id,
            self.config.name,
            self.config.registers.len(),
            self.config.poll_interval_ms,
            self.source.describe()
        );

        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = config_rx.borrow_and_update().clone();
                    let new_interval = config.poll_interval_ms != self.config.poll_interval_ms;
                    self.apply(config).await;
                    if new_interval {
                        ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                _ = stop_rx.changed() => {
                    break;
                }
            }
        }

        self.source.close().await;
        info!("[{}/{}] poll worker stopped", self.unit_id, self.config.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use crate::register::DataType;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn reg(name: &str, address: u16, data_type: DataType) -> RegisterDefinition {
        RegisterDefinition::new(name, address, data_type)
    }

    fn connection(registers: Vec<RegisterDefinition>) -> ConnectionConfig {
        ConnectionConfig {
            name: "panel".into(),
            transport: Transport::Simulated { seed: 0, step_fraction: 0.0 },
            slave_id: 1,
            poll_interval_ms: 10,
            timeout_ms: 50,
            registers,
        }
    }

    /// Serves fixed words per address; fails reads covering `fail_at`
    struct FakeDevice {
        words: HashMap<u16, u16>,
        fail_at: Option<u16>,
        hang: bool,
    }

    #[async_trait]
    impl RegisterSource for FakeDevice {
        async fn read(
            &mut self,
            _fc: FunctionCode,
            address: u16,
            count: u16,
        ) -> std::result::Result<Vec<u16>, SourceError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if let Some(bad) = self.fail_at {
                if bad >= address && bad < address + count {
                    return Err(SourceError::Disconnected("fake".into()));
                }
            }
            Ok((address..address + count)
                .map(|a| self.words.get(&a).copied().unwrap_or(0))
                .collect())
        }

        async fn close(&mut self) {}

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    #[test]
    fn test_plan_groups_contiguous_registers() {
        let regs = vec![
            reg("a", 0, DataType::Uint16),
            reg("b", 1, DataType::Float32),
            reg("c", 3, DataType::Int16),
            reg("d", 10, DataType::Uint16),
        ];
        let blocks = plan_blocks(&regs);
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].start, blocks[0].count), (0, 4));
        assert_eq!(blocks[0].registers[1], (RegisterKey::new(FunctionCode::HoldingRegisters, 1), 1, 2));
        assert_eq!((blocks[1].start, blocks[1].count), (10, 1));
    }

    #[test]
    fn test_plan_splits_by_function_code_and_size() {
        let mut regs: Vec<RegisterDefinition> = (0..99)
            .map(|i| reg(&format!("r{}", i), i, DataType::Uint16))
            .collect();
        // Would make 101 words; must start a new block instead of straddling
        regs.push(reg("wide", 99, DataType::Float32));
        let mut input = reg("in", 0, DataType::Uint16);
        input.function_code = FunctionCode::InputRegisters;
        regs.push(input);

        let blocks = plan_blocks(&regs);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].count, 99);
        assert_eq!((blocks[1].start, blocks[1].count), (99, 2));
        assert_eq!(blocks[2].function_code, FunctionCode::InputRegisters);
        assert!(blocks.iter().all(|b| b.count <= MAX_BLOCK_WORDS));
    }

    #[tokio::test]
    async fn test_poll_once_publishes_and_marks_failures() {
        let regs = vec![
            reg("a", 0, DataType::Uint16),
            reg("b", 1, DataType::Uint16),
            reg("c", 20, DataType::Uint16),
        ];
        let device = FakeDevice {
            words: HashMap::from([(0, 11), (1, 22), (20, 33)]),
            fail_at: Some(20),
            hang: false,
        };
        let cache = RegisterCache::new();
        let mut worker = PollWorker::new("U1", connection(regs), Box::new(device), cache.clone());
        worker.poll_once().await;

        let view = cache.snapshot();
        let key = |a| RegisterKey::new(FunctionCode::HoldingRegisters, a);
        assert_eq!(view[&key(0)].words, vec![11]);
        assert_eq!(view[&key(1)].words, vec![22]);
        assert!(!view[&key(20)].success);

        let status = worker.status();
        assert_eq!(status.polls, 1);
        assert_eq!(status.errors, 1);
        assert!(!status.connected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_hung_read_times_out() {
        let device = FakeDevice {
            words: HashMap::new(),
            fail_at: None,
            hang: true,
        };
        let cache = RegisterCache::new();
        let mut worker = PollWorker::new(
            "U1",
            connection(vec![reg("a", 0, DataType::Uint16)]),
            Box::new(device),
            cache.clone(),
        );
        worker.poll_once().await;
        let view = cache.snapshot();
        assert!(!view[&RegisterKey::new(FunctionCode::HoldingRegisters, 0)].success);
        assert!(worker.status().last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_spawned_worker_fills_cache_and_stops() {
        let mut r = reg("a", 5, DataType::Uint16);
        r.min_valid = Some(0.0);
        r.max_valid = Some(1000.0);
        let handle = PollWorker::spawn("U1", connection(vec![r])).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.status().polls >= 1);
        assert!(handle.cache().snapshot().contains_key(&RegisterKey::new(FunctionCode::HoldingRegisters, 5)));
        handle.stop().await;
    }
}
