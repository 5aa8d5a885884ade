//! GCS Engine - signal resolution and alarm evaluation for gas compressor stations
//!
//! Polls Modbus devices per compressor unit, resolves every configured
//! parameter through a prioritized fallback chain (live register, calculated
//! formula, manual entry, default), evaluates ISA-style alarm setpoints with
//! hysteresis and debounce, and publishes one quality-tagged snapshot per
//! unit per tick.
//!
//! # Feature Flags
//!
//! - `modbus-support`: Modbus TCP transport via `tokio-modbus`
//! - `metrics`: tick, alarm and reload instrumentation via `metrics`
//!
//! # Examples
//!
//! ```rust,no_run
//! use gcs_engine::{Station, StationConfig};
//!
//! # async fn run() -> gcs_engine::Result<()> {
//! gcs_engine::init();
//!
//! let station = StationConfig::from_file("config/station.yaml")?;
//! let running = Station::start(station).await?;
//!
//! let mut snapshots = running.handle("CU-101")?.subscribe();
//! if let Ok(snapshot) = snapshots.recv().await {
//!     println!("{}", snapshot.to_json()?);
//! }
//!
//! running.stop().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error type and result alias
pub mod error;

/// Resolved values and quality tags
pub mod value;

/// Register definitions and word decoding
pub mod register;

/// Arithmetic expressions over parameter names
pub mod formula;

/// Station configuration loading and validation
pub mod config;

/// Register sample caches and manual entries
pub mod cache;

// ============================================================================
// RESOLUTION AND ALARMS
// ============================================================================

/// Fallback chain resolution
pub mod resolver;

/// Setpoint evaluation and the shutdown latch
pub mod alarms;

// ============================================================================
// ACQUISITION AND ORCHESTRATION
// ============================================================================

/// Register sources (simulated, Modbus TCP)
pub mod protocols;

/// Per-connection poll workers
pub mod poller;

/// Per-unit resolution cycle
pub mod engine;

/// Station-wide supervision of pollers and engines
pub mod station;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use alarms::{AlarmEvent, AlarmLevel, AlarmSetpoint, AlarmState, ShutdownLatch};
pub use cache::ManualEntry;
pub use config::{StationConfig, UnitConfig, ValidatedStation};
pub use engine::{EngineHandle, EngineStats, UnitEngine, UnitSnapshot};
pub use error::{EngineError, Result};
pub use register::{ByteOrder, DataType, FunctionCode, RegisterDefinition};
pub use station::Station;
pub use value::{Quality, ResolvedValue, SourceKind};

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the global tracing subscriber
///
/// Honors `RUST_LOG`, defaulting to `gcs_engine=info`. Calling it again
/// after a subscriber is installed does nothing.
pub fn init() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gcs_engine=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
