//! # Dice Scale Server
//!
//! Load-cell acquisition and real-time session coordination for a
//! dice-and-scale guessing game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DICE SCALE SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  sensor/         - Load cell (one bus, one mutex)            │
//! │  ├── bus.rs      - Bus trait, HX711 protocol, simulator      │
//! │  ├── gpio.rs     - HX711 lines on a gpiochip (Linux)         │
//! │  ├── filter.rs   - Outlier rejection and median              │
//! │  ├── retry.rs    - Bounded retry with reinitialize           │
//! │  ├── calibration.rs - Profile and its JSON record            │
//! │  └── driver.rs   - Read, tare, calibrate, cleanup            │
//! │                                                              │
//! │  session/        - Durable sessions                          │
//! │  ├── model.rs    - Session, settings, game state             │
//! │  └── registry.rs - Store with 6-hour expiry                  │
//! │                                                              │
//! │  network/        - Real-time layer                           │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── hub.rs      - Live rooms and fan-out                    │
//! │  └── server.rs   - WebSocket server and routing              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Durable sessions and live rooms share id strings but are otherwise
//! independent: creating a room does not create a record, and deleting a
//! record does not close a room.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod network;
pub mod sensor;
pub mod session;

// Re-export commonly used types
pub use config::ServerConfig;
pub use network::{Gateway, RealtimeHub, ScaleServer};
pub use sensor::{CalibrationProfile, SensorConfig, SensorDriver, WeightReading};
pub use session::{GameSettings, GameState, Session, SessionRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
