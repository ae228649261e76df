//! Modbus Connect daemon.
//!
//! Loads gateway and entity configuration (JSON5) and drives the core
//! polling engine: one poll coordinator per configured gateway, all
//! sharing the process-wide connection registry.
//!
//! # Configuration
//!
//! ```text
//! {
//!     gateways: [
//!         {
//!             host: "192.168.1.10",          // port defaults to 502
//!             slave_id: 1,
//!             refresh_interval_seconds: 30,
//!             max_read_size: 8,
//!             entities: [
//!                 { key: "temperature", register_address: 100, multiplier: 0.1 },
//!             ],
//!         },
//!     ],
//! }
//! ```

pub mod config;
