//! Real-time Freezing-of-Gait detection.
//!
//! A producer thread turns a sensor stream (binary frames or text lines) into
//! [`types::RawSample`]s on a [`sample_queue`]; the consumer thread's
//! [`scheduler::CycleScheduler`] slides a window over them at a fixed rate, extracts
//! two feature vectors, fuses the pre-freeze and freeze classifier outputs into a
//! [`types::Decision`] and publishes it.

#[cfg(feature = "ble")]
pub mod ble;
pub mod classifier;
pub mod config;
pub mod csv_loader;
pub mod feature_extractor;
pub mod frame_decoder;
pub mod fusion;
pub mod sample_queue;
pub mod scheduler;
pub mod schema;
pub mod shutdown;
pub mod spectral;
pub mod stats;
pub mod transport;
pub mod types;
pub mod wavelet;
pub mod window_buffer;
