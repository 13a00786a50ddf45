//! Live Ingest HLS Gateway
//!
//! Browser capture clients push a growing media recording over a WebSocket;
//! the gateway appends it to disk, runs ffmpeg against the growing file to
//! produce a live HLS playlist, and derives an accelerated (timelapse)
//! rendition on demand.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        remotemedia-ingest-hls                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐                                                   │
//! │  │  HTTP API Server │ ← GET /ws (start / chunk / stop)                  │
//! │  │  (axum)          │ ← GET /watch/:user/:challenge                     │
//! │  └────────┬─────────┘ ← GET /timelapse/:user/:challenge                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌────────────────────┐  │
//! │  │ Stream Controller│──▶│ Session Registry │──▶│  Ingest Sink       │  │
//! │  │                  │   │ (sessions map)   │   │  (recording.webm)  │  │
//! │  └───┬──────────┬───┘   └──────────────────┘   └────────────────────┘  │
//! │      │          │                                                       │
//! │      ▼          ▼                                                       │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌────────────────────┐  │
//! │  │ Transcode        │   │ Timelapse Gate   │   │ Manifest Rewriter  │  │
//! │  │ Supervisor       │   │ (single flight)  │   │ (absolute URLs)    │  │
//! │  └────────┬─────────┘   └────────┬─────────┘   └────────────────────┘  │
//! │           │ spawns               │ spawns                               │
//! │           ▼                      ▼                                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  ffmpeg → live.m3u8 + live_NNNNN.ts / timelapse.m3u8              │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod key;
pub mod layout;
pub mod manifest;
pub mod metrics;
pub mod session;
pub mod sink;
pub mod timelapse;
pub mod transcoder;
