pub mod advisor;
pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod mediapipe_bridge;
pub mod model;
pub mod pose;
pub mod ui;
pub mod video;
