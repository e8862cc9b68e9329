mod app;
mod classifier;
mod fetcher;
mod inference;
mod model_service;
mod orchestrator;
mod ort_service;
mod queue;
mod registry;
mod routes;
mod server;
mod telemetry;

pub mod config;

pub use app::start_app;
