pub mod app;
pub mod db;
pub mod engine;
pub mod error;
pub mod offload;
pub mod queue;
pub mod reconcile;
pub mod sandbox;
pub mod service;
pub mod settings;
pub mod storage;
pub mod worker;

pub use app::AppComponents;
pub use error::{CoreError, ErrorKind};
