//! The delivery daemon: gateway client, backoff, attempt log, polling worker.

pub mod backoff;
pub mod gateway;
pub mod log;
pub mod worker;

pub use gateway::{HttpGateway, SessionGateway};
pub use worker::{DeliveryStats, DeliveryWorker};
