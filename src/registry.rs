// src/registry.rs

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;

use crate::job::Job;

/// Handler functions take the serialized worker payload and return the
/// deserialized `Job` trait object.
pub type HandlerFn = fn(String) -> BoxFuture<'static, Result<Box<dyn Job>>>;

/// Global job registry holding job name → handler mappings. Populated before
/// the engine boots; workers dispatch on `JobMessage::job_type`.
pub static JOB_REGISTRY: Lazy<Mutex<HashMap<&'static str, HandlerFn>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a job type and its deserialization handler.
pub fn register_job(name: &'static str, handler: HandlerFn) {
    JOB_REGISTRY.lock().unwrap().insert(name, handler);
}

/// Look up the handler for a job type, if one is registered.
pub fn get_job_handler(name: &str) -> Option<HandlerFn> {
    JOB_REGISTRY.lock().unwrap().get(name).copied()
}
