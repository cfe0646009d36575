//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use objectdb_runtime::{
    Database, ErrorSink, Factory, ListenerError, StoreParameters,
};

/// Error sink that keeps every report.
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, txn: u64, request: u64, error: &ListenerError) {
        self.reports
            .lock()
            .unwrap()
            .push(format!("txn {} request {}: {}", txn, request, error));
    }
}

/// Opens `books` at version 1 with an in-line keyed `books` store.
pub async fn open_books(factory: &Factory) -> Database {
    factory
        .open_with_upgrade("books", Some(1), |vc| {
            vc.create_object_store("books", StoreParameters::with_key_path("isbn"))?;
            Ok(())
        })
        .await
        .unwrap()
}

/// Opens `name` at version 1 with one out-of-line keyed store `s`.
pub async fn open_plain(factory: &Factory, name: &str) -> Database {
    factory
        .open_with_upgrade(name, Some(1), |vc| {
            vc.create_object_store("s", StoreParameters::default())?;
            Ok(())
        })
        .await
        .unwrap()
}

pub fn collecting_factory() -> (Factory, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let factory = Factory::with_error_sink(Default::default(), sink.clone()).unwrap();
    (factory, sink)
}
